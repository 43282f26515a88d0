use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "deploy_jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i64,
    pub app_name: String,
    pub mode: String,
    pub source_kind: String,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub upload_ref: Option<String>,
    pub runtime: String,
    pub install_command: String,
    pub build_command: Option<String>,
    pub start_command: String,
    pub env_json: String,
    pub domains_json: String,
    pub status: String,
    pub stage: Option<String>,
    #[sea_orm(column_type = "Text")]
    pub logs: String,
    pub error_message: Option<String>,
    pub created_at: DateTimeWithTimeZone,
    pub started_at: Option<DateTimeWithTimeZone>,
    pub completed_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
