use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "apps")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub name: String,
    pub source_kind: String,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub upload_ref: Option<String>,
    pub runtime: String,
    pub install_command: String,
    pub build_command: Option<String>,
    pub start_command: String,
    pub env_json: String,
    pub port: i32,
    pub workspace: String,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
