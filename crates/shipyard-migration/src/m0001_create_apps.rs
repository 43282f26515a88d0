use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Apps::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Apps::Name).string().not_null().primary_key())
                    .col(ColumnDef::new(Apps::SourceKind).string().not_null())
                    .col(ColumnDef::new(Apps::Repository).string().null())
                    .col(ColumnDef::new(Apps::Branch).string().null())
                    .col(ColumnDef::new(Apps::UploadRef).string().null())
                    .col(ColumnDef::new(Apps::Runtime).string().not_null())
                    .col(ColumnDef::new(Apps::InstallCommand).text().not_null())
                    .col(ColumnDef::new(Apps::BuildCommand).text().null())
                    .col(ColumnDef::new(Apps::StartCommand).text().not_null())
                    .col(
                        ColumnDef::new(Apps::EnvJson)
                            .text()
                            .not_null()
                            .default("{}"),
                    )
                    .col(ColumnDef::new(Apps::Port).integer().not_null())
                    .col(ColumnDef::new(Apps::Workspace).text().not_null())
                    .col(
                        ColumnDef::new(Apps::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Apps::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Apps::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Apps {
    Table,
    Name,
    SourceKind,
    Repository,
    Branch,
    UploadRef,
    Runtime,
    InstallCommand,
    BuildCommand,
    StartCommand,
    EnvJson,
    Port,
    Workspace,
    CreatedAt,
    UpdatedAt,
}
