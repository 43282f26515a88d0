use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(DeployJobs::Table)
                    .if_not_exists()
                    // Ids are assigned by the queue, not the database.
                    .col(
                        ColumnDef::new(DeployJobs::Id)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(DeployJobs::AppName).string().not_null())
                    .col(ColumnDef::new(DeployJobs::Mode).string().not_null())
                    .col(ColumnDef::new(DeployJobs::SourceKind).string().not_null())
                    .col(ColumnDef::new(DeployJobs::Repository).string().null())
                    .col(ColumnDef::new(DeployJobs::Branch).string().null())
                    .col(ColumnDef::new(DeployJobs::UploadRef).string().null())
                    .col(ColumnDef::new(DeployJobs::Runtime).string().not_null())
                    .col(ColumnDef::new(DeployJobs::InstallCommand).text().not_null())
                    .col(ColumnDef::new(DeployJobs::BuildCommand).text().null())
                    .col(ColumnDef::new(DeployJobs::StartCommand).text().not_null())
                    .col(
                        ColumnDef::new(DeployJobs::EnvJson)
                            .text()
                            .not_null()
                            .default("{}"),
                    )
                    .col(
                        ColumnDef::new(DeployJobs::DomainsJson)
                            .text()
                            .not_null()
                            .default("[]"),
                    )
                    .col(ColumnDef::new(DeployJobs::Status).string().not_null())
                    .col(ColumnDef::new(DeployJobs::Stage).string().null())
                    .col(
                        ColumnDef::new(DeployJobs::Logs)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(DeployJobs::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(DeployJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(DeployJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(DeployJobs::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_deploy_jobs_status")
                    .table(DeployJobs::Table)
                    .col(DeployJobs::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_deploy_jobs_app_name")
                    .table(DeployJobs::Table)
                    .col(DeployJobs::AppName)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_deploy_jobs_app_name")
                    .table(DeployJobs::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_deploy_jobs_status")
                    .table(DeployJobs::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(DeployJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum DeployJobs {
    Table,
    Id,
    AppName,
    Mode,
    SourceKind,
    Repository,
    Branch,
    UploadRef,
    Runtime,
    InstallCommand,
    BuildCommand,
    StartCommand,
    EnvJson,
    DomainsJson,
    Status,
    Stage,
    Logs,
    ErrorMessage,
    CreatedAt,
    StartedAt,
    CompletedAt,
}
