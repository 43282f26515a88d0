use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AppDomains::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AppDomains::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(AppDomains::AppName).string().not_null())
                    .col(ColumnDef::new(AppDomains::Domain).string().not_null())
                    .col(
                        ColumnDef::new(AppDomains::TlsEnabled)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(AppDomains::UpstreamPort).integer().not_null())
                    .col(
                        ColumnDef::new(AppDomains::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_app_domains_domain_unique")
                    .table(AppDomains::Table)
                    .col(AppDomains::Domain)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_app_domains_app_name")
                    .table(AppDomains::Table)
                    .col(AppDomains::AppName)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_app_domains_app_name")
                    .table(AppDomains::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_app_domains_domain_unique")
                    .table(AppDomains::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(AppDomains::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AppDomains {
    Table,
    Id,
    AppName,
    Domain,
    TlsEnabled,
    UpstreamPort,
    CreatedAt,
}
