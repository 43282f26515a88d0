use sea_orm_migration::prelude::*;

mod m0001_create_apps;
mod m0002_create_app_domains;
mod m0003_create_deploy_jobs;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m0001_create_apps::Migration),
            Box::new(m0002_create_app_domains::Migration),
            Box::new(m0003_create_deploy_jobs::Migration),
        ]
    }
}
