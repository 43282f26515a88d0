pub use sea_orm;

use sea_orm::{ConnectOptions, Database, DatabaseConnection};

pub mod entities;

pub async fn connect(database_url: &str) -> Result<DatabaseConnection, sea_orm::DbErr> {
    let mut opts = ConnectOptions::new(database_url.to_string());
    opts.sqlx_logging(false);
    // Every pooled connection to an in-memory SQLite database sees its own empty schema.
    if database_url.starts_with("sqlite::memory:") {
        opts.max_connections(1).min_connections(1);
    }
    Database::connect(opts).await
}
