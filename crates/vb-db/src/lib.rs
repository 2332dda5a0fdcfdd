pub mod memory;
pub mod models;
pub mod store;

pub use memory::MemoryStore;
pub use models::{NewVps, PENDING_IP, Vps, VpsState, VpsUpdate};
pub use store::{PgStore, VpsStore};

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("container id already in use: {0}")]
    DuplicateContainer(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Create a connection pool to PostgreSQL.
pub async fn create_pool(database_url: &str) -> std::result::Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Run embedded migrations.
pub async fn run_migrations(pool: &PgPool) -> std::result::Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
