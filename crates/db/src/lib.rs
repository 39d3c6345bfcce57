//! PostgreSQL persistence for the system-wide resource lock.

use sqlx::postgres::PgPoolOptions;

pub mod repositories;

pub use repositories::lease_repo::{LeaseRepo, PgLeaseStore};

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
///
/// Workers hold at most one lease at a time, so the pool stays small.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(4)
        .connect(database_url)
        .await
}

/// Round-trip a trivial query to confirm the database is reachable.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply pending migrations from `db/migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../db/migrations").run(pool).await
}
