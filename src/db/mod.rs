pub mod models;
pub mod registry;

use anyhow::Result;
use sqlx::{Pool, Sqlite, SqlitePool};

pub async fn init_pool(database_url: &str) -> Result<Pool<Sqlite>> {
    let pool = SqlitePool::connect(database_url).await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// In-memory store for tests. A single connection keeps every acquire on
/// the same `:memory:` database.
#[cfg(test)]
pub async fn test_pool() -> Pool<Sqlite> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}
