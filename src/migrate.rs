use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the database file and schema, then close the pool.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Idempotent schema creation on an open pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // A row either owns its bytes (copy_id NULL) or points at the row that
    // does. Empty results have neither data nor hash.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            collection TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            data BLOB,
            hash TEXT,
            copy_id INTEGER,
            UNIQUE(collection, timestamp),
            FOREIGN KEY (collection) REFERENCES collections(name),
            FOREIGN KEY (copy_id) REFERENCES items(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_hash ON items(collection, hash)")
        .execute(pool)
        .await?;

    Ok(())
}
