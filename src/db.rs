use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;

/// How long a writer waits for another loop's transaction to commit.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Open the SQLite pool shared by every runner, creating the file if needed.
///
/// Collector and harvester loops write from separate tasks through the same
/// pool. WAL lets readers proceed during a write, but SQLite still admits a
/// single writer, so a connection waits up to [`BUSY_TIMEOUT`] for the lock
/// instead of failing the step with `SQLITE_BUSY`.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}
