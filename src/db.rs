use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::config::DbConfig;
use crate::error::Result;

/// Open the SQLite pool, creating the database file (and parent directory)
/// on first use. WAL mode keeps readers unblocked during background syncs.
pub async fn connect(config: &DbConfig) -> Result<SqlitePool> {
    if let Some(parent) = config.path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| crate::error::RecallError::Config(format!("create db dir: {e}")))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.path.display()))
        .map_err(sqlx::Error::from)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.connect_timeout)
        .connect_with(options)
        .await?;

    Ok(pool)
}
