use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;
use crate::error::{StorageError, StorageErrorKind};

pub async fn connect(config: &Config) -> Result<SqlitePool, StorageError> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            StorageError::new(
                StorageErrorKind::Unavailable,
                format!("cannot create {}: {}", parent.display(), e),
            )
        })?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(|e| StorageError::new(StorageErrorKind::Unavailable, e.to_string()))?;

    Ok(pool)
}
