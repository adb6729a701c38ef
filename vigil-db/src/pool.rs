use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::config::DbConnectionConfig;
use crate::error::DbConnectionError;
use crate::utils::config_metadata;

pub type DbPool = SqlitePool;

// SQLite memory database patterns for efficient checking
pub const SQLITE_MEMORY_PATTERNS: &[&[u8]] = &[b":memory:", b"mode=memory"];

/// Creates a SQLite connection pool using the provided configuration.
///
/// File databases are opened in WAL mode with a busy timeout so the API
/// process and any number of worker connections can write concurrently.
pub async fn create_pool(config: &DbConnectionConfig) -> Result<DbPool, DbConnectionError> {
    config.validate()?;
    let url = config.url.trim();
    let in_memory = is_memory_url(url);

    if !in_memory {
        ensure_parent_dir_exists(url)?;
    }

    let mut options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .busy_timeout(config.busy_timeout());
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connect_timeout())
        .idle_timeout(config.idle_timeout())
        .connect_with(options)
        .await?;

    info!(config = %config_metadata(config), "database pool ready");
    Ok(pool)
}

pub fn is_memory_url(url: &str) -> bool {
    let url_bytes = url.as_bytes();
    SQLITE_MEMORY_PATTERNS.iter().any(|&pattern| {
        url_bytes
            .windows(pattern.len())
            .any(|w| w.eq_ignore_ascii_case(pattern))
    })
}

/// Extract the file path from a SQLite connection URL.
/// Returns None for in-memory databases or empty paths.
pub(crate) fn sqlite_file_path(url: &str) -> Option<&str> {
    if is_memory_url(url) {
        return None;
    }

    let mut path = url;
    path = path
        .strip_prefix("sqlite://")
        .or_else(|| path.strip_prefix("sqlite:"))
        .unwrap_or(path);
    path = path.strip_prefix("//").unwrap_or(path);
    path = path.strip_prefix("file:").unwrap_or(path);

    if let Some(idx) = path.find('?') {
        path = &path[..idx];
    }

    let path = path.trim();
    if path.is_empty() {
        return None;
    }

    // On Windows: strip leading slash before drive letter ("/C:/...")
    if path.len() > 2 && path.starts_with('/') && path.as_bytes().get(2) == Some(&b':') {
        Some(&path[1..])
    } else {
        Some(path)
    }
}

fn ensure_parent_dir_exists(database_url: &str) -> Result<(), DbConnectionError> {
    use std::fs::create_dir_all;
    use std::path::Path;

    let Some(clean_path) = sqlite_file_path(database_url) else {
        return Ok(());
    };

    let db_path = Path::new(clean_path);
    if let Some(parent) = db_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty() && !p.exists())
    {
        debug!(path = %parent.display(), "creating database directory");
        create_dir_all(parent).map_err(|e| {
            DbConnectionError::FileCreation(format!(
                "failed to create parent directory '{}': {e}",
                parent.display()
            ))
        })?;
    }

    Ok(())
}
