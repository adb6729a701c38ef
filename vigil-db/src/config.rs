use std::time::Duration;

use serde::Deserialize;

use crate::error::DbConnectionError;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Basic configuration for creating a SQLite connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DbConnectionConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
    /// How long a connection waits on a locked database before failing.
    pub busy_timeout_ms: u64,
}

impl Default for DbConnectionConfig {
    #[inline]
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: DEFAULT_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: Some(DEFAULT_IDLE_TIMEOUT_SECS),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl DbConnectionConfig {
    /// Creates a new configuration with the provided URL and sane defaults.
    #[inline]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// A single long-lived connection. Every connection to `sqlite::memory:`
    /// opens its own database, so in-memory pools must not grow or recycle.
    pub fn in_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_owned(),
            max_connections: 1,
            min_connections: 1,
            idle_timeout_secs: None,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), DbConnectionError> {
        if self.url.trim().is_empty() {
            return Err(DbConnectionError::EmptyDatabaseUrl);
        }
        if self.max_connections == 0 {
            return Err(DbConnectionError::InvalidPool(
                "max_connections must be greater than 0".to_owned(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(DbConnectionError::InvalidPool(
                "min_connections must not exceed max_connections".to_owned(),
            ));
        }
        Ok(())
    }

    #[inline]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[inline]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    #[inline]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
