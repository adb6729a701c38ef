//! Timestamps for job records.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::TimeSourceError;

/// Default budget for a single external time lookup.
pub const DEFAULT_TIME_SOURCE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Supplies the timestamps written onto job records.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn now(&self) -> DateTime<Utc>;
}

/// An authoritative time source shared by all workers (e.g. an HTTP time API).
#[async_trait]
pub trait TimeSource: Send + Sync {
    async fn fetch(&self) -> Result<DateTime<Utc>, TimeSourceError>;
}

/// The local system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    async fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Prefers an external time source and silently falls back to the local
/// clock on timeout or any error.
#[derive(Clone)]
pub struct ClockService {
    source: Option<Arc<dyn TimeSource>>,
    timeout: Duration,
}

impl std::fmt::Debug for ClockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockService")
            .field("source", &self.source.as_ref().map(|_| "<dyn TimeSource>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for ClockService {
    fn default() -> Self {
        Self::local()
    }
}

impl ClockService {
    /// A clock with no external source.
    pub fn local() -> Self {
        Self {
            source: None,
            timeout: DEFAULT_TIME_SOURCE_TIMEOUT,
        }
    }

    pub fn with_source(source: Arc<dyn TimeSource>, timeout: Duration) -> Self {
        Self {
            source: Some(source),
            timeout,
        }
    }
}

#[async_trait]
impl Clock for ClockService {
    async fn now(&self) -> DateTime<Utc> {
        let Some(source) = &self.source else {
            return Utc::now();
        };

        match tokio::time::timeout(self.timeout, source.fetch()).await {
            Ok(Ok(ts)) => ts,
            Ok(Err(err)) => {
                debug!(%err, "external time source failed; using local clock");
                Utc::now()
            }
            Err(_) => {
                let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                debug!(timeout_ms, "external time source timed out; using local clock");
                Utc::now()
            }
        }
    }
}
