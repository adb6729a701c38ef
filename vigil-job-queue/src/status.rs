//! Read-only queue visibility.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::broker::BrokerConnection;
use crate::error::JobQueueError;
use crate::store::StateStore;
use crate::worker::WorkerPool;

/// Snapshot returned by [`QueueStatusReporter::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub queue: String,
    /// Ready messages in the broker; 0 when `broker_error` is set.
    pub broker_depth: u64,
    pub pending_count: u64,
    pub processing_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
    pub total: u64,
    pub consumer_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_error: Option<String>,
}

/// Aggregates broker depth and per-status counts on demand.
pub struct QueueStatusReporter {
    store: Arc<dyn StateStore>,
    broker: BrokerConnection,
    workers: Option<Arc<WorkerPool>>,
}

impl fmt::Debug for QueueStatusReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueStatusReporter")
            .field("broker", &self.broker)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl QueueStatusReporter {
    /// `broker` should be a dedicated connection; reports use it for passive
    /// depth queries only.
    pub fn new(store: Arc<dyn StateStore>, broker: BrokerConnection) -> Self {
        Self {
            store,
            broker,
            workers: None,
        }
    }

    #[must_use]
    pub fn with_workers(mut self, workers: Arc<WorkerPool>) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Build a report. Only a store failure fails the whole report; an
    /// unreachable broker degrades `broker_depth` to 0 and sets `broker_error`.
    pub async fn status(&self) -> Result<QueueStatus, JobQueueError> {
        let counts = self.store.counts_by_status().await?;

        let (broker_depth, broker_error) = match self.broker.queue_depth().await {
            Ok(depth) => (depth, None),
            Err(err) => {
                warn!(%err, queue = %self.broker.queue(), "queue depth unavailable");
                (0, Some(err.to_string()))
            }
        };

        let consumer_running = match &self.workers {
            Some(workers) => workers.is_running().await,
            None => false,
        };

        Ok(QueueStatus {
            queue: self.broker.queue().to_owned(),
            broker_depth,
            pending_count: counts.pending,
            processing_count: counts.processing,
            completed_count: counts.completed,
            failed_count: counts.failed,
            total: counts.total(),
            consumer_running,
            broker_error,
        })
    }
}
