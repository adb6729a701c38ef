//! Durable job queue for keyword vulnerability searches.
//!
//! A job is persisted before its message is published, processed by a pool
//! of workers that each own a broker channel, and driven to a write-once
//! terminal state. The store is the single source of truth; the broker's
//! per-delivery acknowledgement is what keeps two workers off the same job.
//!
//! # Architecture
//!
//! - [`JobProducer`] - validates, persists and publishes new jobs
//! - [`WorkerPool`] / [`JobProcessor`] - consume messages and run searches
//! - [`StateStore`] - job records; [`CachedStateStore`] adds a write-through cache
//! - [`BrokerConnection`] - one channel plus its reconnection policy
//! - [`QueueStatusReporter`] - broker depth and per-status counts
//! - [`ClockService`] - timestamps from an external source with local fallback
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vigil_job_queue::{
//!     async_trait, BrokerConnection, BrokerSettings, ClockService, InMemoryBroker,
//!     InMemoryStateStore, JobProducer, Metadata, SearchClient, SearchError, SearchResults,
//! };
//!
//! struct NoResults;
//!
//! #[async_trait]
//! impl SearchClient for NoResults {
//!     fn source(&self) -> &str {
//!         "none"
//!     }
//!
//!     async fn search(&self, _keyword: &str) -> Result<SearchResults, SearchError> {
//!         Ok(SearchResults::default())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let broker = Arc::new(InMemoryBroker::new());
//!     let producer = JobProducer::new(
//!         Arc::new(InMemoryStateStore::new()),
//!         BrokerConnection::new(broker, BrokerSettings::default()),
//!         Arc::new(ClockService::local()),
//!     );
//!
//!     let job_id = producer.enqueue("openssl", Metadata::new()).await.unwrap();
//!     println!("Enqueued job: {job_id}");
//! }
//! ```

mod broker;
mod cache;
mod clock;
mod error;
mod producer;
mod search;
mod status;
mod store;
mod types;
mod worker;

pub use broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerSettings, Delivery, InMemoryBroker,
    DEFAULT_MAX_RETRIES, DEFAULT_QUEUE_NAME, DEFAULT_RETRY_DELAY,
};
pub use cache::CachedStateStore;
pub use clock::{Clock, ClockService, SystemClock, TimeSource, DEFAULT_TIME_SOURCE_TIMEOUT};
pub use error::{BrokerError, JobQueueError, SearchError, StoreError, TimeSourceError};
pub use producer::{JobProducer, PRODUCER_VIA};
pub use search::{SearchClient, SearchResult, SearchResults};
pub use status::{QueueStatus, QueueStatusReporter};
pub use store::{InMemoryStateStore, StateStore, TransitionOutcome};
pub use types::{EnqueueResult, JobMessage, JobRecord, JobStatus, Metadata, StatusCounts};
pub use worker::{JobProcessor, ProcessOutcome, WorkerPool, WorkerSettings};

// Re-export async_trait for implementors of the collaborator traits
pub use async_trait::async_trait;
