//! Error types for the job queue system.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the queue core to producers, workers and the API layer.
#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("invalid keyword: {0}")]
    InvalidKeyword(String),

    #[error("broker unavailable after {attempts} attempt(s): {reason}")]
    BrokerUnavailable { attempts: u32, reason: String },

    #[error("failed to publish message: {0}")]
    Publish(String),

    #[error("broker operation failed: {0}")]
    Broker(#[from] BrokerError),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("search unavailable: {0}")]
    SearchUnavailable(String),

    #[error("timeout")]
    SearchTimeout,

    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

impl JobQueueError {
    /// True when the broker could not be reached or refused the message.
    #[inline]
    pub const fn is_broker_failure(&self) -> bool {
        matches!(
            self,
            Self::BrokerUnavailable { .. } | Self::Publish(_) | Self::Broker(_)
        )
    }
}

impl From<SearchError> for JobQueueError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::Unavailable(reason) => Self::SearchUnavailable(reason),
            SearchError::Timeout => Self::SearchTimeout,
        }
    }
}

/// Failures reported by a [`StateStore`](crate::StateStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} already exists")]
    Duplicate(Uuid),

    #[error("stored job record is corrupt: {0}")]
    Corrupt(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Failures reported by a broker transport or channel.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("could not connect to broker: {0}")]
    Connect(String),

    #[error("channel is closed")]
    ChannelClosed,

    #[error("unknown delivery tag: {0}")]
    UnknownDelivery(String),

    #[error("broker i/o error: {0}")]
    Io(String),
}

/// Failures of the external vulnerability search collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SearchError {
    #[error("search unavailable: {0}")]
    Unavailable(String),

    #[error("timeout")]
    Timeout,
}

/// The external time source could not produce a usable timestamp.
#[derive(Debug, Error)]
#[error("time source failed: {0}")]
pub struct TimeSourceError(pub String);
