use thiserror::Error;

/// Failures while building an upstream client.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("invalid upstream url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}
