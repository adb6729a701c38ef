use serde::Serialize;

pub mod start;
pub mod status;
pub mod stop;

pub use start::start;
pub use status::status;
pub use stop::stop;

/// Worker pool state returned by the consumer endpoints.
#[derive(Debug, Serialize)]
pub struct ConsumerState {
    pub running: bool,
    pub workers: usize,
    /// Whether the request started or stopped the pool.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed: Option<bool>,
}
