//! SQLite persistence for Vigil: the connection pool, the job store and a
//! table-backed durable broker.

pub mod broker;
pub mod config;
pub mod error;
pub mod jobs;
pub mod pool;
pub mod utils;

pub use broker::{SqlBroker, DEFAULT_VISIBILITY_TIMEOUT};
pub use config::DbConnectionConfig;
pub use error::DbConnectionError;
pub use jobs::SqlStateStore;
pub use pool::{create_pool, is_memory_url, DbPool};
