use std::sync::Arc;

use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter};

/// Type alias for the reload handle returned by tracing initialization.
pub type ReloadHandle = Arc<dyn Fn(EnvFilter) -> Result<(), String> + Send + Sync>;

/// Initialize tracing from configuration. `RUST_LOG` wins over the
/// configured level.
///
/// Returns a handle that replaces the filter at runtime.
pub fn install_tracing_from_config(cfg: &vigil_config::LoggingConfig) -> ReloadHandle {
    let env_filter_str = std::env::var("RUST_LOG").unwrap_or_else(|_| cfg.level.clone());
    let (filter_layer, reload_handle) = reload::Layer::new(EnvFilter::new(&env_filter_str));
    let registry = tracing_subscriber::registry().with(filter_layer);

    if cfg.json {
        registry
            .with(fmt::layer().json().with_timer(ChronoUtc::rfc_3339()))
            .init();
    } else {
        registry
            .with(fmt::layer().with_timer(ChronoUtc::rfc_3339()))
            .init();
    }

    Arc::new(move |filter| {
        reload_handle
            .reload(filter)
            .map_err(|e| format!("reload failed: {e}"))
    })
}
