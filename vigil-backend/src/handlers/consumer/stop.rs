use std::sync::Arc;

use axum::extract::Extension;
use axum::Json;

use super::ConsumerState;
use crate::state::AppState;

/// POST /consumer/stop
/// Waits for in-flight jobs to finish before answering.
pub async fn stop(Extension(state): Extension<Arc<AppState>>) -> Json<ConsumerState> {
    let changed = state.workers.stop().await;
    if changed {
        tracing::info!("consumer stopped via api");
    }
    Json(ConsumerState {
        running: state.workers.is_running().await,
        workers: state.workers.worker_count(),
        changed: Some(changed),
    })
}
