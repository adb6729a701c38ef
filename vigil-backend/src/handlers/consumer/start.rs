use std::sync::Arc;

use axum::extract::Extension;
use axum::Json;

use super::ConsumerState;
use crate::state::AppState;

/// POST /consumer/start
pub async fn start(Extension(state): Extension<Arc<AppState>>) -> Json<ConsumerState> {
    let changed = state.workers.start().await;
    if changed {
        tracing::info!(workers = state.workers.worker_count(), "consumer started via api");
    }
    Json(ConsumerState {
        running: state.workers.is_running().await,
        workers: state.workers.worker_count(),
        changed: Some(changed),
    })
}
