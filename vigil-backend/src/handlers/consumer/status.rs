use std::sync::Arc;

use axum::extract::Extension;
use axum::Json;

use super::ConsumerState;
use crate::state::AppState;

/// GET /consumer
pub async fn status(Extension(state): Extension<Arc<AppState>>) -> Json<ConsumerState> {
    Json(ConsumerState {
        running: state.workers.is_running().await,
        workers: state.workers.worker_count(),
        changed: None,
    })
}
