use std::sync::Arc;

use axum::extract::Extension;
use axum::Json;
use vigil_job_queue::QueueStatus;

use crate::{error::ApiError, state::AppState};

/// GET /queue/status
pub async fn status(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<QueueStatus>, ApiError> {
    Ok(Json(state.reporter.status().await?))
}
