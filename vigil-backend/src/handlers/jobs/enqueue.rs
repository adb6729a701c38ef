use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::Extension;
use axum::http::StatusCode;
use axum::Json;
use vigil_job_queue::{EnqueueResult, JobStatus};

use super::dto::EnqueueJobDto;
use crate::{error::ApiError, state::AppState};

/// POST /jobs
/// Persist a pending job and publish it for the workers.
pub async fn enqueue(
    Extension(state): Extension<Arc<AppState>>,
    payload: Result<Json<EnqueueJobDto>, JsonRejection>,
) -> Result<(StatusCode, Json<EnqueueResult>), ApiError> {
    let Json(body) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let keyword = body
        .keyword
        .ok_or_else(|| ApiError::bad_request("keyword is required"))?;

    let job_id = state
        .producer
        .enqueue(&keyword, body.metadata.unwrap_or_default())
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResult {
            job_id,
            status: JobStatus::Pending,
        }),
    ))
}
