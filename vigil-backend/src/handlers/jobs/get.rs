use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::Json;
use uuid::Uuid;
use vigil_job_queue::JobRecord;

use crate::{error::ApiError, state::AppState};

/// GET /jobs/{jobId}
pub async fn get(
    Extension(state): Extension<Arc<AppState>>,
    Path(path): Path<HashMap<String, String>>,
) -> Result<Json<JobRecord>, ApiError> {
    let raw = path
        .get("jobId")
        .ok_or_else(|| ApiError::bad_request("missing jobId path parameter"))?;
    let job_id =
        Uuid::parse_str(raw).map_err(|_| ApiError::bad_request("jobId must be a UUID"))?;

    let record = state
        .store
        .get(job_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job {job_id}")))?;
    Ok(Json(record))
}
