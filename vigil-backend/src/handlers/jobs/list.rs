use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Extension, Query};
use axum::Json;
use serde_json::{json, Value};
use vigil_job_queue::JobStatus;

use crate::handlers::utils::parse_positive_usize;
use crate::{error::ApiError, state::AppState};

/// GET /jobs
/// List jobs newest first with optional status filter and pagination.
pub async fn list(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let page = parse_positive_usize(params.get("page"), 1, "page")?;
    let per_page = parse_positive_usize(params.get("perPage"), 20, "perPage")?;
    let offset = (page - 1).saturating_mul(per_page);
    let status = params
        .get("status")
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.parse::<JobStatus>().map_err(ApiError::bad_request))
        .transpose()?;

    let counts = state.store.counts_by_status().await?;
    let total = status.map_or_else(|| counts.total(), |s| counts.get(s));
    let items = state.store.list(status, per_page, offset).await?;

    Ok(Json(json!({
        "items": items,
        "pagination": {
            "page": page,
            "perPage": per_page,
            "total": total,
        }
    })))
}
