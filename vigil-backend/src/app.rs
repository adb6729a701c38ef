use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::handlers::{consumer, jobs, queue};
use crate::state::AppState;

/// Build the primary axum router with the provided shared application state.
pub fn build_router(state: Arc<AppState>) -> Router {
    let router = Router::new()
        .route("/jobs", post(jobs::enqueue).get(jobs::list))
        .route("/jobs/{jobId}", get(jobs::get))
        .route("/queue/status", get(queue::status))
        .route("/consumer", get(consumer::status))
        .route("/consumer/start", post(consumer::start))
        .route("/consumer/stop", post(consumer::stop))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .layer(Extension(state));

    Router::new()
        .nest("/api", router)
        .layer(TraceLayer::new_for_http())
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Ready once the job store answers queries.
async fn ready_handler(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    match state.store.counts_by_status().await {
        Ok(_) => (StatusCode::OK, "OK"),
        Err(err) => {
            tracing::warn!(%err, "readiness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "store unavailable")
        }
    }
}
