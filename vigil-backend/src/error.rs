use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;
use vigil_job_queue::{JobQueueError, StoreError};

/// Top-level API error shared by all route handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    JobQueue(#[from] JobQueueError),
    #[error("persistence error: {0}")]
    Store(#[from] StoreError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::JobQueue(err) if err.is_broker_failure() => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::JobQueue(JobQueueError::InvalidKeyword(_)) => StatusCode::BAD_REQUEST,
            ApiError::JobQueue(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_queue_errors_to_status_codes() {
        let cases = [
            (
                ApiError::from(JobQueueError::InvalidKeyword("empty".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(JobQueueError::BrokerUnavailable {
                    attempts: 5,
                    reason: "refused".into(),
                }),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ApiError::from(JobQueueError::Publish("nack".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ApiError::from(JobQueueError::Persistence(StoreError::Backend("disk".into()))),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ApiError::from(JobQueueError::SearchTimeout),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (ApiError::not_found("job"), StatusCode::NOT_FOUND),
        ];
        for (err, expected) in cases {
            assert_eq!(err.status_code(), expected, "{err}");
        }
    }
}
