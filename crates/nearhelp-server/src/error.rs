use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use nearhelp_core::LifecycleError;
use nearhelp_store::StoreError;

/// Server-side error wrapper around the domain taxonomy.
///
/// Lifecycle rejections surface as their HTTP equivalents with a
/// human-readable reason; store failures other than `NotFound` are
/// internal.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Lifecycle(LifecycleError::Validation(_)) => StatusCode::BAD_REQUEST,
            ApiError::Lifecycle(LifecycleError::Conflict(_)) => StatusCode::CONFLICT,
            ApiError::Lifecycle(LifecycleError::Expired) => StatusCode::GONE,
            ApiError::Lifecycle(LifecycleError::Forbidden(_)) => StatusCode::FORBIDDEN,
            ApiError::Lifecycle(LifecycleError::NotFound) => StatusCode::NOT_FOUND,
            ApiError::Store(StoreError::NotFound) => StatusCode::NOT_FOUND,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            // Do not leak storage internals to clients.
            ApiError::Store(e) if status == StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::error!(error = %e, "storage failure");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
