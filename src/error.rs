use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::nostr::preflight::PreflightError;

/// Service-level failures, each mapping to one HTTP status.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Malformed(String),
    #[error("{0}")]
    Unprocessable(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Exhausted(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Malformed(_) | ServiceError::Exhausted(_) => StatusCode::BAD_REQUEST,
            ServiceError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The masked failure every non-diagnostic tap verification surfaces,
    /// regardless of which layer rejected it.
    pub fn card_data_unavailable() -> Self {
        ServiceError::NotFound("Failed to retrieve card data".to_string())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        let reason = match &self {
            // Store and crypto internals stay out of responses.
            ServiceError::Internal(err) => {
                tracing::error!(error = %err, "internal error");
                "Internal error".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(json!({ "status": "ERROR", "reason": reason }))).into_response()
    }
}

impl From<PreflightError> for ServiceError {
    fn from(err: PreflightError) -> Self {
        ServiceError::Unprocessable(err.to_string())
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        ServiceError::Internal(err.into())
    }
}
