//! API error type and HTTP mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use focusdeck_billing::BillingError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    /// Temporary condition; the client (or the processor's webhook retry)
    /// should try again
    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("Internal server error")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let ApiError::Internal(detail) = &self {
            tracing::error!(detail, "Internal error serving request");
        }
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::Validation(msg) => ApiError::BadRequest(msg),
            BillingError::SignatureInvalid => {
                ApiError::BadRequest("invalid webhook signature".into())
            }
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::NotConfigured(_) => {
                ApiError::ServiceUnavailable("billing is not available".into())
            }
            BillingError::ProcessorUnavailable(msg) => ApiError::ServiceUnavailable(format!(
                "payment processor unavailable, try again: {}",
                msg
            )),
            BillingError::WriteConflict(_) => {
                ApiError::ServiceUnavailable("state changed concurrently, try again".into())
            }
            BillingError::Storage(msg) | BillingError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
