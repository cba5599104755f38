//! The typed error taxonomy from `SPEC_FULL.md` §7, realized at the HTTP
//! boundary. Internal plumbing keeps using `anyhow::Result`; this type exists
//! only where an explicit HTTP status mapping is required, the same role
//! `crates/opinionated_metrics::Error` plays for its own narrow boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] anyhow::Error),

    #[error("failed to queue data for processing after retries")]
    PublishFailed(#[source] anyhow::Error),

    #[error("internal error: {0}")]
    Internal(#[source] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::PublishFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match &self {
            // Don't leak internal causes for service-unavailable/internal
            // errors to HTTP clients; the full chain is already logged by
            // the caller before this response is built.
            AppError::StoreUnavailable(_) => "store temporarily unavailable".to_owned(),
            _ => self.to_string(),
        };
        (status, Json(ErrorBody { message })).into_response()
    }
}
