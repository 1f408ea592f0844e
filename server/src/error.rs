//! Errors raised by the HTTP layer itself, before the proxy pipeline runs.

use axum::Json;
use axum::extract::rejection::BytesRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use unframe_proxy::ErrorCode;

#[derive(Debug, Error)]
pub enum AppError {
    /// Body was not a JSON object.
    #[error("{}", ErrorCode::InvalidBody.public_message())]
    InvalidBody,

    /// Body exceeded the configured limit.
    #[error("Payload too large")]
    PayloadTooLarge,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidBody => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

impl From<BytesRejection> for AppError {
    fn from(rejection: BytesRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self::PayloadTooLarge
        } else {
            Self::InvalidBody
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::info!(status = %self.status_code(), "Rejected request body: {self}");
        (self.status_code(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
