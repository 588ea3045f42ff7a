//! Mapping of server errors onto HTTP responses.

use crate::error::ServerError;
use axum::http::header::RETRY_AFTER;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

impl ServerError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::BlobTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RetryExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_) | Self::Storage(_) | Self::Ephemeral(_) | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid_request",
            Self::Unauthenticated => "unauthenticated",
            Self::BlobTooLarge { .. } => "blob_too_large",
            Self::RetryExhausted { .. } => "contended",
            Self::Config(_) | Self::Storage(_) | Self::Ephemeral(_) | Self::Io(_) => "internal",
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Backend details stay in the log.
        let message = if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
            status
                .canonical_reason()
                .unwrap_or("internal error")
                .to_string()
        } else {
            self.to_string()
        };

        let body = Json(serde_json::json!({
            "code": self.code(),
            "message": message,
        }));

        if self.is_retryable() && status == StatusCode::SERVICE_UNAVAILABLE {
            (status, [(RETRY_AFTER, "1")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}
