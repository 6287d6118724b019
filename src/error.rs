use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::template::TemplateError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("a webhook named `{0}` already exists in this conversation")]
    Conflict(String),

    #[error("Webhook not found")]
    NotFound,

    /// The token belonged to a webhook that has since been removed.
    #[error("Webhook has been removed")]
    Retired,

    #[error("Invalid template: {0}")]
    Template(#[from] TemplateError),

    #[error("Request carried no message content")]
    EmptyPayload,

    #[error("Request body is not a JSON object or form")]
    InvalidPayload,

    #[error("Invalid token format")]
    InvalidToken,

    #[error("Chat delivery failed: {0}")]
    Delivery(String),

    #[error("Internal server error")]
    Internal,
}

impl AppError {
    /// Covers both unknown and removed webhooks.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound | AppError::Retired)
    }

    /// Errors after which registry state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::Storage(_))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Storage error"),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "Webhook already exists"),
            AppError::NotFound => (StatusCode::NOT_FOUND, "Webhook not found"),
            AppError::Retired => (StatusCode::GONE, "Webhook has been removed"),
            AppError::Template(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Template error"),
            AppError::EmptyPayload => (StatusCode::BAD_REQUEST, "No message content"),
            AppError::InvalidPayload => (
                StatusCode::BAD_REQUEST,
                "Body must be a JSON object or a urlencoded form",
            ),
            AppError::InvalidToken => (StatusCode::BAD_REQUEST, "Invalid token format"),
            AppError::Delivery(_) => (StatusCode::BAD_GATEWAY, "Chat delivery failed"),
            AppError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
        };

        if status.is_server_error() {
            tracing::warn!("Error occurred: {}", self);
        } else {
            tracing::debug!("Rejected request: {}", self);
        }

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retired_counts_as_not_found() {
        assert!(AppError::Retired.is_not_found());
        assert!(AppError::NotFound.is_not_found());
        assert!(!AppError::EmptyPayload.is_not_found());
    }

    #[test]
    fn only_storage_errors_are_fatal() {
        assert!(AppError::Storage(sqlx::Error::PoolClosed).is_fatal());
        assert!(!AppError::Delivery("down".into()).is_fatal());
        assert!(!AppError::Conflict("alerts".into()).is_fatal());
    }

    #[test]
    fn status_codes_follow_error_kind() {
        let cases = [
            (AppError::NotFound, StatusCode::NOT_FOUND),
            (AppError::Retired, StatusCode::GONE),
            (AppError::InvalidToken, StatusCode::BAD_REQUEST),
            (AppError::EmptyPayload, StatusCode::BAD_REQUEST),
            (AppError::Delivery("timeout".into()), StatusCode::BAD_GATEWAY),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
