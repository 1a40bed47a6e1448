//! Unified error handling for the server.
//!
//! Every failure leaves as `{"error": message, "kind": kind, "detail": error}`
//! where `detail` is the engine error itself, so clients get the exact variant
//! back.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use quarry_engine::{ErrorKind, ServerMessage};
use serde::Serialize;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Engine(#[from] quarry_engine::Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

/// Error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<quarry_engine::Error>,
}

impl AppError {
    /// Position in the client-facing error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Database(_) => ErrorKind::Network,
            AppError::Engine(e) => e.kind(),
            AppError::BadRequest(_) => ErrorKind::Validation,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Validation => match self {
                AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::UNPROCESSABLE_ENTITY,
            },
            ErrorKind::Auth => StatusCode::UNAUTHORIZED,
            ErrorKind::Closed => StatusCode::CONFLICT,
            ErrorKind::SubscriptionLost => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Network => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The message for the client. Database internals are not exposed.
    fn public_message(&self) -> String {
        match self {
            AppError::Database(_) => "NetworkError: database unavailable".to_string(),
            other => other.to_string(),
        }
    }

    /// Same error as a change-stream message.
    pub fn to_message(&self, request_id: Option<String>) -> ServerMessage {
        ServerMessage::Error {
            message: self.public_message(),
            kind: Some(self.kind()),
            request_id,
        }
    }

    fn body(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.public_message(),
            kind: self.kind(),
            detail: match self {
                AppError::Engine(e) => Some(e.clone()),
                AppError::BadRequest(msg) => {
                    Some(quarry_engine::Error::InvalidPayload(msg.clone()))
                }
                AppError::Database(_) => None,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Database(e) => tracing::error!("Database error: {:?}", e),
            AppError::Engine(e) => tracing::warn!(kind = e.kind().name(), "Request failed: {}", e),
            AppError::BadRequest(msg) => tracing::debug!("Bad request: {}", msg),
        }

        (self.status(), Json(self.body())).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
