//! Error types shared by the engine, the client and the server.

use crate::{RowId, TableName};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The error taxonomy callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport failure; re-invoking the operation may succeed.
    Network,
    /// The id does not exist remotely.
    NotFound,
    /// The payload was rejected by remote constraints.
    Validation,
    /// The caller lacks permission.
    Auth,
    /// The change stream disconnected and could not be re-established.
    SubscriptionLost,
    /// The handle was closed before the call.
    Closed,
}

impl ErrorKind {
    /// Whether re-invoking the same call unchanged may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::SubscriptionLost)
    }

    /// The name used as the prefix of displayed messages.
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Network => "NetworkError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Auth => "AuthError",
            ErrorKind::SubscriptionLost => "SubscriptionLostError",
            ErrorKind::Closed => "ClosedError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// All possible errors from Quarry operations.
///
/// Serialized as `{"code": "row_not_found", "detail": ...}` so a server can
/// hand the exact variant back to a client.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum Error {
    // Transport
    #[error("NetworkError: {0}")]
    Network(String),

    // Lookups
    #[error("NotFoundError: row {0} does not exist")]
    RowNotFound(RowId),

    #[error("NotFoundError: table {0} does not exist")]
    TableNotFound(TableName),

    // Validation
    #[error("ValidationError: invalid payload: {0}")]
    InvalidPayload(String),

    #[error("ValidationError: missing required field: {0}")]
    MissingRequiredField(String),

    #[error("ValidationError: type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("ValidationError: unknown field '{field}' in table {table}")]
    UnknownField { table: TableName, field: String },

    #[error("ValidationError: invalid query: {0}")]
    InvalidQuery(String),

    // Access
    #[error("AuthError: {0}")]
    Auth(String),

    // Stream
    #[error("SubscriptionLostError: {0}")]
    SubscriptionLost(String),

    #[error("ClosedError: live table for {0} is closed")]
    Closed(TableName),
}

impl Error {
    /// Classify this error within the taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Network(_) => ErrorKind::Network,
            Error::RowNotFound(_) | Error::TableNotFound(_) => ErrorKind::NotFound,
            Error::InvalidPayload(_)
            | Error::MissingRequiredField(_)
            | Error::TypeMismatch { .. }
            | Error::UnknownField { .. }
            | Error::InvalidQuery(_) => ErrorKind::Validation,
            Error::Auth(_) => ErrorKind::Auth,
            Error::SubscriptionLost(_) => ErrorKind::SubscriptionLost,
            Error::Closed(_) => ErrorKind::Closed,
        }
    }

    /// Shorthand for [`ErrorKind::is_retryable`].
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Rebuild an error from a kind and a message received over the wire.
    ///
    /// The original variant is not recoverable, so each kind maps to its most
    /// general variant.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Network => Error::Network(message),
            ErrorKind::NotFound => Error::RowNotFound(message),
            ErrorKind::Validation => Error::InvalidPayload(message),
            ErrorKind::Auth => Error::Auth(message),
            ErrorKind::SubscriptionLost => Error::SubscriptionLost(message),
            ErrorKind::Closed => Error::Closed(message),
        }
    }
}

/// Result type for Quarry operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::RowNotFound("missing-id".into());
        assert_eq!(err.to_string(), "NotFoundError: row missing-id does not exist");

        let err = Error::TypeMismatch {
            field: "quantity_tons".into(),
            expected: "Float".into(),
            got: "String".into(),
        };
        assert_eq!(
            err.to_string(),
            "ValidationError: type mismatch for field 'quantity_tons': expected Float, got String"
        );

        let err = Error::Network("connection reset".into());
        assert_eq!(err.to_string(), "NetworkError: connection reset");
    }

    #[test]
    fn kinds() {
        assert_eq!(Error::TableNotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            Error::MissingRequiredField("name".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(Error::Auth("denied".into()).kind(), ErrorKind::Auth);
        assert!(Error::Network("down".into()).is_retryable());
        assert!(!Error::RowNotFound("x".into()).is_retryable());
        assert!(!Error::Auth("denied".into()).is_retryable());
    }

    #[test]
    fn from_kind_keeps_kind() {
        for kind in [
            ErrorKind::Network,
            ErrorKind::NotFound,
            ErrorKind::Validation,
            ErrorKind::Auth,
            ErrorKind::SubscriptionLost,
            ErrorKind::Closed,
        ] {
            assert_eq!(Error::from_kind(kind, "m").kind(), kind);
        }
    }

    #[test]
    fn error_wire_format() {
        let err = Error::TypeMismatch {
            field: "litres".into(),
            expected: "Float".into(),
            got: "String".into(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "type_mismatch");
        assert_eq!(json["detail"]["field"], "litres");
        assert_eq!(serde_json::from_value::<Error>(json).unwrap(), err);

        let json = serde_json::to_string(&Error::RowNotFound("r1".into())).unwrap();
        assert_eq!(json, r#"{"code":"row_not_found","detail":"r1"}"#);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::SubscriptionLost).unwrap();
        assert_eq!(json, r#""subscription_lost""#);
    }
}
