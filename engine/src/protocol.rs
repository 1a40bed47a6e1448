//! Change-stream wire protocol.
//!
//! All messages are JSON-encoded, tagged by `type` and use snake_case for
//! field names. The server and the HTTP client backend share these types.

use crate::{ChangeEvent, ErrorKind, QueryDescriptor, Seq, TableName};
use serde::{Deserialize, Serialize};

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving changes for a table.
    Subscribe {
        table: TableName,
        /// Server-side filter; inserts outside it are not sent
        #[serde(default)]
        query: QueryDescriptor,
        /// Request ID for correlating responses
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Stop a subscription.
    Unsubscribe { subscription_id: String },

    /// Keep-alive ping.
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A subscription is active; changes committed from here on are delivered.
    Subscribed {
        subscription_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// A committed write on a subscribed table.
    Change {
        subscription_id: String,
        seq: Seq,
        event: ChangeEvent,
    },

    /// Response to ping.
    Pong,

    /// Error message.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ErrorKind>,
        /// Request ID from the original request (if applicable)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            kind: None,
            request_id,
        }
    }

    /// Create an error message from an engine error, keeping its kind.
    pub fn from_error(err: &crate::Error, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: err.to_string(),
            kind: Some(err.kind()),
            request_id,
        }
    }

    /// Create a change notification.
    pub fn change(subscription_id: impl Into<String>, seq: Seq, event: ChangeEvent) -> Self {
        ServerMessage::Change {
            subscription_id: subscription_id.into(),
            seq,
            event,
        }
    }
}
