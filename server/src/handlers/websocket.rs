//! WebSocket handler for change streams.
//!
//! Handles WebSocket connections and dispatches subscribe / unsubscribe /
//! ping messages while the connection manager pushes committed changes.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use quarry_engine::{QueryDescriptor, Schema};
use tokio::sync::mpsc;

use crate::error::AppError;
use crate::websocket::{ClientMessage, ConnectionManager, ServerMessage};

/// Handle an established WebSocket connection.
///
/// This function:
/// 1. Registers the connection with the manager
/// 2. Spawns a task to forward outgoing messages
/// 3. Processes incoming messages in a loop
/// 4. Drops the connection and its subscriptions on disconnect
pub async fn handle_websocket_connection(
    socket: WebSocket,
    schema: Arc<Schema>,
    conn_manager: Arc<ConnectionManager>,
    user: String,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Create channel for sending messages to this connection
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let conn_id = conn_manager.register(user.clone(), tx);

    tracing::info!(conn_id = %conn_id, user = %user, "WebSocket client connected");

    // Spawn task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize WebSocket message: {}", e);
                }
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if let Some(response) = process_message(&text, &schema, &conn_manager, &conn_id) {
                    conn_manager.send_to(&conn_id, response);
                }
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!("Binary messages not supported");
            }
            Ok(Message::Ping(data)) => {
                // Axum answers protocol pings itself
                tracing::trace!("Received ping: {} bytes", data.len());
            }
            Ok(Message::Pong(_)) => {
                tracing::trace!("Received pong");
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    conn_manager.unregister(&conn_id);
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        active_connections = conn_manager.connection_count(),
        "WebSocket client disconnected"
    );
}

/// Process a client message and return the reply, if any.
///
/// `subscribe` registers before replying, so every change committed after the
/// client sees `subscribed` is delivered.
pub fn process_message(
    text: &str,
    schema: &Schema,
    conn_manager: &ConnectionManager,
    conn_id: &str,
) -> Option<ServerMessage> {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            return Some(
                AppError::BadRequest(format!("Invalid message format: {}", e)).to_message(None),
            );
        }
    };

    match client_msg {
        ClientMessage::Subscribe {
            table,
            query,
            request_id,
        } => match check_subscription(schema, &table, &query) {
            Ok(()) => {
                let subscription_id = conn_manager.subscribe(conn_id, table, query);
                Some(ServerMessage::Subscribed {
                    subscription_id,
                    request_id,
                })
            }
            Err(e) => Some(e.to_message(request_id)),
        },

        ClientMessage::Unsubscribe { subscription_id } => {
            if !conn_manager.unsubscribe(conn_id, &subscription_id) {
                tracing::debug!(conn_id = %conn_id, subscription_id = %subscription_id, "Unknown subscription");
            }
            None
        }

        ClientMessage::Ping => Some(ServerMessage::Pong),
    }
}

fn check_subscription(schema: &Schema, table: &str, query: &QueryDescriptor) -> Result<(), AppError> {
    let table_schema = schema.table(table)?;
    if !table_schema.strict {
        return Ok(());
    }
    let unknown = query
        .filters
        .iter()
        .map(|filter| filter.column.as_str())
        .find(|column| *column != "id" && table_schema.field(column).is_none());
    match unknown {
        Some(column) => Err(quarry_engine::Error::InvalidQuery(format!(
            "unknown column {column} in table {table}"
        ))
        .into()),
        None => Ok(()),
    }
}
