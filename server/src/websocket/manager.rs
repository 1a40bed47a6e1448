//! WebSocket connection manager.
//!
//! Tracks active connections and their table subscriptions, and fans
//! committed changes out to the subscriptions that should see them.

use std::sync::Arc;

use dashmap::DashMap;
use quarry_engine::{ChangeEvent, QueryDescriptor, Seq, TableName};
use tokio::sync::mpsc;

use super::ServerMessage;

/// Sender for WebSocket messages.
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    /// Caller the connection was authenticated as
    pub user: String,
    /// Channel to send messages to this connection
    pub sender: MessageSender,
}

/// One table subscription held by a connection.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub conn_id: String,
    pub table: TableName,
    pub query: QueryDescriptor,
}

impl Subscription {
    /// Whether this subscription should receive `event`.
    ///
    /// Inserts outside the filter are skipped. Updates and deletes always go
    /// out, since the client may hold the row and must see it leave.
    pub fn wants(&self, event: &ChangeEvent) -> bool {
        match event {
            ChangeEvent::Inserted(row) => self.query.matches(row),
            ChangeEvent::Updated(_) | ChangeEvent::Deleted(_) => true,
        }
    }
}

/// Manages active WebSocket connections and their subscriptions.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    /// All active connections, keyed by connection ID.
    connections: DashMap<String, Connection>,
    /// All subscriptions, keyed by subscription ID.
    subscriptions: DashMap<String, Subscription>,
    /// Index of subscription IDs by table for broadcast.
    by_table: DashMap<TableName, Vec<String>>,
}

impl ConnectionManager {
    /// Create a new connection manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new connection manager wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection.
    ///
    /// Returns the connection ID.
    pub fn register(&self, user: String, sender: MessageSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();

        self.connections.insert(
            conn_id.clone(),
            Connection {
                user,
                sender,
            },
        );

        tracing::info!(conn_id = %conn_id, "WebSocket connection registered");

        conn_id
    }

    /// Unregister a connection along with every subscription it holds.
    pub fn unregister(&self, conn_id: &str) {
        let owned: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.conn_id == conn_id)
            .map(|entry| entry.id.clone())
            .collect();
        for subscription_id in &owned {
            self.remove_subscription(subscription_id);
        }

        if let Some((_, conn)) = self.connections.remove(conn_id) {
            tracing::info!(
                conn_id = %conn_id,
                user = %conn.user,
                subscriptions = owned.len(),
                "WebSocket connection unregistered"
            );
        }
    }

    /// Start delivering changes of `table` to a connection.
    ///
    /// Returns the subscription ID.
    pub fn subscribe(&self, conn_id: &str, table: TableName, query: QueryDescriptor) -> String {
        let subscription_id = uuid::Uuid::new_v4().to_string();

        self.by_table
            .entry(table.clone())
            .or_default()
            .push(subscription_id.clone());

        tracing::debug!(conn_id = %conn_id, subscription_id = %subscription_id, table = %table, "Subscribed");

        self.subscriptions.insert(
            subscription_id.clone(),
            Subscription {
                id: subscription_id.clone(),
                conn_id: conn_id.to_string(),
                table,
                query,
            },
        );

        subscription_id
    }

    /// Stop a subscription. Only its own connection may stop it.
    pub fn unsubscribe(&self, conn_id: &str, subscription_id: &str) -> bool {
        let owned = self
            .subscriptions
            .get(subscription_id)
            .is_some_and(|sub| sub.conn_id == conn_id);
        if owned {
            self.remove_subscription(subscription_id);
            tracing::debug!(conn_id = %conn_id, subscription_id = %subscription_id, "Unsubscribed");
        }
        owned
    }

    fn remove_subscription(&self, subscription_id: &str) {
        let Some((_, sub)) = self.subscriptions.remove(subscription_id) else {
            return;
        };
        if let Some(mut ids) = self.by_table.get_mut(&sub.table) {
            ids.retain(|id| id != subscription_id);
            // Clean up empty entries
            if ids.is_empty() {
                drop(ids);
                self.by_table.remove(&sub.table);
            }
        }
    }

    /// Broadcast a committed change to the subscriptions of its table.
    ///
    /// Returns the number of subscriptions that received the message.
    pub fn broadcast_change(&self, table: &str, seq: Seq, event: &ChangeEvent) -> usize {
        let targets: Vec<Subscription> = match self.by_table.get(table) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.subscriptions.get(id).map(|sub| sub.clone()))
                .collect(),
            None => return 0,
        };

        let mut sent_count = 0;
        for sub in targets.iter().filter(|sub| sub.wants(event)) {
            let message = ServerMessage::change(&sub.id, seq, event.clone());
            if self.send_to(&sub.conn_id, message) {
                sent_count += 1;
            }
        }

        tracing::debug!(
            table = %table,
            seq,
            id = %event.row_id(),
            recipients = sent_count,
            "Broadcast change to subscriptions"
        );

        sent_count
    }

    /// Send a message to a specific connection.
    pub fn send_to(&self, conn_id: &str, message: ServerMessage) -> bool {
        match self.connections.get(conn_id) {
            Some(conn) => conn.sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get the number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}
