//! WebSocket support for change streams.
//!
//! Clients connect once and open any number of table subscriptions over the
//! connection. The message types live in `quarry_engine::protocol`, shared
//! with the client's HTTP backend.

mod manager;

pub use manager::ConnectionManager;
pub use quarry_engine::{ClientMessage, ServerMessage};
