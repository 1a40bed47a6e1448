//! Request handlers for table reads, writes and change streams.

mod rows;
mod websocket;

pub use rows::*;
pub use websocket::*;
