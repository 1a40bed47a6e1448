//! # Quarry Client
//!
//! The realtime table client every back-office page is built on: a live,
//! ordered view of one remote table slice plus insert / update / remove with
//! a consistent error contract.
//!
//! ```no_run
//! use quarry_client::{HttpBackend, LiveTable};
//! use quarry_engine::QueryDescriptor;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn demo() -> quarry_engine::error::Result<()> {
//! let backend = Arc::new(HttpBackend::new("http://localhost:3000")?);
//! let shipments = LiveTable::open(
//!     backend,
//!     "shipments",
//!     QueryDescriptor::all().order_by("created_at", false),
//! );
//! shipments.ready().await?;
//!
//! let fields = json!({"reference": "SHP-001"}).as_object().cloned().unwrap_or_default();
//! let row = shipments.insert(fields).await?;
//! assert!(shipments.get(&row.id).is_some());
//!
//! shipments.close();
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees
//!
//! - The collection is always the last snapshot plus exactly the changes
//!   announced since; every change is keyed by row id and guarded by the
//!   backend's seq, so a write's response and its echoed event never produce
//!   two rows or a stale flicker
//! - A failed write leaves the collection untouched
//! - A lost change stream marks the state `stale`, reconnects with backoff and
//!   re-fetches; when retries run out the state carries `SubscriptionLost`
//! - `close` (or drop) releases the stream once; results that arrive later are
//!   not applied

pub mod backend;
pub mod config;
pub mod http;
pub mod memory;
pub mod reconnect;
pub mod state;
pub mod table;

pub use backend::{Backend, ChangeStream};
pub use config::{ApplyWrites, ClientConfig, ConfigError, ServerConfig};
pub use http::HttpBackend;
pub use memory::{Call, MemoryBackend};
pub use reconnect::{Backoff, Heartbeat, ReconnectPolicy};
pub use state::{Outcome, TableState};
pub use table::{LiveTable, StateWatch};
