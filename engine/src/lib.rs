//! # Quarry Engine
//!
//! The deterministic core behind Quarry's live tables.
//!
//! Every back-office page (purchases, sales, shipments, equipment, fuel,
//! employees, expenses, concessions) shows a slice of one remote table that
//! stays current while other sessions edit it. This crate holds the pieces of
//! that contract which need no IO: rows, query descriptors, change events,
//! the ordered live collection that reconciles snapshots, stream events and
//! committed writes, and the table schemas that validate writes.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches the network; clients and servers do
//! - **Deterministic**: the same snapshot and change sequence always yields the
//!   same collection
//! - **Keyed by id**: every reconciliation decision is made per row id and
//!   guarded by the backend's write sequence number
//!
//! ## Core Concepts
//!
//! ### Rows
//!
//! A [`Row`] is an identified record with free-form JSON fields. Its `id` never
//! changes.
//!
//! ### Sequence numbers
//!
//! The backend stamps every committed write with a strictly increasing
//! [`Seq`]. A [`Snapshot`] carries the high-water mark at read time, every
//! [`Change`] carries the seq of its write, and every [`Committed`] mutation
//! response carries the seq it was assigned.
//!
//! ### Live collections
//!
//! A [`LiveCollection`] mirrors one table slice under a [`QueryDescriptor`]:
//! - Changes at or below the snapshot's seq are already reflected and skipped
//! - `Inserted` for a held id is a no-op
//! - `Updated` / `Deleted` for an unknown id is a no-op
//! - Anything older than what is held for an id (tombstones included) is a no-op
//!
//! ## Quick Start
//!
//! ```rust
//! use quarry_engine::{Change, ChangeEvent, LiveCollection, QueryDescriptor, Row, Snapshot};
//! use serde_json::json;
//!
//! let query = QueryDescriptor::all().order_by("created_at", false);
//! let mut collection = LiveCollection::new(query);
//!
//! collection.load_snapshot(Snapshot::new(
//!     vec![
//!         Row::from_value(json!({"id": "p2", "created_at": 2})).unwrap(),
//!         Row::from_value(json!({"id": "p1", "created_at": 1})).unwrap(),
//!     ],
//!     10,
//! ));
//!
//! let row = Row::from_value(json!({"id": "p3", "created_at": 3})).unwrap();
//! collection.apply_change(Change::new(11, ChangeEvent::Inserted(row)));
//!
//! let ids: Vec<_> = collection.rows().iter().map(|r| r.id.as_str()).collect();
//! assert_eq!(ids, ["p3", "p2", "p1"]);
//! ```

pub mod aggregate;
pub mod collection;
pub mod error;
pub mod event;
pub mod fields;
pub mod protocol;
pub mod query;
pub mod row;
pub mod schema;

// Re-export main types at crate root
pub use collection::{Applied, LiveCollection};
pub use error::{Error, ErrorKind};
pub use event::{Change, ChangeEvent, Committed, Mutation, Snapshot};
pub use fields::{Location, QualitySpecifications};
pub use protocol::{ClientMessage, ServerMessage};
pub use query::{Filter, FilterOp, OrderBy, QueryDescriptor, Selection};
pub use row::{Fields, Row};
pub use schema::{FieldDef, FieldType, Schema, TableSchema};

/// Type aliases for clarity
pub type RowId = String;
pub type TableName = String;
pub type Seq = u64;
