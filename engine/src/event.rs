//! Change events, mutation requests and the envelopes the backend returns.
//!
//! Stream payloads are parsed into [`ChangeEvent`] at the boundary; nothing
//! downstream branches on raw `op` strings.

use crate::{Fields, Row, RowId, Seq};
use serde::{Deserialize, Serialize};

/// A row-level change announced by the change stream.
///
/// Wire form: `{"op": "insert", "data": {row}}`, `{"op": "update", "data":
/// {row}}`, `{"op": "delete", "data": "id"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "data")]
pub enum ChangeEvent {
    #[serde(rename = "insert")]
    Inserted(Row),
    #[serde(rename = "update")]
    Updated(Row),
    #[serde(rename = "delete")]
    Deleted(RowId),
}

impl ChangeEvent {
    /// The id of the row this event concerns.
    pub fn row_id(&self) -> &RowId {
        match self {
            ChangeEvent::Inserted(row) | ChangeEvent::Updated(row) => &row.id,
            ChangeEvent::Deleted(id) => id,
        }
    }
}

/// A change event stamped with the seq of the write that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub seq: Seq,
    pub event: ChangeEvent,
}

impl Change {
    pub fn new(seq: Seq, event: ChangeEvent) -> Self {
        Self { seq, event }
    }
}

/// The result of a full fetch: rows plus the backend's high-water seq at read
/// time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub rows: Vec<Row>,
    pub seq: Seq,
}

impl Snapshot {
    pub fn new(rows: Vec<Row>, seq: Seq) -> Self {
        Self { rows, seq }
    }
}

/// A write accepted by the backend, with the seq it was assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Committed<T> {
    pub data: T,
    pub seq: Seq,
}

impl<T> Committed<T> {
    pub fn new(data: T, seq: Seq) -> Self {
        Self { data, seq }
    }
}

/// A write request issued by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Mutation {
    /// Create a row; the backend assigns the id unless `fields` carries one
    Insert { fields: Fields },
    /// Overwrite the given fields of an existing row
    Update { id: RowId, fields: Fields },
    /// Remove a row
    Delete { id: RowId },
}

impl Mutation {
    /// The targeted row id, if the mutation names one.
    pub fn row_id(&self) -> Option<&RowId> {
        match self {
            Mutation::Insert { .. } => None,
            Mutation::Update { id, .. } | Mutation::Delete { id } => Some(id),
        }
    }

    /// The fields carried by the mutation.
    pub fn fields(&self) -> Option<&Fields> {
        match self {
            Mutation::Insert { fields } | Mutation::Update { fields, .. } => Some(fields),
            Mutation::Delete { .. } => None,
        }
    }
}
