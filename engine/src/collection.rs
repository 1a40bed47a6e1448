//! LiveCollection - the ordered local mirror of one table slice.
//!
//! The collection holds the last snapshot plus every change announced since.
//! Stream events and committed mutation responses go through the same
//! id-keyed path, so the two can arrive in any order without duplicating a row
//! or flickering it back to an older state.

use crate::{Change, ChangeEvent, Committed, QueryDescriptor, Row, RowId, Seq, Snapshot};
use std::collections::HashMap;

/// What applying a change did to the visible rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A row was added
    Inserted,
    /// A held row was replaced
    Replaced,
    /// A held row was removed
    Removed,
    /// Nothing visible changed
    Ignored,
}

impl Applied {
    /// Whether the visible rows changed.
    pub fn is_visible(self) -> bool {
        self != Applied::Ignored
    }
}

/// Ordered rows of one table slice, kept consistent with a change stream.
#[derive(Debug, Clone)]
pub struct LiveCollection {
    query: QueryDescriptor,
    /// Sorted by `query.compare`
    rows: Vec<Row>,
    /// Seq of the last change applied per id, including removed ids
    seen: HashMap<RowId, Seq>,
    /// Seq the current snapshot was read at
    snapshot_seq: Seq,
    /// Highest seq applied so far
    seq: Seq,
}

impl LiveCollection {
    /// Create an empty collection for a query.
    pub fn new(query: QueryDescriptor) -> Self {
        Self {
            query,
            rows: Vec::new(),
            seen: HashMap::new(),
            snapshot_seq: 0,
            seq: 0,
        }
    }

    /// The descriptor this collection mirrors.
    pub fn query(&self) -> &QueryDescriptor {
        &self.query
    }

    /// Replace the contents with a fresh snapshot.
    ///
    /// Rows are re-filtered, projected and sorted, so backends that return the
    /// whole table are handled the same as ones that honour the query.
    pub fn load_snapshot(&mut self, snapshot: Snapshot) {
        self.rows = self.query.apply(snapshot.rows);
        self.seen = self
            .rows
            .iter()
            .map(|row| (row.id.clone(), snapshot.seq))
            .collect();
        self.snapshot_seq = snapshot.seq;
        self.seq = snapshot.seq;
    }

    /// Drop every row and all reconciliation state.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.seen.clear();
        self.snapshot_seq = 0;
        self.seq = 0;
    }

    /// Apply a stream event.
    pub fn apply_change(&mut self, change: Change) -> Applied {
        // Already reflected in the snapshot.
        if change.seq <= self.snapshot_seq {
            return Applied::Ignored;
        }
        self.seq = self.seq.max(change.seq);

        match change.event {
            ChangeEvent::Inserted(row) => self.apply_insert(row, change.seq),
            ChangeEvent::Updated(row) => self.apply_update(row, change.seq),
            ChangeEvent::Deleted(id) => self.apply_delete(id, change.seq),
        }
    }

    /// Apply the committed result of this client's own insert.
    pub fn apply_inserted(&mut self, committed: Committed<Row>) -> Applied {
        self.apply_change(Change::new(committed.seq, ChangeEvent::Inserted(committed.data)))
    }

    /// Apply the committed result of this client's own update.
    pub fn apply_updated(&mut self, committed: Committed<Row>) -> Applied {
        self.apply_change(Change::new(committed.seq, ChangeEvent::Updated(committed.data)))
    }

    /// Apply the committed result of this client's own delete.
    pub fn apply_deleted(&mut self, committed: Committed<RowId>) -> Applied {
        self.apply_change(Change::new(committed.seq, ChangeEvent::Deleted(committed.data)))
    }

    fn is_stale(&self, id: &str, seq: Seq) -> bool {
        self.seen.get(id).is_some_and(|&held| held >= seq)
    }

    fn apply_insert(&mut self, row: Row, seq: Seq) -> Applied {
        if self.position(&row.id).is_some() || self.is_stale(&row.id, seq) {
            return Applied::Ignored;
        }
        if !self.query.matches(&row) {
            return Applied::Ignored;
        }
        self.seen.insert(row.id.clone(), seq);
        self.insert_sorted(row);
        Applied::Inserted
    }

    fn apply_update(&mut self, row: Row, seq: Seq) -> Applied {
        let Some(pos) = self.position(&row.id) else {
            // A filtered slice gains rows whose update makes them match.
            if !self.query.filters.is_empty()
                && !self.is_stale(&row.id, seq)
                && self.query.matches(&row)
            {
                self.seen.insert(row.id.clone(), seq);
                self.insert_sorted(row);
                return Applied::Inserted;
            }
            return Applied::Ignored;
        };
        if self.is_stale(&row.id, seq) {
            return Applied::Ignored;
        }
        self.seen.insert(row.id.clone(), seq);
        self.rows.remove(pos);

        // The row left the slice.
        if !self.query.matches(&row) {
            return Applied::Removed;
        }
        self.insert_sorted(row);
        Applied::Replaced
    }

    fn apply_delete(&mut self, id: RowId, seq: Seq) -> Applied {
        if self.is_stale(&id, seq) {
            return Applied::Ignored;
        }
        let pos = self.position(&id);
        self.seen.insert(id, seq);
        match pos {
            Some(pos) => {
                self.rows.remove(pos);
                Applied::Removed
            }
            None => Applied::Ignored,
        }
    }

    fn insert_sorted(&mut self, row: Row) {
        let row = self.query.project(row);
        let pos = self
            .rows
            .partition_point(|held| self.query.compare(held, &row).is_lt());
        self.rows.insert(pos, row);
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.rows.iter().position(|r| r.id == id)
    }

    /// The rows in query order.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Get a held row by id.
    pub fn get(&self, id: &str) -> Option<&Row> {
        self.rows.iter().find(|r| r.id == id)
    }

    /// Check if a row is held.
    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    /// Number of held rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if no rows are held.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Highest seq applied.
    pub fn seq(&self) -> Seq {
        self.seq
    }

    /// Seq of the current snapshot.
    pub fn snapshot_seq(&self) -> Seq {
        self.snapshot_seq
    }
}
