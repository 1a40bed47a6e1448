//! The backend-as-a-service contract a live table talks to.

use async_trait::async_trait;
use futures::stream::BoxStream;
use quarry_engine::error::Result;
use quarry_engine::{Change, Committed, Fields, QueryDescriptor, Row, RowId, Snapshot};

/// Push channel of committed changes for one table.
///
/// An `Err` item or the end of the stream means the subscription was lost.
/// Dropping the stream releases the subscription.
pub type ChangeStream = BoxStream<'static, Result<Change>>;

/// Query, subscribe and point-write primitives.
///
/// Every write is stamped with a strictly increasing seq; query responses
/// carry the high-water seq at read time. Errors are classified by
/// [`quarry_engine::ErrorKind`].
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Read the rows of `table` that match `query`.
    async fn query(&self, table: &str, query: &QueryDescriptor) -> Result<Snapshot>;

    /// Open a change stream for `table`.
    ///
    /// Changes committed after this call returns are delivered. Backends may
    /// drop inserts outside `query`'s filters; updates and deletes are always
    /// delivered.
    async fn subscribe(&self, table: &str, query: &QueryDescriptor) -> Result<ChangeStream>;

    /// Create a row. The backend assigns the id unless `fields` carries one.
    async fn insert(&self, table: &str, fields: Fields) -> Result<Committed<Row>>;

    /// Overwrite the given fields of a row and return the full committed row.
    async fn update(&self, table: &str, id: &str, fields: Fields) -> Result<Committed<Row>>;

    /// Remove a row.
    async fn delete(&self, table: &str, id: &str) -> Result<Committed<RowId>>;
}
