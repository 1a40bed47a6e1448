//! LiveTable - a live, ordered mirror of one remote table slice.
//!
//! A background sync task subscribes to the table's change stream, then
//! fetches the snapshot, then applies buffered and live changes in arrival
//! order. Mutations run on the caller's task and apply their committed result
//! through the same id-keyed, seq-guarded path as stream events.
//!
//! All state lives in a `watch` channel; every event or committed write is
//! applied inside one `send_if_modified` call, so each application is atomic
//! and observers wake only when the visible rows change.

use crate::backend::{Backend, ChangeStream};
use crate::config::{ApplyWrites, ClientConfig};
use crate::reconnect::Backoff;
use crate::state::TableState;
use futures::StreamExt;
use quarry_engine::error::Result;
use quarry_engine::{
    Applied, Error, Fields, LiveCollection, Mutation, QueryDescriptor, Row, TableName,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Shared {
    collection: LiveCollection,
    loading: bool,
    error: Option<Error>,
    stale: bool,
}

impl Shared {
    fn view(&self) -> TableState {
        TableState {
            data: self.collection.rows().to_vec(),
            loading: self.loading,
            error: self.error.clone(),
            stale: self.stale,
        }
    }
}

struct Inner {
    table: TableName,
    backend: Arc<dyn Backend>,
    config: ClientConfig,
    state: watch::Sender<Shared>,
    alive: AtomicBool,
}

impl Inner {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(Error::Closed(self.table.clone()))
        }
    }

    /// Apply a change to the collection unless the handle was closed.
    fn apply(&self, f: impl FnOnce(&mut LiveCollection) -> Applied) -> Applied {
        if !self.is_alive() {
            debug!(table = %self.table, "handle closed, discarding change");
            return Applied::Ignored;
        }
        let mut applied = Applied::Ignored;
        self.state.send_if_modified(|shared| {
            applied = f(&mut shared.collection);
            applied.is_visible()
        });
        applied
    }

    /// Subscribe, fetch and load a fresh snapshot. Returns the stream whose
    /// buffered events follow the snapshot.
    async fn resync(&self) -> Result<ChangeStream> {
        let query = self.collection_query();
        let stream = self.backend.subscribe(&self.table, &query).await?;
        self.ensure_open()?;

        let snapshot = self.backend.query(&self.table, &query).await?;
        self.ensure_open()?;

        let seq = snapshot.seq;
        let count = snapshot.rows.len();
        self.state.send_modify(|shared| {
            shared.collection.load_snapshot(snapshot);
            shared.loading = false;
            shared.error = None;
            shared.stale = false;
        });
        info!(table = %self.table, seq, rows = count, "snapshot loaded");
        Ok(stream)
    }

    /// Apply stream changes until the stream fails or ends.
    async fn follow(&self, stream: &mut ChangeStream) -> Error {
        while let Some(item) = stream.next().await {
            match item {
                Ok(change) => {
                    let seq = change.seq;
                    let id = change.event.row_id().clone();
                    let applied = self.apply(|collection| collection.apply_change(change));
                    debug!(table = %self.table, seq, id = %id, ?applied, "change applied");
                }
                Err(err) => return err,
            }
        }
        Error::SubscriptionLost("change stream ended".into())
    }

    fn collection_query(&self) -> QueryDescriptor {
        self.state.borrow().collection.query().clone()
    }

    fn mark_stale(&self) {
        self.state.send_if_modified(|shared| {
            let changed = !shared.stale;
            shared.stale = true;
            changed
        });
    }

    /// Stop syncing and surface `err`.
    fn fail(&self, err: Error, established: bool) {
        if !self.is_alive() {
            return;
        }
        self.state.send_modify(|shared| {
            shared.loading = false;
            shared.stale |= established;
            shared.error = Some(err);
        });
    }
}

/// Keep the collection in sync until closed or out of retries.
async fn sync(inner: Arc<Inner>) {
    let mut backoff = Backoff::new(inner.config.reconnect.clone());
    let mut established = false;

    loop {
        let err = match inner.resync().await {
            Ok(mut stream) => {
                backoff.reset();
                established = true;
                let err = inner.follow(&mut stream).await;
                drop(stream);
                if !inner.is_alive() {
                    return;
                }
                warn!(table = %inner.table, error = %err, "change stream lost");
                inner.mark_stale();
                err
            }
            Err(err) => {
                if !inner.is_alive() {
                    return;
                }
                if !established {
                    // Initial fetch failed; the retry affordance is `refresh`.
                    warn!(table = %inner.table, error = %err, "initial fetch failed");
                    inner.fail(err, false);
                    return;
                }
                warn!(table = %inner.table, error = %err, attempt = backoff.attempt(), "resync failed");
                err
            }
        };

        if !err.is_retryable() {
            inner.fail(err, established);
            return;
        }

        match backoff.next_delay() {
            Some(delay) => tokio::time::sleep(delay).await,
            None => {
                warn!(table = %inner.table, attempts = backoff.attempt(), "giving up on change stream");
                inner.fail(
                    Error::SubscriptionLost(format!("reconnect failed: {err}")),
                    established,
                );
                return;
            }
        }
    }
}

/// A live view of one remote table slice plus write operations.
///
/// Dropping the handle closes it.
pub struct LiveTable {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LiveTable {
    /// Open a live table with the default configuration.
    ///
    /// Returns at once with `loading = true`; must be called within a tokio
    /// runtime.
    pub fn open(backend: Arc<dyn Backend>, table: impl Into<TableName>, query: QueryDescriptor) -> Self {
        Self::open_with(backend, table, query, ClientConfig::default())
    }

    pub fn open_with(
        backend: Arc<dyn Backend>,
        table: impl Into<TableName>,
        query: QueryDescriptor,
        config: ClientConfig,
    ) -> Self {
        let (state, _) = watch::channel(Shared {
            collection: LiveCollection::new(query),
            loading: true,
            error: None,
            stale: false,
        });
        let inner = Arc::new(Inner {
            table: table.into(),
            backend,
            config,
            state,
            alive: AtomicBool::new(true),
        });
        info!(table = %inner.table, "opening live table");

        let task = tokio::spawn(sync(inner.clone()));
        Self {
            inner,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn table(&self) -> &str {
        &self.inner.table
    }

    pub fn query(&self) -> QueryDescriptor {
        self.inner.collection_query()
    }

    /// Current state.
    pub fn state(&self) -> TableState {
        self.inner.state.borrow().view()
    }

    /// Current rows in query order.
    pub fn rows(&self) -> Vec<Row> {
        self.inner.state.borrow().collection.rows().to_vec()
    }

    pub fn get(&self, id: &str) -> Option<Row> {
        self.inner.state.borrow().collection.get(id).cloned()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.borrow().loading
    }

    pub fn is_closed(&self) -> bool {
        !self.inner.is_alive()
    }

    /// Observe state changes.
    pub fn watch(&self) -> StateWatch {
        StateWatch {
            receiver: self.inner.state.subscribe(),
        }
    }

    /// Wait until the current load finishes; returns its error, if any.
    pub async fn ready(&self) -> Result<()> {
        let state = self.wait_for(|state| !state.loading).await?;
        match state.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Wait until `predicate` holds for the state and return that state.
    ///
    /// Fails with [`Error::Closed`] if the handle is closed before or while
    /// waiting.
    pub async fn wait_for(&self, mut predicate: impl FnMut(&TableState) -> bool) -> Result<TableState> {
        self.inner.ensure_open()?;
        let closed = || Error::Closed(self.inner.table.clone());
        let mut receiver = self.inner.state.subscribe();
        let shared = receiver
            .wait_for(|shared| !self.inner.is_alive() || predicate(&shared.view()))
            .await
            .map_err(|_| closed())?;
        if !self.inner.is_alive() {
            return Err(closed());
        }
        Ok(shared.view())
    }

    /// Create a row. On success the committed row is placed in the collection
    /// at its order-by position; the echoed insert event is a no-op.
    pub async fn insert(&self, fields: Fields) -> Result<Row> {
        self.inner.ensure_open()?;
        self.validate(|| Mutation::Insert {
            fields: fields.clone(),
        })?;

        let committed = self
            .inner
            .backend
            .insert(&self.inner.table, fields)
            .await
            .inspect_err(|err| warn!(table = %self.inner.table, error = %err, "insert failed"))?;

        let row = committed.data.clone();
        let seq = committed.seq;
        let applied = self.inner.apply(|collection| collection.apply_inserted(committed));
        debug!(table = %self.inner.table, id = %row.id, seq, ?applied, "insert committed");
        Ok(row)
    }

    /// Overwrite the given fields of a row.
    pub async fn update(&self, id: &str, fields: Fields) -> Result<Row> {
        self.inner.ensure_open()?;
        self.validate(|| Mutation::Update {
            id: id.to_string(),
            fields: fields.clone(),
        })?;

        let committed = self
            .inner
            .backend
            .update(&self.inner.table, id, fields)
            .await
            .inspect_err(|err| warn!(table = %self.inner.table, id, error = %err, "update failed"))?;

        let row = committed.data.clone();
        if self.inner.config.apply_writes == ApplyWrites::OnConfirm {
            let seq = committed.seq;
            let applied = self.inner.apply(|collection| collection.apply_updated(committed));
            debug!(table = %self.inner.table, id, seq, ?applied, "update committed");
        }
        Ok(row)
    }

    /// Remove a row.
    pub async fn remove(&self, id: &str) -> Result<()> {
        self.inner.ensure_open()?;

        let committed = self
            .inner
            .backend
            .delete(&self.inner.table, id)
            .await
            .inspect_err(|err| warn!(table = %self.inner.table, id, error = %err, "remove failed"))?;

        if self.inner.config.apply_writes == ApplyWrites::OnConfirm {
            let seq = committed.seq;
            let applied = self.inner.apply(|collection| collection.apply_deleted(committed));
            debug!(table = %self.inner.table, id, seq, ?applied, "remove committed");
        }
        Ok(())
    }

    /// Re-subscribe and re-fetch the snapshot.
    ///
    /// The retry affordance after a failed initial fetch or after the stream
    /// gave up. Rows stay visible while the new snapshot loads.
    pub fn refresh(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let mut task = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = task.take() {
            previous.abort();
        }
        self.inner.state.send_modify(|shared| {
            shared.loading = true;
            shared.error = None;
        });
        info!(table = %self.inner.table, "refreshing live table");
        *task = Some(tokio::spawn(sync(self.inner.clone())));
        Ok(())
    }

    /// Release the change stream. Safe to call any number of times; later
    /// calls do nothing.
    pub fn close(&self) {
        if !self.inner.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut task = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(task) = task.take() {
            // Dropping the task's future drops the stream.
            task.abort();
        }
        // Wake pending `wait_for` calls so they observe the close.
        self.inner.state.send_modify(|_| {});
        info!(table = %self.inner.table, "live table closed");
    }

    fn validate(&self, mutation: impl FnOnce() -> Mutation) -> Result<()> {
        match &self.inner.config.schema {
            Some(schema) => schema.validate_mutation(&self.inner.table, &mutation()),
            None => Ok(()),
        }
    }
}

impl Drop for LiveTable {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for LiveTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveTable")
            .field("table", &self.inner.table)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receiver of [`TableState`] updates.
pub struct StateWatch {
    receiver: watch::Receiver<Shared>,
}

impl StateWatch {
    /// Wait for the next visible change. Returns `false` once the table is
    /// gone.
    pub async fn changed(&mut self) -> bool {
        self.receiver.changed().await.is_ok()
    }

    pub fn current(&mut self) -> TableState {
        self.receiver.borrow_and_update().view()
    }
}
