//! In-process backend with deterministic, controllable delivery.
//!
//! Used by tests and demos. Beyond the [`Backend`] contract it can inject
//! failures, hold change events or write responses back and release them
//! later, drop every live subscription, and count subscribe / unsubscribe
//! calls.

use crate::backend::{Backend, ChangeStream};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use quarry_engine::error::Result;
use quarry_engine::{
    Change, ChangeEvent, Committed, Error, Fields, Mutation, QueryDescriptor, Row, RowId, Schema,
    Seq, Snapshot, TableName,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};

/// A backend call, for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    Query,
    Subscribe,
    Insert,
    Update,
    Delete,
}

struct Subscriber {
    id: u64,
    table: TableName,
    query: QueryDescriptor,
    sender: mpsc::UnboundedSender<Result<Change>>,
}

#[derive(Default)]
struct State {
    tables: HashMap<TableName, BTreeMap<RowId, Row>>,
    seq: Seq,
    schema: Option<Schema>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    failures: HashMap<Call, VecDeque<Error>>,
    assigned_ids: VecDeque<RowId>,
    /// Events waiting for `release_events`, when held
    held_events: Option<Vec<(u64, Result<Change>)>>,
    subscribes: usize,
    unsubscribes: usize,
}

impl State {
    fn take_failure(&mut self, call: Call) -> Result<()> {
        match self.failures.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn table_mut(&mut self, table: &str) -> Result<&mut BTreeMap<RowId, Row>> {
        if let Some(schema) = &self.schema {
            schema.table(table)?;
        }
        Ok(self.tables.entry(table.to_string()).or_default())
    }

    fn validate(&self, table: &str, mutation: &Mutation) -> Result<()> {
        match &self.schema {
            Some(schema) => schema.validate_mutation(table, mutation),
            None => Ok(()),
        }
    }

    fn deliver(&mut self, subscriber: u64, item: Result<Change>) {
        if let Some(held) = self.held_events.as_mut() {
            held.push((subscriber, item));
            return;
        }
        if let Some(sub) = self.subscribers.iter().find(|s| s.id == subscriber) {
            let _ = sub.sender.send(item);
        }
    }

    /// Commit a change and announce it to the table's subscribers.
    fn commit(&mut self, table: &str, event: ChangeEvent) -> Seq {
        self.seq += 1;
        let seq = self.seq;

        let recipients: Vec<u64> = self
            .subscribers
            .iter()
            .filter(|s| s.table == table)
            .filter(|s| match &event {
                ChangeEvent::Inserted(row) => s.query.matches(row),
                ChangeEvent::Updated(_) | ChangeEvent::Deleted(_) => true,
            })
            .map(|s| s.id)
            .collect();

        tracing::trace!(table, seq, recipients = recipients.len(), "memory backend commit");
        for id in recipients {
            self.deliver(id, Ok(Change::new(seq, event.clone())));
        }
        seq
    }
}

/// In-memory [`Backend`].
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
    /// `false` while write responses are held
    responses: watch::Sender<bool>,
    held_responses: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (responses, _) = watch::channel(true);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            responses,
            held_responses: AtomicUsize::new(0),
        }
    }

    /// Validate writes against `schema` and reject tables it does not declare.
    pub fn with_schema(self, schema: Schema) -> Self {
        self.lock().schema = Some(schema);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves consistent data behind.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Put rows in a table without announcing them.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Row>) {
        let mut state = self.lock();
        for row in rows {
            state.seq += 1;
            state
                .tables
                .entry(table.to_string())
                .or_default()
                .insert(row.id.clone(), row);
        }
    }

    /// The table's rows, by id.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Current high-water seq.
    pub fn seq(&self) -> Seq {
        self.lock().seq
    }

    /// Fail the next call of this kind with `err`. Queued failures are used in
    /// order.
    pub fn fail_next(&self, call: Call, err: Error) {
        self.lock().failures.entry(call).or_default().push_back(err);
    }

    /// Fail the next `times` calls of this kind with `err`.
    pub fn fail_times(&self, call: Call, times: usize, err: Error) {
        let mut state = self.lock();
        let queue = state.failures.entry(call).or_default();
        for _ in 0..times {
            queue.push_back(err.clone());
        }
    }

    /// Ids handed to the next inserts that do not carry their own.
    pub fn assign_ids<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<RowId>,
    {
        self.lock().assigned_ids.extend(ids.into_iter().map(Into::into));
    }

    /// Commit a write as another session would: no response, only events.
    pub fn remote_write(&self, table: &str, mutation: Mutation) -> Result<Seq> {
        let mut state = self.lock();
        state.validate(table, &mutation)?;
        match mutation {
            Mutation::Insert { fields } => {
                let row = Self::new_row(&mut state, fields);
                state.table_mut(table)?.insert(row.id.clone(), row.clone());
                Ok(state.commit(table, ChangeEvent::Inserted(row)))
            }
            Mutation::Update { id, fields } => {
                let row = Self::merge(&mut state, table, &id, &fields)?;
                Ok(state.commit(table, ChangeEvent::Updated(row)))
            }
            Mutation::Delete { id } => {
                Self::remove(&mut state, table, &id)?;
                Ok(state.commit(table, ChangeEvent::Deleted(id)))
            }
        }
    }

    /// Queue change events instead of delivering them.
    pub fn hold_events(&self) {
        let mut state = self.lock();
        if state.held_events.is_none() {
            state.held_events = Some(Vec::new());
        }
    }

    /// Deliver queued events in commit order and stop holding.
    pub fn release_events(&self) {
        let mut state = self.lock();
        if let Some(held) = state.held_events.take() {
            for (subscriber, item) in held {
                state.deliver(subscriber, item);
            }
        }
    }

    /// Events currently held back.
    pub fn held_events(&self) -> usize {
        self.lock().held_events.as_ref().map_or(0, Vec::len)
    }

    /// Commit writes but keep their responses pending until
    /// [`release_responses`](Self::release_responses).
    pub fn hold_responses(&self) {
        self.responses.send_replace(false);
    }

    pub fn release_responses(&self) {
        self.responses.send_replace(true);
    }

    /// Writes committed whose response is still held.
    pub fn held_responses(&self) -> usize {
        self.held_responses.load(Ordering::SeqCst)
    }

    /// Cut every live change stream, as a network drop would.
    pub fn disconnect_all(&self) {
        let mut state = self.lock();
        let subscribers = std::mem::take(&mut state.subscribers);
        tracing::debug!(count = subscribers.len(), "memory backend dropping subscriptions");
        for sub in subscribers {
            let _ = sub
                .sender
                .send(Err(Error::SubscriptionLost("connection reset".into())));
        }
    }

    /// Subscriptions currently open.
    pub fn subscription_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Total subscribe calls that succeeded.
    pub fn subscribe_count(&self) -> usize {
        self.lock().subscribes
    }

    /// Total subscriptions released by their holder.
    pub fn unsubscribe_count(&self) -> usize {
        self.lock().unsubscribes
    }

    fn new_row(state: &mut State, mut fields: Fields) -> Row {
        let id = match fields.remove("id") {
            Some(serde_json::Value::String(id)) => id,
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => state
                .assigned_ids
                .pop_front()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        };
        Row::new(id, fields)
    }

    fn merge(state: &mut State, table: &str, id: &str, fields: &Fields) -> Result<Row> {
        let row = state
            .table_mut(table)?
            .get_mut(id)
            .ok_or_else(|| Error::RowNotFound(id.to_string()))?;
        row.merge(fields);
        Ok(row.clone())
    }

    fn remove(state: &mut State, table: &str, id: &str) -> Result<()> {
        state
            .table_mut(table)?
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::RowNotFound(id.to_string()))
    }

    async fn respond<T>(&self, committed: Committed<T>) -> Committed<T> {
        let mut open = self.responses.subscribe();
        if !*open.borrow() {
            self.held_responses.fetch_add(1, Ordering::SeqCst);
            // The sender lives as long as `self`.
            let _ = open.wait_for(|open| *open).await;
            self.held_responses.fetch_sub(1, Ordering::SeqCst);
        }
        committed
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn query(&self, table: &str, query: &QueryDescriptor) -> Result<Snapshot> {
        let mut state = self.lock();
        state.take_failure(Call::Query)?;
        let seq = state.seq;
        let rows = state.table_mut(table)?.values().cloned();
        Ok(Snapshot::new(query.apply(rows), seq))
    }

    async fn subscribe(&self, table: &str, query: &QueryDescriptor) -> Result<ChangeStream> {
        let mut state = self.lock();
        state.take_failure(Call::Subscribe)?;
        state.table_mut(table)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        state.next_subscriber += 1;
        let id = state.next_subscriber;
        state.subscribers.push(Subscriber {
            id,
            table: table.to_string(),
            query: query.clone(),
            sender,
        });
        state.subscribes += 1;

        Ok(Subscription {
            id,
            receiver,
            state: Arc::downgrade(&self.state),
        }
        .boxed())
    }

    async fn insert(&self, table: &str, fields: Fields) -> Result<Committed<Row>> {
        let committed = {
            let mut state = self.lock();
            state.take_failure(Call::Insert)?;
            state.validate(table, &Mutation::Insert { fields: fields.clone() })?;
            let row = Self::new_row(&mut state, fields);
            let rows = state.table_mut(table)?;
            if rows.contains_key(&row.id) {
                return Err(Error::InvalidPayload(format!("duplicate id {}", row.id)));
            }
            rows.insert(row.id.clone(), row.clone());
            let seq = state.commit(table, ChangeEvent::Inserted(row.clone()));
            Committed::new(row, seq)
        };
        Ok(self.respond(committed).await)
    }

    async fn update(&self, table: &str, id: &str, fields: Fields) -> Result<Committed<Row>> {
        let committed = {
            let mut state = self.lock();
            state.take_failure(Call::Update)?;
            state.validate(
                table,
                &Mutation::Update {
                    id: id.to_string(),
                    fields: fields.clone(),
                },
            )?;
            let row = Self::merge(&mut state, table, id, &fields)?;
            let seq = state.commit(table, ChangeEvent::Updated(row.clone()));
            Committed::new(row, seq)
        };
        Ok(self.respond(committed).await)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<Committed<RowId>> {
        let committed = {
            let mut state = self.lock();
            state.take_failure(Call::Delete)?;
            Self::remove(&mut state, table, id)?;
            let seq = state.commit(table, ChangeEvent::Deleted(id.to_string()));
            Committed::new(id.to_string(), seq)
        };
        Ok(self.respond(committed).await)
    }
}

/// Receiving end of one subscription; unsubscribes on drop.
struct Subscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<Result<Change>>,
    state: Weak<Mutex<State>>,
}

impl Stream for Subscription {
    type Item = Result<Change>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            state.subscribers.retain(|s| s.id != self.id);
            state.unsubscribes += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn writes_are_sequenced_and_announced() {
        let backend = MemoryBackend::new();
        let mut stream = backend.subscribe("sales", &QueryDescriptor::all()).await.unwrap();

        backend.assign_ids(["s1"]);
        let inserted = backend.insert("sales", fields(json!({"buyer_name": "Acme"}))).await.unwrap();
        assert_eq!(inserted.data.id, "s1");
        assert_eq!(inserted.seq, 1);

        let updated = backend
            .update("sales", "s1", fields(json!({"status": "paid"})))
            .await
            .unwrap();
        assert_eq!(updated.data.field("buyer_name"), Some(&json!("Acme")));
        assert_eq!(updated.seq, 2);

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.seq, 1);
        assert!(matches!(first.event, ChangeEvent::Inserted(_)));
        let second = stream.next().await.unwrap().unwrap();
        assert!(matches!(second.event, ChangeEvent::Updated(ref row) if row.id == "s1"));
    }

    #[tokio::test]
    async fn missing_rows_are_not_found() {
        let backend = MemoryBackend::new();
        let err = backend
            .update("sales", "missing-id", fields(json!({"status": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RowNotFound(ref id) if id == "missing-id"));

        let err = backend.delete("sales", "missing-id").await.unwrap_err();
        assert_eq!(err.kind(), quarry_engine::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn filtered_subscription_skips_foreign_inserts() {
        let backend = MemoryBackend::new();
        let query = QueryDescriptor::all().eq("status", "open");
        let mut stream = backend.subscribe("shipments", &query).await.unwrap();

        backend
            .remote_write("shipments", Mutation::Insert { fields: fields(json!({"id": "a", "status": "closed"})) })
            .unwrap();
        backend
            .remote_write("shipments", Mutation::Insert { fields: fields(json!({"id": "b", "status": "open"})) })
            .unwrap();

        let change = stream.next().await.unwrap().unwrap();
        assert_eq!(change.event.row_id(), "b");
        assert_eq!(change.seq, 2);
    }

    #[tokio::test]
    async fn schema_rejects_invalid_writes() {
        let backend = MemoryBackend::new().with_schema(Schema::back_office());
        let err = backend
            .insert("fuel_logs", fields(json!({"equipment_id": "eq-1", "litres": "lots"})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), quarry_engine::ErrorKind::Validation);

        let err = backend.query("unknown", &QueryDescriptor::all()).await.unwrap_err();
        assert_eq!(err.kind(), quarry_engine::ErrorKind::NotFound);
        assert_eq!(backend.seq(), 0);
    }

    #[tokio::test]
    async fn dropping_stream_unsubscribes_once() {
        let backend = MemoryBackend::new();
        let stream = backend.subscribe("sales", &QueryDescriptor::all()).await.unwrap();
        assert_eq!(backend.subscription_count(), 1);

        drop(stream);
        assert_eq!(backend.subscription_count(), 0);
        assert_eq!(backend.unsubscribe_count(), 1);
    }

    #[tokio::test]
    async fn held_events_release_in_order() {
        let backend = MemoryBackend::new();
        let mut stream = backend.subscribe("sales", &QueryDescriptor::all()).await.unwrap();

        backend.hold_events();
        backend
            .remote_write("sales", Mutation::Insert { fields: fields(json!({"id": "a"})) })
            .unwrap();
        backend
            .remote_write("sales", Mutation::Delete { id: "a".into() })
            .unwrap();
        assert_eq!(backend.held_events(), 2);

        backend.release_events();
        assert_eq!(stream.next().await.unwrap().unwrap().seq, 1);
        assert_eq!(stream.next().await.unwrap().unwrap().seq, 2);
    }

    #[tokio::test]
    async fn injected_failures_are_used_once() {
        let backend = MemoryBackend::new();
        backend.fail_next(Call::Query, Error::Network("timeout".into()));

        let err = backend.query("sales", &QueryDescriptor::all()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(backend.query("sales", &QueryDescriptor::all()).await.is_ok());
    }
}
