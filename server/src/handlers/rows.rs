//! Table handlers: snapshot reads, point writes and change-log catch-up.
//!
//! Writes are serialized through `AppState::writes` from commit to broadcast,
//! so subscribers receive every table's changes in seq order.

use chrono::{SecondsFormat, Utc};
use quarry_engine::{
    Change, ChangeEvent, Committed, Error, Fields, QueryDescriptor, Row, RowId, Seq,
    Snapshot, TableSchema,
};
use serde::{Deserialize, Serialize};

use crate::db;
use crate::error::{AppError, Result};
use crate::AppState;

/// Default number of changes returned per catch-up page.
const DEFAULT_CHANGES_LIMIT: i64 = 500;
/// Upper bound on changes returned per catch-up page.
const MAX_CHANGES_LIMIT: i64 = 5000;

/// Query parameters for the change-log catch-up.
#[derive(Debug, Deserialize)]
pub struct ChangesQuery {
    /// Return changes with a seq above this one
    #[serde(default)]
    pub since: Seq,
    /// Maximum number of changes to return
    pub limit: Option<i64>,
}

/// Response for the change-log catch-up.
#[derive(Debug, Serialize)]
pub struct ChangesResponse {
    pub changes: Vec<Change>,
    /// Whether there are more changes to fetch
    pub has_more: bool,
}

/// Read a table slice: every stored row, filtered, ordered and projected.
pub async fn handle_query(
    state: &AppState,
    table: &str,
    params: &[(String, String)],
) -> Result<Snapshot> {
    state.schema.table(table)?;
    let query = QueryDescriptor::from_params(params.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;

    let snapshot = db::fetch_snapshot(&state.pool, table).await?;
    tracing::debug!(table, rows = snapshot.rows.len(), seq = snapshot.seq, "Fetched snapshot");

    Ok(Snapshot::new(query.apply(snapshot.rows), snapshot.seq))
}

/// Create a row and broadcast its insert.
pub async fn handle_insert(state: &AppState, table: &str, fields: Fields) -> Result<Committed<Row>> {
    let schema = state.schema.table(table)?;
    let row = prepare_insert(schema, fields)?;
    schema.validate_insert(&row.fields)?;

    let _writes = state.writes.lock().await;
    let seq = db::insert_row(&state.pool, table, &row)
        .await?
        .ok_or_else(|| Error::InvalidPayload(format!("row {} already exists", row.id)))?;

    tracing::info!(table, id = %row.id, seq, "Row inserted");
    state
        .conn_manager
        .broadcast_change(table, seq, &ChangeEvent::Inserted(row.clone()));

    Ok(Committed::new(row, seq))
}

/// Overwrite fields of a row and broadcast the resulting row.
pub async fn handle_update(
    state: &AppState,
    table: &str,
    id: &str,
    mut fields: Fields,
) -> Result<Committed<Row>> {
    if let Some(sent) = fields.remove("id") {
        if sent.as_str() != Some(id) {
            return Err(AppError::BadRequest("row id cannot be changed".into()));
        }
    }
    state.schema.table(table)?.validate_update(&fields)?;

    let _writes = state.writes.lock().await;
    let (row, seq) = db::update_row(&state.pool, table, id, &fields)
        .await?
        .ok_or_else(|| Error::RowNotFound(id.to_string()))?;

    tracing::info!(table, id, seq, "Row updated");
    state
        .conn_manager
        .broadcast_change(table, seq, &ChangeEvent::Updated(row.clone()));

    Ok(Committed::new(row, seq))
}

/// Delete a row and broadcast its removal.
pub async fn handle_delete(state: &AppState, table: &str, id: &str) -> Result<Committed<RowId>> {
    state.schema.table(table)?;

    let _writes = state.writes.lock().await;
    let seq = db::delete_row(&state.pool, table, id)
        .await?
        .ok_or_else(|| Error::RowNotFound(id.to_string()))?;

    tracing::info!(table, id, seq, "Row deleted");
    state
        .conn_manager
        .broadcast_change(table, seq, &ChangeEvent::Deleted(id.to_string()));

    Ok(Committed::new(id.to_string(), seq))
}

/// Page through a table's change log after a known seq.
pub async fn handle_changes(
    state: &AppState,
    table: &str,
    query: ChangesQuery,
) -> Result<ChangesResponse> {
    state.schema.table(table)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_CHANGES_LIMIT)
        .clamp(1, MAX_CHANGES_LIMIT);

    // Fetch one extra to check if there are more
    let stored = db::changes_since(&state.pool, table, query.since, limit + 1).await?;
    let has_more = stored.len() as i64 > limit;

    let changes = stored
        .iter()
        .take(limit as usize)
        .map(|entry| entry.to_change())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| AppError::Engine(Error::InvalidPayload(e)))?;

    Ok(ChangesResponse { changes, has_more })
}

/// Turn the fields of an insert request into the row to store.
///
/// The id comes from the request when it carries one, otherwise a fresh
/// UUID. `created_at` is stamped when the table has the column and the
/// request left it out.
pub fn prepare_insert(schema: &TableSchema, mut fields: Fields) -> Result<Row> {
    let id = match fields.remove("id") {
        None | Some(serde_json::Value::Null) => uuid::Uuid::new_v4().to_string(),
        Some(serde_json::Value::String(id)) if !id.trim().is_empty() => id,
        Some(_) => {
            return Err(Error::InvalidPayload("id must be a non-empty string".into()).into())
        }
    };

    if schema.field("created_at").is_some() && !fields.contains_key("created_at") {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        fields.insert("created_at".into(), serde_json::Value::String(now));
    }

    Ok(Row::new(id, fields))
}
