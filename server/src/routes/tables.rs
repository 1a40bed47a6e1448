//! Table endpoint routes.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    routing::{get, patch},
    Json, Router,
};
use quarry_engine::{Committed, Fields, Row, RowId, Snapshot};

use crate::auth::AuthUser;
use crate::error::{AppError, Result};
use crate::handlers::{
    handle_changes, handle_delete, handle_insert, handle_query, handle_update, ChangesQuery,
    ChangesResponse,
};
use crate::AppState;

/// Create table routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/tables/{table}/rows", get(query_handler).post(insert_handler))
        .route(
            "/tables/{table}/rows/{id}",
            patch(update_handler).delete(delete_handler),
        )
        .route("/tables/{table}/changes", get(changes_handler))
}

/// Unwrap a JSON body, reporting malformed bodies in the common error shape.
fn body(payload: std::result::Result<Json<Fields>, JsonRejection>) -> Result<Fields> {
    payload
        .map(|Json(fields)| fields)
        .map_err(|rejection| AppError::BadRequest(rejection.body_text()))
}

/// GET /tables/{table}/rows - Read a filtered, ordered slice.
async fn query_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(table): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<Snapshot>> {
    let snapshot = handle_query(&state, &table, &params).await?;
    Ok(Json(snapshot))
}

/// POST /tables/{table}/rows - Create a row.
async fn insert_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(table): Path<String>,
    payload: std::result::Result<Json<Fields>, JsonRejection>,
) -> Result<(StatusCode, Json<Committed<Row>>)> {
    let committed = handle_insert(&state, &table, body(payload)?).await?;
    Ok((StatusCode::CREATED, Json(committed)))
}

/// PATCH /tables/{table}/rows/{id} - Overwrite fields of a row.
async fn update_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((table, id)): Path<(String, String)>,
    payload: std::result::Result<Json<Fields>, JsonRejection>,
) -> Result<Json<Committed<Row>>> {
    let committed = handle_update(&state, &table, &id, body(payload)?).await?;
    Ok(Json(committed))
}

/// DELETE /tables/{table}/rows/{id} - Delete a row.
async fn delete_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((table, id)): Path<(String, String)>,
) -> Result<Json<Committed<RowId>>> {
    let committed = handle_delete(&state, &table, &id).await?;
    Ok(Json(committed))
}

/// GET /tables/{table}/changes - Page through the change log.
async fn changes_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(table): Path<String>,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<ChangesResponse>> {
    let response = handle_changes(&state, &table, query).await?;
    Ok(Json(response))
}
