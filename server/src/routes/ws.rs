//! Change-stream route.

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
    routing::get,
    Router,
};

use crate::auth::AuthUser;
use crate::handlers::handle_websocket_connection;
use crate::AppState;

/// Create the WebSocket route.
pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

/// GET /ws - Upgrade to a change-stream connection.
async fn ws_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| {
        handle_websocket_connection(socket, state.schema, state.conn_manager, auth.token)
    })
}
