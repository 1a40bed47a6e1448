//! Quarry Server - table backend for the back-office live tables.
//!
//! Serves table queries and point writes over HTTP and pushes every committed
//! change to WebSocket subscribers, persisting rows and the change log in
//! PostgreSQL.

mod auth;
mod config;
mod db;
mod error;
mod handlers;
mod routes;
mod websocket;

use crate::config::Config;
use crate::db::Pool;
use crate::websocket::ConnectionManager;
use axum::Router;
use quarry_engine::Schema;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub config: Arc<Config>,
    pub schema: Arc<Schema>,
    pub conn_manager: Arc<ConnectionManager>,
    /// Held from commit to broadcast so changes go out in seq order
    pub writes: Arc<Mutex<()>>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quarry_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Quarry Server on {}:{}", config.host, config.port);

    let pool = db::create_pool(&config.database_url, config.database_max_connections).await?;

    tracing::info!("Running database migrations...");
    db::run_migrations(&pool).await?;

    let schema = Schema::back_office();
    tracing::info!(
        version = schema.version,
        tables = schema.tables.len(),
        "Loaded table schema"
    );

    let state = AppState {
        pool,
        config: Arc::new(config.clone()),
        schema: Arc::new(schema),
        conn_manager: ConnectionManager::new_shared(),
        writes: Arc::new(Mutex::new(())),
    };

    let app = Router::new()
        .merge(routes::create_routes())
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        )
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
