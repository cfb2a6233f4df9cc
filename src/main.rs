//! Access Gate Server - Main Application Entry Point
//!
//! REST API server that gates a consumer game behind redeemable membership
//! keys, meters AI usage under rolling daily and cycle windows, and keeps
//! each account on a single active device.
//!
//! # Architecture
//!
//! - **Web Framework**: Axum (async HTTP server)
//! - **Database**: PostgreSQL with sqlx (async queries), or an in-memory store
//! - **Authentication**: external identity provider for users, SHA-256
//!   hashed API keys for admins
//! - **Format**: JSON requests/responses
//!
//! # Startup Flow
//!
//! 1. Load and validate configuration from environment variables
//! 2. Create the store (connection pool and migrations for PostgreSQL)
//! 3. Build HTTP router with routes and middleware
//! 4. Start server on configured port

use std::sync::Arc;

use access_gate_server::{
    app::{AppState, build_router},
    clock::{Clock, SystemClock},
    config::{Config, StoreBackend},
    db,
    store::{Store, memory::MemoryStore, postgres::PgStore},
};
use anyhow::Context;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging with tracing subscriber. Reads RUST_LOG environment variable (defaults to "info" level)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Invalid configuration is fatal
    let config = Config::from_env().context("loading configuration")?;
    tracing::info!(backend = ?config.store_backend, "Configuration loaded");

    let store: Arc<dyn Store> = match config.store_backend {
        StoreBackend::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres backend")?;
            let pool = db::create_pool(
                database_url,
                config.db_max_connections,
                config.store_timeout(),
            )
            .await
            .context("connecting to PostgreSQL")?;
            tracing::info!("Database pool created");

            db::run_migrations(&pool)
                .await
                .context("running migrations")?;
            tracing::info!("Database migrations complete");

            if config.admin_api_key.is_some() {
                tracing::warn!("ADMIN_API_KEY is ignored by the postgres backend");
            }
            Arc::new(PgStore::new(pool, config.store_timeout()))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; nothing will be persisted");
            let store = MemoryStore::new();
            match config.admin_api_key.as_deref() {
                Some(raw_key) => {
                    let key = store.seed_admin_key(raw_key, "bootstrap", SystemClock.now_utc());
                    tracing::info!(api_key_id = %key.id, "Admin API key registered");
                }
                None => tracing::warn!("No ADMIN_API_KEY set; admin routes will reject every request"),
            }
            Arc::new(store)
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let app = build_router(AppState::build(&config, store, clock));

    // Bind to network address and start server
    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
