//! # nearhelp-server
//!
//! Help-request coordination server.
//!
//! This binary provides:
//! - **Request lifecycle engine**: open -> accepted -> completed/expired,
//!   with conflict-safe transitions under concurrent actors
//! - **Nearby matching** over an in-memory geo index (haversine radius)
//! - **Realtime channel** (WebSocket): presence, per-request rooms, chat,
//!   typing indicators and live-location relay
//! - **Notification fanout** of lifecycle events to eligible online users
//! - **Expiry sweeper** driving every time-based transition, plus a daily
//!   retention sweep
//! - **REST API** (axum) for the full request surface

mod api;
mod config;
mod coordinator;
mod error;
mod fanout;
mod presence;
mod rooms;
mod sweeper;
mod ws;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::coordinator::Coordinator;
use crate::presence::PresenceRegistry;
use crate::rooms::RoomRouter;
use nearhelp_store::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,nearhelp_server=debug")),
        )
        .init();

    info!("Starting nearhelp server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = Arc::new(ServerConfig::from_env());
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = match &config.database_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    if let Some(path) = db.path() {
        info!(path = %path.display(), "Database ready");
    }

    let coordinator = Coordinator::new(db, config.clone()).await?;
    let presence = PresenceRegistry::new();
    let rooms = RoomRouter::new(presence.clone());

    let app_state = AppState {
        coordinator: coordinator.clone(),
        presence: presence.clone(),
        rooms: rooms.clone(),
        config: config.clone(),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------
    fanout::spawn_fanout(coordinator.clone(), presence, rooms, config.clone());
    sweeper::spawn_expiry_sweeper(coordinator.clone(), config.clone());
    sweeper::spawn_retention_sweeper(coordinator);

    // -----------------------------------------------------------------------
    // 5. Run the HTTP server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
