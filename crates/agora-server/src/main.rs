//! # agora-server
//!
//! Real-time group chat and forum backend.
//!
//! This binary provides:
//! - **WebSocket broker** fanning chat events out to room subscribers
//! - **Permission resolution** per room and forum section
//! - **Send gate** enforcing a minimum interval between sends with an
//!   arithmetic challenge
//! - **Presence and unread tracking**
//! - **REST API** (axum) for history, forum threads, views and counts

mod api;
mod auth;
mod broker;
mod config;
mod error;
mod forum;
mod hub;
mod presence;
mod rate_limit;
mod ws;

use std::sync::{Arc, Mutex};

use agora_store::Database;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::broker::Broker;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,agora_server=debug")),
        )
        .init();

    info!("Starting Agora server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open storage
    // -----------------------------------------------------------------------
    let db = Database::open_at(&config.database_path)?;
    if config.seed_defaults {
        db.seed_defaults()?;
        info!("Default admin, room and section ensured");
    }
    info!(path = %config.database_path.display(), "Database ready");

    // -----------------------------------------------------------------------
    // 4. Initialize the broker
    // -----------------------------------------------------------------------
    let broker = Broker::new(Arc::new(Mutex::new(db)), &config);
    let app_state = AppState {
        broker: broker.clone(),
    };

    // -----------------------------------------------------------------------
    // 5. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic send-gate cleanup (every minute): expired challenges and
    // send times older than the challenge TTL.
    let gate = broker.gate().clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            let (challenges, send_times) = gate.purge_expired().await;
            if challenges + send_times > 0 {
                let pending = gate.pending_challenges().await;
                tracing::debug!(challenges, send_times, pending, "Purged send gate state");
            }
        }
    });

    // -----------------------------------------------------------------------
    // 6. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let connections = broker.hub().connection_count().await;
            info!(connections, "Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
