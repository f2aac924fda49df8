//! # courrier-server
//!
//! Real-time coordination server for the portal's embedded chat.
//!
//! This binary provides:
//! - **WebSocket endpoint** carrying the bincode wire protocol: presence,
//!   channel subscriptions, message delivery with ack/nack reconciliation,
//!   typing indicators, read receipts
//! - **REST surface** (axum) for health checks and instance info
//! - **Per-IP rate limiting** guarding the handshake path
//! - **Background sweeps** expiring stale typing indicators and idle
//!   rate-limit buckets

mod config;
mod rate_limit;
mod ws;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use courrier_hub::{Hub, InMemoryStore, StaticMembership};

use crate::config::ServerConfig;
use crate::rate_limit::RateLimiter;
use crate::ws::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courrier_server=debug")),
        )
        .init();

    info!("Starting Courrier server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // Collaborators: the portal mirrors its channel rosters into the
    // membership table and swaps the in-memory log for its message store.
    let membership = Arc::new(StaticMembership::new());
    let store = Arc::new(InMemoryStore::new());

    let hub = Arc::new(Hub::with_config(membership, store, config.hub_config()));

    let rate_limiter = RateLimiter::from_config(&config);

    let app_state = AppState {
        hub: hub.clone(),
        rate_limiter: rate_limiter.clone(),
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Implicit typing stops for clients that crashed mid-typing.
    let _typing_sweep = hub.clone().spawn_typing_sweep();

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let rl = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.evict_idle(600.0).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP/WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    // tokio::select! ensures that if either the server or a shutdown signal
    // arrives, we exit cleanly.
    let http_addr = config.http_addr;
    tokio::select! {
        result = ws::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
