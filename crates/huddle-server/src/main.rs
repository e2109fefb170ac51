//! # Huddle Server
//!
//! Main binary for the Huddle signaling relay. Serves, on one port:
//! - the signaling WebSocket (`/?meetingId=...`)
//! - `/health` and `/stats` for load balancers and monitoring
//!
//! Meetings are read from the web app's PostgreSQL database; session cookies
//! are decrypted with the web app's NextAuth.js secret.

use clap::Parser;
use huddle_db::Database;
use huddle_signaling::{SignalingState, build_router};
use std::net::SocketAddr;

/// Huddle signaling relay
#[derive(Parser, Debug)]
#[clap(name = "huddle", version)]
struct Cli {
    /// Address to bind, overriding `server.host`.
    #[clap(long)]
    host: Option<String>,

    /// Port to listen on, overriding `server.port`.
    #[clap(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = huddle_common::config::load()?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    // Initialize tracing (structured logging)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "huddle=debug,tower_http=debug".into());
    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    }

    tracing::info!("Starting Huddle v{}", env!("CARGO_PKG_VERSION"));

    let db = Database::connect(&config).await?;

    let session_secret = config.auth.secret().map(str::to_owned);
    if session_secret.is_none() {
        tracing::warn!("No session secret configured; every participant connects unauthenticated");
    }

    let state = SignalingState::new(db, session_secret, &config.signaling);
    let app = build_router(state);

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Signaling listening on ws://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Huddle stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
