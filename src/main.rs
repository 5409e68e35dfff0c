#![forbid(unsafe_code)]

use anyhow::Result;
use roomfx::config::Config;
use roomfx::metrics::ServerMetrics;
use roomfx::sfu::room::RoomStore;
use roomfx::signaling::SignalingServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomfx=debug,webrtc=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("roomfx - starting server");

    let config = Arc::new(Config::from_env());
    let metrics = ServerMetrics::new();
    let store = RoomStore::new(metrics.clone());

    let port = config.port;
    let server = SignalingServer::new(store, config, metrics);

    // Run server with graceful shutdown
    tokio::select! {
        result = server.serve(port) => {
            if let Err(e) = result {
                tracing::error!("signaling server error: {}", e);
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }

    info!("server shutdown complete");
    Ok(())
}
