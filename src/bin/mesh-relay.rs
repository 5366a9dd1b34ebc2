//! `mesh-relay`: WebSocket rendezvous relay for `mesh-room` clients.
//!
//! Listens on `relay_bind` from the configuration (`MESH_RELAY_BIND` overrides it)
//! until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mesh_room::relay::{serve, Relay};
use mesh_room::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mesh=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("loading configuration")?;
    let listener = TcpListener::bind(&config.relay_bind)
        .await
        .with_context(|| format!("binding {}", config.relay_bind))?;

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(serve(Arc::new(Relay::new()), listener, shutdown.clone()));

    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutting down");
    shutdown.cancel();

    match server.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = %e, "Relay failed");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}
