//! Forward a local TCP port through an SSH endpoint.
//!
//! ```bash
//! SSHTOOL_HOST=203.0.113.10:22 SSHTOOL_USER=deploy SSHTOOL_PASSWORD=secret \
//! SSHTOOL_LOCAL=127.0.0.1:8000 SSHTOOL_REMOTE=localhost:80 \
//! cargo run --example localforward
//! ```

use std::env;
use std::sync::Arc;

use anyhow::Context;
use sshtool::{ClientConfig, ConnectionRegistry, RemoteEndpoint, SshClient};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let host = env::var("SSHTOOL_HOST").context("SSHTOOL_HOST not set")?;
    let user = env::var("SSHTOOL_USER").context("SSHTOOL_USER not set")?;
    let password = env::var("SSHTOOL_PASSWORD").unwrap_or_default();
    let local = env::var("SSHTOOL_LOCAL").unwrap_or_else(|_| "127.0.0.1:8000".to_string());
    let remote = env::var("SSHTOOL_REMOTE").unwrap_or_else(|_| "localhost:80".to_string());

    let registry = Arc::new(ConnectionRegistry::new());
    let client = SshClient::new(
        ClientConfig::new(host, user).with_password(password),
        registry,
    );

    let mut tunnel = client
        .local_forward(local, RemoteEndpoint::parse(&remote)?)
        .await?;
    tunnel
        .start(Some(Box::new(|| info!("tunnel ready"))))
        .await?;

    if let Some(addr) = tunnel.local_addr() {
        info!("forwarding {addr} -> {remote}; press Ctrl+C to stop");
    }
    tokio::signal::ctrl_c().await?;

    tunnel.stop().await?;
    Ok(())
}
