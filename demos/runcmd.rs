//! Run a remote command, optionally uploading a small file first.
//!
//! ```bash
//! SSHTOOL_HOST=203.0.113.10 SSHTOOL_USER=deploy SSHTOOL_PASSWORD=secret \
//! SSHTOOL_CMD="uname -a" cargo run --example runcmd
//! ```

use std::env;
use std::sync::Arc;

use anyhow::Context;
use sshtool::{ClientConfig, ConnectionRegistry, SshClient};
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
    let command = env::var("SSHTOOL_CMD").unwrap_or_else(|_| "uname -a".to_string());

    let registry = Arc::new(ConnectionRegistry::new());
    let client = SshClient::new(
        ClientConfig::new(host, user)
            .with_password(password)
            .with_dial_timeout(15)
            .with_idle_timeout(60),
        registry,
    );

    if let Ok(upload_path) = env::var("SSHTOOL_UPLOAD_PATH") {
        let payload = b"hello from sshtool\n";
        let result = client.transfer_data(&upload_path, payload).await?;
        info!(
            path = %upload_path,
            exit_code = ?result.exit_code,
            "upload finished"
        );
    }

    let output = client.cmd(&command, None, None).await?;
    if !output.stdout.is_empty() {
        print!("{}", output.stdout);
    }
    if !output.stderr.is_empty() {
        eprint!("{}", output.stderr);
    }
    if !output.success() {
        anyhow::bail!("remote command exited with {:?}", output.exit_code);
    }

    client.disconnect().await?;
    Ok(())
}
