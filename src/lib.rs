//! sshtool - a client-side SSH toolkit
//!
//! This crate manages secure remote-shell connections: it pools one
//! authenticated connection per remote host, runs commands and interactive
//! shells over those connections, transfers data with bandwidth control,
//! and forwards local TCP traffic through a remote endpoint.
//!
//! # Features
//!
//! - One shared connection per endpoint via [`ConnectionRegistry`]
//! - [`Session`]s (full or raw-channel) with absolute deadlines and
//!   sliding idle timeouts, enforced by a per-session watchdog
//! - Bidirectional stream relays with pooled buffers ([`copier`])
//! - Token-bucket throughput limiting for transfers ([`ThroughputLimiter`])
//! - Local port forwarding ([`Tunnel`])
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sshtool::{ClientConfig, ConnectionRegistry, SshClient};
//!
//! # async fn demo() -> sshtool::Result<()> {
//! let registry = Arc::new(ConnectionRegistry::new());
//! let config = ClientConfig::new("server.example.com:22", "deploy")
//!     .with_password("secret")
//!     .with_idle_timeout(60);
//! let client = SshClient::new(config, registry);
//!
//! let output = client.cmd("uname -a", None, None).await?;
//! println!("{}", output.stdout);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod copier;
pub mod error;
pub mod handler;
pub mod limiter;
pub mod pty;
pub mod registry;
pub mod session;
pub mod tunnel;

mod transfer;
mod watchdog;

// Re-exports for convenience
pub use client::SshClient;
pub use config::{ClientConfig, Credentials, RemoteEndpoint, DEFAULT_SSH_PORT};
pub use connection::Connection;
pub use error::{Error, Result};
pub use handler::ClientHandler;
pub use limiter::{ThroughputBudget, ThroughputLimiter, CHUNK_SIZE, MIN_ENFORCEABLE_RATE};
pub use pty::PtyRequest;
pub use registry::ConnectionRegistry;
pub use session::{CommandOutput, Session, SessionActivity, SessionVariant};
pub use tunnel::{Tunnel, TunnelState, TunnelTransport};
