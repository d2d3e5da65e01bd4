//! High-level SSH client facade
//!
//! [`SshClient`] ties the pieces together: it resolves its endpoint
//! through a shared [`ConnectionRegistry`], opens sessions with the
//! configured deadline and idle timeout, and offers the common flows:
//! run a command, attach an interactive shell, transfer data, forward a
//! local port. The registry is injected so independent clients (and
//! tests) can pool connections without process-wide state.

use std::sync::Arc;
use std::time::SystemTime;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::config::{ClientConfig, RemoteEndpoint};
use crate::connection::Connection;
use crate::error::Result;
use crate::limiter::ThroughputBudget;
use crate::pty::PtyRequest;
use crate::registry::ConnectionRegistry;
use crate::session::{CommandOutput, Session};
use crate::tunnel::Tunnel;

/// Client for one remote endpoint, sharing pooled connections through a
/// [`ConnectionRegistry`]
pub struct SshClient {
    config: ClientConfig,
    registry: Arc<ConnectionRegistry>,
    budget: ThroughputBudget,
}

impl SshClient {
    /// Create a client resolving connections through `registry`
    pub fn new(config: ClientConfig, registry: Arc<ConnectionRegistry>) -> Self {
        let budget = ThroughputBudget::new(config.max_throughput);
        Self {
            config,
            registry,
            budget,
        }
    }

    /// The client's configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Shared throughput budget gating this client's transfers
    pub(crate) fn budget(&self) -> &ThroughputBudget {
        &self.budget
    }

    /// Change the transfer budget in bytes/second (0 = unlimited).
    ///
    /// Applies to running transfers from their next refill cycle on; a
    /// new nonzero value below the enforceable minimum only rejects
    /// transfers started afterwards.
    pub fn set_max_throughput(&self, bytes_per_sec: u64) {
        self.budget.set(bytes_per_sec);
    }

    /// Get or establish the pooled connection for this client's endpoint
    pub async fn connect(&self) -> Result<Arc<Connection>> {
        self.registry.get_or_create(&self.config).await
    }

    /// Open a fresh full session.
    ///
    /// The deadline falls back to the configured one when `deadline` is
    /// `None`; the idle timeout always comes from the configuration.
    pub async fn open_session(&self, deadline: Option<SystemTime>) -> Result<Session> {
        let connection = self.connect().await?;
        Session::open(
            connection,
            deadline.or(self.config.deadline),
            self.config.idle_timeout(),
        )
        .await
    }

    /// Run `command` remotely and return its captured output.
    ///
    /// Uses `session` when given (applying `deadline` to it), a fresh one
    /// otherwise; either way the session is closed before returning, its
    /// watchdog along with it.
    pub async fn cmd(
        &self,
        command: &str,
        session: Option<Session>,
        deadline: Option<SystemTime>,
    ) -> Result<CommandOutput> {
        let mut session = match session {
            Some(session) => {
                session.set_deadline(deadline.or(self.config.deadline));
                session
            }
            None => self.open_session(deadline).await?,
        };

        debug!(session = %session.id(), command, "running remote command");
        let result = session.run(command).await;
        session.close().await?;
        result
    }

    /// Attach `stream` to an interactive remote shell: open a session,
    /// request the pty, start the shell and relay both directions until
    /// the shell exits or the session is closed. The first failure from
    /// any direction wins; the session is closed before returning.
    pub async fn pipe<S>(
        &self,
        stream: &mut S,
        pty: &PtyRequest,
        deadline: Option<SystemTime>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut session = self.open_session(deadline).await?;

        let result = async {
            session.request_pty(pty).await?;
            session.start_shell().await?;
            session.pipe(stream).await?;
            Ok(())
        }
        .await;

        session.close().await?;
        result
    }

    /// Build a tunnel forwarding `local_bind_address` to `remote` through
    /// this client's shared connection.
    ///
    /// Establishing the connection happens here and is fatal on failure,
    /// no retry. The returned tunnel still needs
    /// [`start`](Tunnel::start)ing.
    pub async fn local_forward(
        &self,
        local_bind_address: impl Into<String>,
        remote: RemoteEndpoint,
    ) -> Result<Tunnel> {
        let connection = self.connect().await?;
        Ok(Tunnel::new(local_bind_address, remote, connection))
    }

    /// Close this client's pooled connection, terminating every session
    /// and tunnel derived from it.
    pub async fn disconnect(&self) -> Result<()> {
        self.registry.close(&self.config.endpoint()?).await
    }
}

impl std::fmt::Debug for SshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClient")
            .field("host", &self.config.host)
            .field("user", &self.config.user)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn test_clients_share_a_registry() {
        let registry = Arc::new(ConnectionRegistry::new());
        let a = SshClient::new(
            ClientConfig::new("host-a", "user").with_password("pw"),
            Arc::clone(&registry),
        );
        let b = SshClient::new(
            ClientConfig::new("host-b", "user").with_password("pw"),
            Arc::clone(&registry),
        );
        assert_eq!(a.config().host, "host-a");
        assert_eq!(b.config().host, "host-b");
    }

    #[tokio::test]
    async fn test_cmd_without_credentials_is_config_error() {
        let client = SshClient::new(
            ClientConfig::new("198.51.100.7", "user"),
            Arc::new(ConnectionRegistry::new()),
        );
        let err = client.cmd("true", None, None).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_set_max_throughput_updates_budget() {
        let client = SshClient::new(
            ClientConfig::new("h", "u").with_password("pw"),
            Arc::new(ConnectionRegistry::new()),
        );
        assert_eq!(client.budget().get(), 0);
        client.set_max_throughput(8_000_000);
        assert_eq!(client.budget().get(), 8_000_000);
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_is_noop() {
        let client = SshClient::new(
            ClientConfig::new("h", "u").with_password("pw"),
            Arc::new(ConnectionRegistry::new()),
        );
        assert!(client.disconnect().await.is_ok());
    }
}
