//! Local TCP forwarding
//!
//! A [`Tunnel`] binds a local TCP listener and forwards every accepted
//! connection through a shared SSH connection to a fixed remote address:
//! per connection, one logical stream is opened remote-side and two
//! concurrent copier relays move bytes in both directions. Connections are
//! independent: one failing is logged and never disturbs the listener or
//! its peers. Stopping closes the shared transport (terminating every
//! stream derived from it) and waits for all relays to wind down.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::RemoteEndpoint;
use crate::connection::Connection;
use crate::copier;
use crate::error::{Error, Result};

/// One-shot readiness callback invoked after the listener is up
pub type ReadyCallback = Box<dyn FnOnce() + Send>;

/// Transport a tunnel forwards through.
///
/// Implemented by [`Arc<Connection>`] for real forwarding; tests drive the
/// tunnel over plain TCP with a loopback implementation.
#[async_trait]
pub trait TunnelTransport: Send + Sync + 'static {
    /// Duplex stream carrying one forwarded connection
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a logical stream to `remote` on behalf of `originator`
    async fn open_stream(
        &self,
        remote: &RemoteEndpoint,
        originator: SocketAddr,
    ) -> Result<Self::Stream>;

    /// Close the transport, terminating every stream derived from it
    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl TunnelTransport for Arc<Connection> {
    type Stream = russh::ChannelStream<russh::client::Msg>;

    async fn open_stream(
        &self,
        remote: &RemoteEndpoint,
        originator: SocketAddr,
    ) -> Result<Self::Stream> {
        let channel = self
            .open_direct_tcpip(remote, &originator.ip().to_string(), originator.port())
            .await?;
        Ok(channel.into_stream())
    }

    async fn close(&self) -> Result<()> {
        self.as_ref().close().await
    }
}

/// Lifecycle of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Built, not yet listening
    Created,

    /// Listener bound and accepting
    Listening,

    /// Stopped; the listener and all forwarded connections are gone
    Stopped,
}

/// Local TCP listener forwarding accepted connections to a fixed remote
/// address through a shared transport
pub struct Tunnel<T: TunnelTransport = Arc<Connection>> {
    local_bind_address: String,
    remote_address: RemoteEndpoint,
    transport: Arc<T>,
    state: TunnelState,
    local_addr: Option<SocketAddr>,
    shutdown: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl<T: TunnelTransport> Tunnel<T> {
    /// Create a tunnel forwarding `local_bind_address` to `remote_address`
    /// over `transport`.
    ///
    /// The shared connection behind `transport` must already be
    /// established; failing to obtain it is fatal for the tunnel, with no
    /// retry (see [`SshClient::local_forward`]).
    ///
    /// [`SshClient::local_forward`]: crate::client::SshClient::local_forward
    pub fn new(
        local_bind_address: impl Into<String>,
        remote_address: RemoteEndpoint,
        transport: T,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            local_bind_address: local_bind_address.into(),
            remote_address,
            transport: Arc::new(transport),
            state: TunnelState::Created,
            local_addr: None,
            shutdown,
            accept_task: None,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Address the listener actually bound (useful when binding port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Remote address forwarded to
    pub fn remote_address(&self) -> &RemoteEndpoint {
        &self.remote_address
    }

    /// Bind the local listener and start accepting connections.
    ///
    /// `on_ready` is invoked exactly once, asynchronously, after the
    /// listener is up; `start` itself also returns only once the listener
    /// is bound. Binding failure is fatal.
    pub async fn start(&mut self, on_ready: Option<ReadyCallback>) -> Result<()> {
        if self.state != TunnelState::Created {
            return Err(Error::config("tunnel already started"));
        }

        let listener = TcpListener::bind(&self.local_bind_address)
            .await
            .map_err(|e| {
                Error::connect(format!(
                    "failed to bind {}: {e}",
                    self.local_bind_address
                ))
            })?;
        let local_addr = listener.local_addr()?;
        info!(local = %local_addr, remote = %self.remote_address, "tunnel listening");
        self.local_addr = Some(local_addr);

        if let Some(ready) = on_ready {
            tokio::spawn(async move { ready() });
        }

        let transport = Arc::clone(&self.transport);
        let remote = self.remote_address.clone();
        let mut shutdown = self.shutdown.subscribe();
        self.accept_task = Some(tokio::spawn(async move {
            let mut relays = JoinSet::new();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "accepted tunnel connection");
                            let transport = Arc::clone(&transport);
                            let remote = remote.clone();
                            relays.spawn(async move {
                                if let Err(e) =
                                    forward_connection(stream, peer, transport, remote).await
                                {
                                    // Isolated: one bad connection never
                                    // takes down the listener or its peers.
                                    warn!(peer = %peer, error = %e, "tunnel connection failed");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "tunnel accept failed");
                            break;
                        }
                    }
                }
            }

            drop(listener);
            if *shutdown.borrow() {
                // Stop terminates in-flight forwards.
                relays.shutdown().await;
            } else {
                while relays.join_next().await.is_some() {}
            }
        }));

        self.state = TunnelState::Listening;
        Ok(())
    }

    /// Stop the tunnel: close the shared transport (terminating every
    /// derived stream), shut the listener down, and wait until the accept
    /// task and all forwarded connections have finished.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state != TunnelState::Listening {
            return Ok(());
        }
        self.state = TunnelState::Stopped;

        self.shutdown.send_replace(true);
        let close_result = self.transport.close().await;
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }

        info!(remote = %self.remote_address, "tunnel stopped");
        close_result
    }
}

/// Forward one accepted connection: open the remote-side stream, then run
/// both copy directions to completion.
async fn forward_connection<T: TunnelTransport>(
    mut local: TcpStream,
    peer: SocketAddr,
    transport: Arc<T>,
    remote: RemoteEndpoint,
) -> Result<()> {
    let stream = transport.open_stream(&remote, peer).await?;
    let (mut remote_read, mut remote_write) = tokio::io::split(stream);
    let (mut local_read, mut local_write) = local.split();

    let outbound = async {
        let sent = copier::copy(&mut remote_write, &mut local_read, None).await?;
        let _ = remote_write.shutdown().await;
        Ok::<u64, Error>(sent)
    };
    let inbound = async {
        let received = copier::copy(&mut local_write, &mut remote_read, None).await?;
        let _ = local_write.shutdown().await;
        Ok::<u64, Error>(received)
    };

    let (sent, received) = tokio::try_join!(outbound, inbound)?;
    debug!(peer = %peer, sent, received, "tunnel connection finished");
    Ok(())
}
