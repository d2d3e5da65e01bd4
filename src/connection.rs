//! Authenticated connection to a remote endpoint
//!
//! A [`Connection`] wraps an authenticated russh client handle. It is
//! created by the [`ConnectionRegistry`](crate::registry::ConnectionRegistry),
//! never mutated afterwards, and shared read-only (behind an `Arc`) by every
//! session and tunnel built on it. Closing it terminates all channels
//! derived from it.

use std::sync::Arc;

use russh::client::{self, Handle, Msg};
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use russh::{Channel, Disconnect};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::{ClientConfig, Credentials, RemoteEndpoint};
use crate::error::{Error, Result};
use crate::handler::ClientHandler;

/// An established, authenticated connection to one remote endpoint
pub struct Connection {
    endpoint: RemoteEndpoint,
    handle: Handle<ClientHandler>,
}

impl Connection {
    /// Dial `endpoint` and authenticate with the config's credentials.
    ///
    /// Applies the configured dial timeout when nonzero. Exactly one
    /// authentication method is used: key material when present, the
    /// password otherwise; having neither fails before any network
    /// activity.
    pub async fn dial(endpoint: RemoteEndpoint, config: &ClientConfig) -> Result<Self> {
        let credentials = config.credentials()?;

        let ssh_config = Arc::new(client::Config::default());
        let addr = endpoint.to_string();

        debug!(endpoint = %endpoint, "dialing ssh endpoint");
        let mut handle = match config.dial_timeout() {
            Some(limit) => {
                match timeout(
                    limit,
                    client::connect(ssh_config, addr.as_str(), ClientHandler::new()),
                )
                .await
                {
                    Ok(Ok(handle)) => handle,
                    Ok(Err(e)) => return Err(Error::connect(e.to_string())),
                    Err(_) => {
                        return Err(Error::connect(format!(
                            "dial timeout after {}s connecting to {}",
                            config.dial_timeout_secs, endpoint
                        )))
                    }
                }
            }
            None => client::connect(ssh_config, addr.as_str(), ClientHandler::new())
                .await
                .map_err(|e| Error::connect(e.to_string()))?,
        };

        authenticate(&mut handle, &config.user, credentials).await?;

        info!(endpoint = %endpoint, user = %config.user, "dial ssh success");
        Ok(Self { endpoint, handle })
    }

    /// The endpoint this connection is bound to
    pub fn endpoint(&self) -> &RemoteEndpoint {
        &self.endpoint
    }

    /// Open a session channel for command or shell execution
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>> {
        self.handle
            .channel_open_session()
            .await
            .map_err(|e| Error::connect(format!("failed to open session channel: {e}")))
    }

    /// Open a logical connection to `remote` multiplexed over this
    /// connection (used for local forwarding).
    pub async fn open_direct_tcpip(
        &self,
        remote: &RemoteEndpoint,
        originator: &str,
        originator_port: u16,
    ) -> Result<Channel<Msg>> {
        self.handle
            .channel_open_direct_tcpip(
                remote.host.clone(),
                remote.port.into(),
                originator.to_string(),
                originator_port.into(),
            )
            .await
            .map_err(|e| {
                Error::connect(format!("failed to open channel to {remote}: {e}"))
            })
    }

    /// Disconnect, terminating every channel derived from this connection
    pub async fn close(&self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("handle", &"<russh::Handle>")
            .finish()
    }
}

/// Authenticate with the server using exactly one method
async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    credentials: Credentials,
) -> Result<()> {
    match credentials {
        Credentials::Password(password) => {
            debug!(user, "attempting password authentication");
            let outcome = handle
                .authenticate_password(user, &password)
                .await
                .map_err(|e| Error::auth(e.to_string()))?;
            if outcome.success() {
                Ok(())
            } else {
                Err(Error::auth("password authentication rejected"))
            }
        }
        Credentials::PrivateKey(material) => {
            debug!(user, "attempting key authentication");
            let key = decode_secret_key(&material, None)?;
            let outcome = handle
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), None))
                .await
                .map_err(|e| Error::auth(e.to_string()))?;
            if outcome.success() {
                Ok(())
            } else {
                Err(Error::auth("key authentication rejected"))
            }
        }
    }
}
