//! Connection registry
//!
//! Cache mapping each remote endpoint to a single shared authenticated
//! [`Connection`]: the first caller dials, all later callers reuse. The
//! registry is an explicit object so callers (and tests) can instantiate
//! isolated registries instead of sharing a process-wide singleton.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, RemoteEndpoint};
use crate::connection::Connection;
use crate::error::Result;

/// Registry of shared connections, one per remote endpoint.
///
/// Lookup and creation happen under one lock, so no two concurrent callers
/// can dial the same endpoint twice. Entries live until explicitly closed;
/// nothing is evicted automatically.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<RemoteEndpoint, Arc<Connection>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the connection for the config's endpoint, dialing it first if
    /// this is the first caller.
    ///
    /// A failed dial or authentication caches nothing, so a later call may
    /// retry.
    pub async fn get_or_create(&self, config: &ClientConfig) -> Result<Arc<Connection>> {
        let endpoint = config.endpoint()?;
        let mut connections = self.connections.lock().await;

        if let Some(connection) = connections.get(&endpoint) {
            debug!(endpoint = %endpoint, "reusing cached connection");
            return Ok(Arc::clone(connection));
        }

        let connection = Arc::new(Connection::dial(endpoint.clone(), config).await?);
        connections.insert(endpoint, Arc::clone(&connection));
        Ok(connection)
    }

    /// Whether a connection for `endpoint` is currently cached
    pub async fn contains(&self, endpoint: &RemoteEndpoint) -> bool {
        self.connections.lock().await.contains_key(endpoint)
    }

    /// Close and remove the entry for `endpoint`, if present
    pub async fn close(&self, endpoint: &RemoteEndpoint) -> Result<()> {
        let connection = self.connections.lock().await.remove(endpoint);
        if let Some(connection) = connection {
            info!(endpoint = %endpoint, "closing connection");
            connection.close().await?;
        }
        Ok(())
    }

    /// Tear down every cached connection
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.connections.lock().await.drain().collect();
        for (endpoint, connection) in drained {
            if let Err(e) = connection.close().await {
                warn!(endpoint = %endpoint, error = %e, "failed to close connection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn refused_endpoint_config() -> (ClientConfig, RemoteEndpoint) {
        // Bind a listener to grab a free port, then drop it so the dial is
        // refused deterministically.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config =
            ClientConfig::new(format!("127.0.0.1:{port}"), "tester").with_password("secret");
        let endpoint = config.endpoint().unwrap();
        (config, endpoint)
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_before_dial() {
        let registry = ConnectionRegistry::new();
        // Unroutable host: if credentials were checked after dialing, this
        // would hang or fail with a connect error instead.
        let config = ClientConfig::new("198.51.100.1", "tester");

        let err = registry.get_or_create(&config).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!registry.contains(&config.endpoint().unwrap()).await);
    }

    #[tokio::test]
    async fn test_failed_dial_not_cached() {
        let registry = ConnectionRegistry::new();
        let (config, endpoint) = refused_endpoint_config();

        let err = registry.get_or_create(&config).await.unwrap_err();
        assert!(matches!(err, Error::Connect(_)), "got: {err}");
        assert!(!registry.contains(&endpoint).await);

        // The entry was not poisoned; a retry runs the dial again.
        assert!(registry.get_or_create(&config).await.is_err());
        assert!(!registry.contains(&endpoint).await);
    }

    #[tokio::test]
    async fn test_concurrent_failures_leave_registry_empty() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (config, endpoint) = refused_endpoint_config();

        let a = tokio::spawn({
            let registry = Arc::clone(&registry);
            let config = config.clone();
            async move { registry.get_or_create(&config).await.is_err() }
        });
        let b = tokio::spawn({
            let registry = Arc::clone(&registry);
            let config = config.clone();
            async move { registry.get_or_create(&config).await.is_err() }
        });

        assert!(a.await.unwrap());
        assert!(b.await.unwrap());
        assert!(!registry.contains(&endpoint).await);
    }

    #[tokio::test]
    async fn test_close_unknown_endpoint_is_noop() {
        let registry = ConnectionRegistry::new();
        let endpoint = RemoteEndpoint::new("nowhere.invalid", 22);
        assert!(registry.close(&endpoint).await.is_ok());
    }
}
