//! SSH client handler implementation
//!
//! Implements the `russh::client::Handler` trait to handle SSH connection
//! events.

/// SSH client handler for russh
///
/// # Security Note
/// Accepts all server keys, which suits automated connections where host
/// key verification is handled separately. Production deployments may want
/// to check keys against a known_hosts file or a fingerprint whitelist.
#[derive(Debug, Clone)]
pub struct ClientHandler;

impl ClientHandler {
    /// Create a new SSH handler
    pub fn new() -> Self {
        Self
    }
}

impl Default for ClientHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_creation() {
        let handler = ClientHandler::new();
        assert!(format!("{:?}", handler).contains("ClientHandler"));
    }
}
