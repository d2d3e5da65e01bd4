//! Error types for the SSH toolkit

use thiserror::Error;

/// Main error type for the toolkit.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or incomplete configuration; fatal, never retried
    #[error("configuration error: {0}")]
    Config(String),

    /// Dialing the remote endpoint failed; the caller may retry
    #[error("connect error: {0}")]
    Connect(String),

    /// Authentication rejected or no usable method
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Per-session failure (pty request rejected, shell already started, ...)
    #[error("session error: {0}")]
    Session(String),

    /// A write sink accepted fewer bytes than were read
    #[error("short write: wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    /// Read/write failure on a copy direction
    #[error("stream error: {0}")]
    Stream(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH protocol error
    #[error("SSH protocol error: {0}")]
    Ssh(#[from] russh::Error),

    /// SSH key parsing error
    #[error("SSH key error: {0}")]
    Key(#[from] russh::keys::Error),
}

/// Result type alias using [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a connect error from a string
    pub fn connect(msg: impl Into<String>) -> Self {
        Error::Connect(msg.into())
    }

    /// Create an authentication error from a string
    pub fn auth(msg: impl Into<String>) -> Self {
        Error::Auth(msg.into())
    }

    /// Create a session error from a string
    pub fn session(msg: impl Into<String>) -> Self {
        Error::Session(msg.into())
    }

    /// Create a stream error from a string
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::connect("connection refused");
        assert_eq!(err.to_string(), "connect error: connection refused");

        let err = Error::ShortWrite {
            written: 10,
            expected: 32,
        };
        assert_eq!(err.to_string(), "short write: wrote 10 of 32 bytes");
    }
}
