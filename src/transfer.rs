//! Throughput-limited data transfer
//!
//! Writes a payload to a remote path through a `cat` sink, pacing the
//! outbound chunks with a [`ThroughputLimiter`]. The target path is
//! embedded in a single-quoted shell word with embedded quotes rewritten,
//! so hostile path names cannot break out of the invocation.

use russh::ChannelMsg;
use tracing::debug;

use crate::client::SshClient;
use crate::error::{Error, Result};
use crate::limiter::{ThroughputLimiter, CHUNK_SIZE};
use crate::session::CommandOutput;

/// Escape `path` for embedding inside a single-quoted shell word by
/// replacing each `'` with `'\''`.
fn quote_single_quoted(path: &str) -> String {
    path.replace('\'', "'\\''")
}

impl SshClient {
    /// Write `payload` to `target_path` on the remote host.
    ///
    /// Acquires one throughput token per 64 KiB chunk before sending it,
    /// closes the remote sink's input when every chunk is out, then waits
    /// for remote completion and returns the captured output. A nonzero
    /// throughput budget below the enforceable minimum fails here before
    /// any data is sent.
    pub async fn transfer_data(&self, target_path: &str, payload: &[u8]) -> Result<CommandOutput> {
        let limiter = ThroughputLimiter::start(self.budget())?;

        let connection = self.connect().await?;
        let mut channel = connection.open_session_channel().await?;

        let command = format!("cat > '{}'", quote_single_quoted(target_path));
        debug!(target = %target_path, bytes = payload.len(), "starting transfer");
        channel
            .exec(true, command.as_str())
            .await
            .map_err(|e| Error::session(format!("failed to exec remote sink: {e}")))?;

        for chunk in payload.chunks(CHUNK_SIZE) {
            limiter.acquire().await?;
            channel
                .data(chunk)
                .await
                .map_err(|e| Error::stream(format!("write failed: {e}")))?;
        }
        channel
            .eof()
            .await
            .map_err(|e| Error::stream(format!("failed to close remote sink: {e}")))?;

        // Wait for the remote side to finish and report.
        let mut output = CommandOutput::default();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => {
                    output.stdout.push_str(&String::from_utf8_lossy(data));
                }
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    output.stderr.push_str(&String::from_utf8_lossy(data));
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    output.exit_code = Some(exit_status);
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        debug!(
            target = %target_path,
            exit_code = ?output.exit_code,
            "transfer finished"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_plain_path_unchanged() {
        assert_eq!(quote_single_quoted("/tmp/plain.txt"), "/tmp/plain.txt");
    }

    #[test]
    fn test_quote_embedded_single_quote() {
        assert_eq!(quote_single_quoted("/tmp/a'b.txt"), "/tmp/a'\\''b.txt");
    }

    #[test]
    fn test_quote_multiple_quotes() {
        assert_eq!(quote_single_quoted("it's a'b"), "it'\\''s a'\\''b");
    }

    #[test]
    fn test_quoted_invocation_is_balanced() {
        // Every quote in the produced command line must pair up, or the
        // remote shell would report a syntax error (or worse, execute part
        // of the path).
        let command = format!("cat > '{}'", quote_single_quoted("/tmp/a'b; rm -rf /'c"));
        assert_eq!(command.matches('\'').count() % 2, 0);
        assert!(command.starts_with("cat > '"));
    }
}
