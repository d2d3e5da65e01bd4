//! Remote execution sessions
//!
//! A [`Session`] is one logical unit of remote command or shell execution
//! bound to a shared [`Connection`]. Two variants exist, chosen explicitly
//! at construction: a *full* session whose channel was opened through the
//! connection's session-channel operation, and a *raw-channel* session
//! wrapping a logical channel the caller opened and whose lifetime it
//! controls. Both expose the same capability set; every session spawns
//! exactly one deadline watchdog at creation and must not be driven by two
//! callers concurrently.
//!
//! When no operation is in flight the transport channel is parked in a
//! mutex; an in-flight operation takes it out and watches the session's
//! closed signal, so a watchdog- or caller-driven close unblocks it. That
//! closed signal, together with the transport reporting the channel gone,
//! is the cancellation mechanism; there is no separate cooperative stop.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::Connection;
use crate::copier::lease_buffer;
use crate::error::{Error, Result};
use crate::pty::PtyRequest;
use crate::watchdog::DeadlineWatchdog;

/// Which construction path produced a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionVariant {
    /// Channel opened via the connection's session-channel operation
    Full,

    /// Caller-opened logical channel with externally controlled lifetime
    Raw,
}

/// Output captured from a non-interactive command run
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Standard output from the command
    pub stdout: String,

    /// Standard error from the command
    pub stderr: String,

    /// Exit code of the command (if the remote side reported one)
    pub exit_code: Option<u32>,
}

impl CommandOutput {
    /// Check if the command succeeded (exit code 0 or none reported)
    pub fn success(&self) -> bool {
        self.exit_code.is_none_or(|code| code == 0)
    }
}

/// State shared between a session, its watchdog and in-flight operations
pub(crate) struct SessionShared {
    /// Parked transport channel; operations take it out and put it back
    channel: Mutex<Option<Channel<Msg>>>,

    /// Absolute deadline, re-read by the watchdog every tick
    deadline: parking_lot::Mutex<Option<SystemTime>>,

    /// Sliding idle window; `None` = disabled
    idle_timeout: Option<Duration>,

    /// Raised exactly once when the session closes
    closed: watch::Sender<bool>,
}

impl SessionShared {
    fn new(
        channel: Option<Channel<Msg>>,
        deadline: Option<SystemTime>,
        idle_timeout: Option<Duration>,
    ) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            channel: Mutex::new(channel),
            deadline: parking_lot::Mutex::new(deadline),
            idle_timeout,
            closed,
        })
    }

    /// Shared state without a transport channel, for watchdog and copier
    /// tests that exercise deadline bookkeeping alone.
    #[cfg(test)]
    pub(crate) fn detached(
        deadline: Option<SystemTime>,
        idle_timeout: Option<Duration>,
    ) -> Arc<Self> {
        Self::new(None, deadline, idle_timeout)
    }

    /// Current deadline, if any
    pub(crate) fn deadline(&self) -> Option<SystemTime> {
        *self.deadline.lock()
    }

    /// Replace the deadline (or clear it with `None`)
    pub(crate) fn set_deadline(&self, deadline: Option<SystemTime>) {
        *self.deadline.lock() = deadline;
    }

    /// Slide the deadline to now + idle-timeout; no-op when idle timeout
    /// is disabled.
    pub(crate) fn touch(&self) {
        if let Some(idle) = self.idle_timeout {
            *self.deadline.lock() = Some(SystemTime::now() + idle);
        }
    }

    /// Whether the session has been closed
    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Signal observed by in-flight operations and the watchdog
    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Close the transport channel (if parked) and raise the closed flag.
    /// Idempotent; operations holding the channel observe the flag and
    /// finish the close themselves.
    pub(crate) async fn close(&self) {
        let channel = self.channel.lock().await.take();
        if let Some(channel) = channel {
            let _ = channel.close().await;
        }
        self.closed.send_replace(true);
    }
}

/// Handle refreshing a session's sliding idle window, handed to relays
/// that move bytes on the session's behalf.
#[derive(Clone)]
pub struct SessionActivity {
    shared: Arc<SessionShared>,
}

impl SessionActivity {
    pub(crate) fn for_shared(shared: &Arc<SessionShared>) -> Self {
        Self {
            shared: Arc::clone(shared),
        }
    }

    /// Slide the owning session's idle deadline forward
    pub fn touch(&self) {
        self.shared.touch();
    }
}

/// One logical unit of remote command or shell execution
pub struct Session {
    id: Uuid,
    variant: SessionVariant,
    connection: Arc<Connection>,
    shared: Arc<SessionShared>,
    watchdog: Option<DeadlineWatchdog>,
    started: bool,
    exit_code: Option<u32>,
    stdout: String,
    stderr: String,
}

impl Session {
    /// Open a full session on `connection`
    pub async fn open(
        connection: Arc<Connection>,
        deadline: Option<SystemTime>,
        idle_timeout: Option<Duration>,
    ) -> Result<Self> {
        let channel = connection.open_session_channel().await?;
        Ok(Self::build(
            SessionVariant::Full,
            connection,
            channel,
            deadline,
            idle_timeout,
        ))
    }

    /// Wrap a logical channel the caller opened and controls the lifetime of
    pub fn from_raw_channel(
        connection: Arc<Connection>,
        channel: Channel<Msg>,
        deadline: Option<SystemTime>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self::build(
            SessionVariant::Raw,
            connection,
            channel,
            deadline,
            idle_timeout,
        )
    }

    fn build(
        variant: SessionVariant,
        connection: Arc<Connection>,
        channel: Channel<Msg>,
        deadline: Option<SystemTime>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        let shared = SessionShared::new(Some(channel), deadline, idle_timeout);
        let id = Uuid::new_v4();
        let watchdog = DeadlineWatchdog::spawn(id, Arc::clone(&shared));
        debug!(session = %id, ?variant, "session created");
        Self {
            id,
            variant,
            connection,
            shared,
            watchdog: Some(watchdog),
            started: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Session identifier in canonical hyphenated form
    pub fn id(&self) -> String {
        self.id.to_string()
    }

    /// Which construction path produced this session
    pub fn variant(&self) -> SessionVariant {
        self.variant
    }

    /// The connection this session runs on
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Captured stdout of the last [`run`](Self::run)
    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    /// Captured stderr of the last [`run`](Self::run)
    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Exit code reported by the remote side, once known
    pub fn exit_code(&self) -> Option<u32> {
        self.exit_code
    }

    /// Replace the absolute deadline (or clear it with `None`)
    pub fn set_deadline(&self, deadline: Option<SystemTime>) {
        self.shared.set_deadline(deadline);
    }

    /// Handle for relays refreshing this session's idle window
    pub fn activity(&self) -> SessionActivity {
        SessionActivity::for_shared(&self.shared)
    }

    /// Whether the session has been closed (by the caller or the watchdog)
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Run a remote command, capturing stdout and stderr separately.
    ///
    /// A nonzero exit status is reported in the returned output; the
    /// channel closing without any exit status is a session error.
    pub async fn run(&mut self, command: &str) -> Result<CommandOutput> {
        let mut channel = self.take_channel().await?;

        if let Err(e) = channel.exec(true, command).await {
            let _ = channel.close().await;
            return Err(Error::session(format!("failed to exec command: {e}")));
        }

        let result = self.collect_output(&mut channel).await;
        self.park_channel(channel).await;
        result
    }

    /// Drain channel messages into the capture buffers until the command
    /// finishes (exit status plus EOF, or the channel goes away).
    async fn collect_output(&mut self, channel: &mut Channel<Msg>) -> Result<CommandOutput> {
        self.stdout.clear();
        self.stderr.clear();
        self.exit_code = None;

        let mut closed = self.shared.closed_signal();
        let mut got_exit_status = false;
        let mut got_eof = false;

        loop {
            tokio::select! {
                _ = closed.changed() => {
                    return Err(Error::session("session closed while command was running"));
                }
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { ref data }) => {
                        self.shared.touch();
                        self.stdout.push_str(&String::from_utf8_lossy(data));
                    }
                    Some(ChannelMsg::ExtendedData { ref data, ext }) if ext == 1 => {
                        self.shared.touch();
                        self.stderr.push_str(&String::from_utf8_lossy(data));
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        self.exit_code = Some(exit_status);
                        got_exit_status = true;
                        if got_eof {
                            break;
                        }
                    }
                    Some(ChannelMsg::Eof) => {
                        got_eof = true;
                        if got_exit_status {
                            break;
                        }
                    }
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                },
            }
        }

        // A channel that went away without reporting an exit status means
        // the command was cut off, not that it finished.
        if !got_exit_status {
            return Err(Error::session("channel closed without exit status"));
        }

        Ok(CommandOutput {
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            exit_code: self.exit_code,
        })
    }

    /// Request a pseudo-terminal.
    ///
    /// The full variant delegates to the transport's session helper. The
    /// raw variant drives the request itself: geometry is advertised with
    /// the RFC 4254 pixel dimensions (see [`crate::pty`]) and a negative
    /// acknowledgment surfaces as a "pty request failed" session error.
    pub async fn request_pty(&mut self, request: &PtyRequest) -> Result<()> {
        let channel = self.take_channel().await?;
        let result = match self.variant {
            SessionVariant::Full => channel
                .request_pty(
                    true,
                    &request.term,
                    request.cols,
                    request.rows,
                    0,
                    0,
                    &request.modes,
                )
                .await
                .map_err(|e| Error::session(format!("pty request failed: {e}"))),
            SessionVariant::Raw => {
                let (pix_width, pix_height) = request.pixel_size();
                channel
                    .request_pty(
                        true,
                        &request.term,
                        request.cols,
                        request.rows,
                        pix_width,
                        pix_height,
                        &request.modes,
                    )
                    .await
                    .map_err(|_| Error::session("pty request failed"))
            }
        };
        self.park_channel(channel).await;
        result
    }

    /// Start a login shell.
    ///
    /// On the raw variant a second start fails with an "already started"
    /// error instead of resending the request.
    pub async fn start_shell(&mut self) -> Result<()> {
        if self.variant == SessionVariant::Raw && self.started {
            return Err(Error::session("session already started"));
        }

        let channel = self.take_channel().await?;
        let result = channel
            .request_shell(true)
            .await
            .map_err(|e| Error::session(format!("could not start shell: {e}")));
        self.park_channel(channel).await;

        if result.is_ok() {
            self.started = true;
        }
        result
    }

    /// Attach a caller-owned duplex stream to the session's stdin, stdout
    /// and stderr.
    ///
    /// Relays in both directions until the remote side closes, the stream
    /// ends, or the session is closed; each transferred chunk slides the
    /// idle deadline. The first failure from any direction wins. Returns
    /// the number of bytes sent to the remote side.
    pub async fn pipe<S>(&mut self, stream: &mut S) -> Result<u64>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut channel = self.take_channel().await?;
        let result = self.relay(&mut channel, stream).await;
        self.park_channel(channel).await;
        result
    }

    async fn relay<S>(&mut self, channel: &mut Channel<Msg>, stream: &mut S) -> Result<u64>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut closed = self.shared.closed_signal();
        let mut buf = lease_buffer();
        let mut sent: u64 = 0;
        let mut stream_eof = false;

        loop {
            tokio::select! {
                _ = closed.changed() => {
                    return Err(Error::session("session closed"));
                }
                read = stream.read(&mut buf[..]), if !stream_eof => match read {
                    Ok(0) => {
                        stream_eof = true;
                        let _ = channel.eof().await;
                    }
                    Ok(n) => {
                        self.shared.touch();
                        channel
                            .data(&buf[..n])
                            .await
                            .map_err(|e| Error::stream(format!("write failed: {e}")))?;
                        sent += n as u64;
                    }
                    Err(e) => return Err(Error::stream(format!("read failed: {e}"))),
                },
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { ref data }) => {
                        self.shared.touch();
                        stream
                            .write_all(data)
                            .await
                            .map_err(|e| Error::stream(format!("write failed: {e}")))?;
                    }
                    Some(ChannelMsg::ExtendedData { ref data, ext }) if ext == 1 => {
                        self.shared.touch();
                        stream
                            .write_all(data)
                            .await
                            .map_err(|e| Error::stream(format!("write failed: {e}")))?;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        self.exit_code = Some(exit_status);
                    }
                    Some(ChannelMsg::Eof) => {}
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                },
            }
        }

        let _ = stream.flush().await;
        Ok(sent)
    }

    /// Wait for the remote command or shell to finish; returns the exit
    /// status if the remote side reported one.
    pub async fn wait(&mut self) -> Result<Option<u32>> {
        let mut channel = self.take_channel().await?;
        let mut closed = self.shared.closed_signal();

        loop {
            tokio::select! {
                _ = closed.changed() => {
                    self.park_channel(channel).await;
                    return Err(Error::session("session closed"));
                }
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        self.exit_code = Some(exit_status);
                    }
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                },
            }
        }

        self.park_channel(channel).await;
        Ok(self.exit_code)
    }

    /// Close the session and stop its watchdog, blocking until the
    /// watchdog has actually terminated. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        self.shared.close().await;
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.join().await;
        }
        debug!(session = %self.id, "session closed");
        Ok(())
    }

    async fn take_channel(&self) -> Result<Channel<Msg>> {
        if self.shared.is_closed() {
            return Err(Error::session("session is closed"));
        }
        self.shared
            .channel
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::session("session channel is busy"))
    }

    async fn park_channel(&self, channel: Channel<Msg>) {
        if self.shared.is_closed() {
            // Closed while the operation held the channel; finish the close.
            let _ = channel.close().await;
            return;
        }
        *self.shared.channel.lock().await = Some(channel);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // A dropped session must not leave its watchdog running forever;
        // raising the flag lets it wind down on its own.
        if !self.shared.is_closed() {
            warn!(session = %self.id, "session dropped without close");
            self.shared.closed.send_replace(true);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("variant", &self.variant)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_output_success() {
        let output = CommandOutput {
            stdout: "hello".to_string(),
            stderr: String::new(),
            exit_code: Some(0),
        };
        assert!(output.success());

        let output = CommandOutput {
            exit_code: Some(1),
            ..Default::default()
        };
        assert!(!output.success());

        // No exit code reported is treated as success
        assert!(CommandOutput::default().success());
    }

    #[test]
    fn test_session_ids_are_canonical_uuids() {
        let id = Uuid::new_v4().to_string();
        assert_eq!(id.len(), 36);
        assert_eq!(id.matches('-').count(), 4);
    }

    #[tokio::test]
    async fn test_shared_close_is_idempotent() {
        let shared = SessionShared::detached(None, None);
        assert!(!shared.is_closed());

        shared.close().await;
        assert!(shared.is_closed());

        // Second close changes nothing and does not panic.
        shared.close().await;
        assert!(shared.is_closed());
    }

    #[tokio::test]
    async fn test_closed_signal_observed() {
        let shared = SessionShared::detached(None, None);
        let mut signal = shared.closed_signal();

        let waiter = tokio::spawn(async move {
            signal.changed().await.unwrap();
            *signal.borrow()
        });

        shared.close().await;
        assert!(waiter.await.unwrap());
    }

    #[test]
    fn test_touch_respects_disabled_idle_timeout() {
        let shared = SessionShared::detached(None, None);
        shared.touch();
        assert!(shared.deadline().is_none());

        let idle = SessionShared::detached(None, Some(Duration::from_secs(5)));
        idle.touch();
        assert!(idle.deadline().is_some());
    }

    #[test]
    fn test_set_deadline_overrides() {
        let deadline = SystemTime::now() + Duration::from_secs(60);
        let shared = SessionShared::detached(Some(deadline), None);
        assert_eq!(shared.deadline(), Some(deadline));

        shared.set_deadline(None);
        assert!(shared.deadline().is_none());
    }
}
