//! Byte-stream relay with pooled buffers
//!
//! [`copy`] moves bytes from a source to a destination until end-of-input,
//! using a fixed-size buffer leased from a shared pool. When the copy is
//! feeding a session with an idle timeout, every read refreshes the
//! session's sliding deadline before the corresponding write, keeping the
//! deadline watchdog at bay while traffic flows.

use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::session::SessionActivity;

/// Size of the relay buffer used by [`copy`]
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Upper bound on buffers retained for reuse
const MAX_POOLED_BUFFERS: usize = 32;

static BUFFER_POOL: BufferPool = BufferPool::new();

/// A pool of reusable copy buffers shared by all relays in the process
struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    const fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
        }
    }

    fn lease(&'static self) -> PooledBuffer {
        let buf = self
            .buffers
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; COPY_BUFFER_SIZE]);
        PooledBuffer {
            buf: Some(buf),
            pool: self,
        }
    }

    fn release(&self, buf: Vec<u8>) {
        let mut buffers = self.buffers.lock();
        if buffers.len() < MAX_POOLED_BUFFERS {
            buffers.push(buf);
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.buffers.lock().len()
    }
}

/// A buffer leased from the shared pool, returned on drop regardless of
/// how the owning copy loop exits.
pub(crate) struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: &'static BufferPool,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

/// Lease a relay buffer from the shared pool
pub(crate) fn lease_buffer() -> PooledBuffer {
    BUFFER_POOL.lease()
}

/// Copy bytes from `src` to `dst` until `src` reports end-of-input.
///
/// With an owning session's [`SessionActivity`] supplied, every successful
/// read of n > 0 bytes slides the session's idle deadline forward before
/// the bytes are written out. A write that accepts zero bytes while data
/// is outstanding is reported as the distinct
/// [`ShortWrite`](Error::ShortWrite) condition; other read/write failures
/// surface as [`Stream`](Error::Stream) errors. Returns the number of
/// bytes written.
pub async fn copy<R, W>(
    dst: &mut W,
    src: &mut R,
    activity: Option<&SessionActivity>,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = lease_buffer();
    let mut copied: u64 = 0;

    loop {
        let n = src
            .read(&mut buf[..])
            .await
            .map_err(|e| Error::stream(format!("read failed: {e}")))?;
        if n == 0 {
            break;
        }

        if let Some(activity) = activity {
            activity.touch();
        }

        let mut written = 0;
        while written < n {
            let w = dst
                .write(&buf[written..n])
                .await
                .map_err(|e| Error::stream(format!("write failed: {e}")))?;
            if w == 0 {
                return Err(Error::ShortWrite {
                    written,
                    expected: n,
                });
            }
            written += w;
        }
        copied += n as u64;
    }

    dst.flush()
        .await
        .map_err(|e| Error::stream(format!("flush failed: {e}")))?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::{Duration, SystemTime};

    /// Writer that accepts nothing, provoking the short-write condition.
    struct ZeroSink;

    impl AsyncWrite for ZeroSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(0))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_copy_round_trip() {
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let (mut tx, mut rx) = tokio::io::duplex(4096);

        let writer = {
            let payload = payload.clone();
            tokio::spawn(async move {
                tx.write_all(&payload).await.unwrap();
                tx.shutdown().await.unwrap();
            })
        };

        let mut sink = Cursor::new(Vec::new());
        let copied = copy(&mut sink, &mut rx, None).await.unwrap();
        writer.await.unwrap();

        assert_eq!(copied, payload.len() as u64);
        assert_eq!(sink.into_inner(), payload);
    }

    #[tokio::test]
    async fn test_copy_empty_source() {
        let mut src: &[u8] = &[];
        let mut sink = Cursor::new(Vec::new());
        assert_eq!(copy(&mut sink, &mut src, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_short_write_is_distinct_error() {
        let mut src: &[u8] = b"data that will not fit";
        let err = copy(&mut ZeroSink, &mut src, None).await.unwrap_err();
        assert!(matches!(err, Error::ShortWrite { written: 0, .. }), "got: {err}");
    }

    #[tokio::test]
    async fn test_reads_refresh_idle_deadline() {
        let shared =
            crate::session::SessionShared::detached(None, Some(Duration::from_secs(30)));
        let activity = SessionActivity::for_shared(&shared);
        assert!(shared.deadline().is_none());

        let before = SystemTime::now();
        let mut src: &[u8] = b"traffic";
        let mut sink = Cursor::new(Vec::new());
        copy(&mut sink, &mut src, Some(&activity)).await.unwrap();

        let deadline = shared.deadline().expect("idle deadline set by read");
        assert!(deadline >= before + Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_disabled_idle_timeout_leaves_deadline_alone() {
        let shared = crate::session::SessionShared::detached(None, None);
        let activity = SessionActivity::for_shared(&shared);

        let mut src: &[u8] = b"traffic";
        let mut sink = Cursor::new(Vec::new());
        copy(&mut sink, &mut src, Some(&activity)).await.unwrap();

        assert!(shared.deadline().is_none());
    }

    #[test]
    fn test_buffers_are_fixed_size_and_reusable() {
        // Other tests share the global pool, so count deltas are not
        // reliable here; hold the only reference and watch one cycle.
        let pool = BufferPool::new();
        let leaked: &'static BufferPool = Box::leak(Box::new(pool));

        let buf = leaked.lease();
        assert_eq!(buf.len(), COPY_BUFFER_SIZE);
        drop(buf);
        assert_eq!(leaked.pooled(), 1);

        let again = leaked.lease();
        assert_eq!(again.len(), COPY_BUFFER_SIZE);
        assert_eq!(leaked.pooled(), 0);
    }
}
