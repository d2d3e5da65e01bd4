//! Session deadline enforcement
//!
//! One watchdog per session: a background task comparing the current time
//! against the session's deadline once per second and closing the session
//! when it has passed. The deadline is re-read every tick because idle
//! refresh moves it concurrently. The watchdog terminates as soon as the
//! session closes for any other reason, and [`Session::close`] joins it,
//! so no task outlives its session.
//!
//! [`Session::close`]: crate::session::Session::close

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};
use uuid::Uuid;

use crate::session::SessionShared;

/// How often a watchdog compares the clock against the deadline
pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Background monitor enforcing one session's deadline
pub(crate) struct DeadlineWatchdog {
    handle: JoinHandle<()>,
}

impl DeadlineWatchdog {
    /// Spawn the watchdog task supervising `shared`
    pub(crate) fn spawn(session_id: Uuid, shared: Arc<SessionShared>) -> Self {
        let handle = tokio::spawn(async move {
            let mut closed = shared.closed_signal();
            let mut ticker = interval(POLL_INTERVAL);

            loop {
                tokio::select! {
                    _ = closed.changed() => break,
                    _ = ticker.tick() => {
                        if let Some(deadline) = shared.deadline() {
                            if SystemTime::now() >= deadline {
                                info!(session = %session_id, "session deadline expired, closing");
                                shared.close().await;
                                break;
                            }
                        }
                    }
                }
            }
            debug!(session = %session_id, "watchdog terminated");
        });

        Self { handle }
    }

    /// Wait for the watchdog task to finish
    pub(crate) async fn join(self) {
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_past_deadline_closes_session_promptly() {
        let deadline = SystemTime::now() - Duration::from_secs(5);
        let shared = SessionShared::detached(Some(deadline), None);
        let watchdog = DeadlineWatchdog::spawn(Uuid::new_v4(), Arc::clone(&shared));

        // The first poll fires immediately; well within one interval.
        timeout(Duration::from_millis(500), watchdog.join())
            .await
            .expect("watchdog should fire within one polling interval");
        assert!(shared.is_closed());
    }

    #[tokio::test]
    async fn test_no_deadline_never_fires_but_terminates_on_close() {
        let shared = SessionShared::detached(None, None);
        let watchdog = DeadlineWatchdog::spawn(Uuid::new_v4(), Arc::clone(&shared));

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(!shared.is_closed());

        shared.close().await;
        timeout(Duration::from_secs(2), watchdog.join())
            .await
            .expect("watchdog should terminate once the session closes");
    }

    #[tokio::test]
    async fn test_future_deadline_not_fired_early() {
        let deadline = SystemTime::now() + Duration::from_secs(3600);
        let shared = SessionShared::detached(Some(deadline), None);
        let watchdog = DeadlineWatchdog::spawn(Uuid::new_v4(), Arc::clone(&shared));

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(!shared.is_closed());

        shared.close().await;
        watchdog.join().await;
    }

    #[tokio::test]
    async fn test_idle_refresh_holds_off_expiry() {
        // Short idle window, refreshed faster than it elapses.
        let shared = SessionShared::detached(None, Some(Duration::from_secs(2)));
        shared.touch();
        let watchdog = DeadlineWatchdog::spawn(Uuid::new_v4(), Arc::clone(&shared));

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(700)).await;
            assert!(!shared.is_closed(), "session expired despite traffic");
            shared.touch();
        }

        // Traffic stops; the idle window runs out within a poll or two.
        timeout(Duration::from_secs(4), watchdog.join())
            .await
            .expect("watchdog should close an idle session");
        assert!(shared.is_closed());
    }
}
