//! Transfer throughput limiting
//!
//! A token bucket built for chunked transfer pacing, not general traffic
//! shaping: one token is permission to send exactly one 64 KiB chunk, and
//! a refill task tops the bucket up every 100 ms from the configured
//! budget. Budgets too small to honor at that granularity are rejected
//! outright rather than silently granting more throughput than requested.
//! Each limiter owns its refill task, so independent limiters coexist
//! without cross-talk.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::debug;

use crate::error::{Error, Result};

/// Size of one transfer chunk; one token covers one chunk
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Fewest tokens granted per refill cycle
pub const MIN_TOKENS_PER_REFILL: u64 = 10;

/// How often the bucket is topped up
pub const REFILL_INTERVAL: Duration = Duration::from_millis(100);

/// Smallest nonzero budget the limiter can honor, in bytes/second.
///
/// Below this, even the minimum grant of [`MIN_TOKENS_PER_REFILL`] chunks
/// per cycle would exceed the requested rate.
pub const MIN_ENFORCEABLE_RATE: u64 =
    CHUNK_SIZE as u64 * MIN_TOKENS_PER_REFILL * (1000 / REFILL_INTERVAL.as_millis() as u64);

/// Shared bytes/second budget for all transfers on a client.
///
/// Mutated only under its lock; the refill task re-reads it every cycle,
/// so changes apply to transfers already in flight.
#[derive(Clone, Debug, Default)]
pub struct ThroughputBudget {
    value: Arc<Mutex<u64>>,
}

impl ThroughputBudget {
    /// Create a budget of `bytes_per_sec` (0 = unlimited)
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            value: Arc::new(Mutex::new(bytes_per_sec)),
        }
    }

    /// Current budget in bytes/second
    pub fn get(&self) -> u64 {
        *self.value.lock()
    }

    /// Replace the budget (0 = unlimited)
    pub fn set(&self, bytes_per_sec: u64) {
        *self.value.lock() = bytes_per_sec;
    }
}

#[derive(Debug)]
enum Pacing {
    /// Zero budget: no pacing and no refill task at all
    Unlimited,
    Limited {
        tokens: Arc<Semaphore>,
        refill: JoinHandle<()>,
    },
}

/// Token-bucket gate pacing outbound chunks against a [`ThroughputBudget`]
#[derive(Debug)]
pub struct ThroughputLimiter {
    pacing: Pacing,
}

impl ThroughputLimiter {
    /// Validate the budget and start the refill task.
    ///
    /// A nonzero budget below [`MIN_ENFORCEABLE_RATE`] is a fatal
    /// configuration error, raised here before any data moves.
    pub fn start(budget: &ThroughputBudget) -> Result<Self> {
        let rate = budget.get();
        if rate == 0 {
            debug!("throughput unlimited, pacing disabled");
            return Ok(Self {
                pacing: Pacing::Unlimited,
            });
        }
        if rate < MIN_ENFORCEABLE_RATE {
            return Err(Error::config(format!(
                "throughput budget {rate} B/s is below the minimum enforceable rate {MIN_ENFORCEABLE_RATE} B/s"
            )));
        }

        let tokens = Arc::new(Semaphore::new(0));
        let refill = tokio::spawn(refill_loop(Arc::clone(&tokens), budget.clone()));
        debug!(rate, "throughput limiter started");
        Ok(Self {
            pacing: Pacing::Limited { tokens, refill },
        })
    }

    /// Acquire permission to send one chunk, blocking while the bucket is
    /// dry. Immediate when unlimited.
    pub async fn acquire(&self) -> Result<()> {
        match &self.pacing {
            Pacing::Unlimited => Ok(()),
            Pacing::Limited { tokens, .. } => {
                let permit = tokens
                    .acquire()
                    .await
                    .map_err(|_| Error::stream("throughput limiter stopped"))?;
                permit.forget();
                Ok(())
            }
        }
    }
}

impl Drop for ThroughputLimiter {
    fn drop(&mut self) {
        if let Pacing::Limited { refill, .. } = &self.pacing {
            refill.abort();
        }
    }
}

/// Tokens granted per refill cycle for `rate` bytes/second
fn tokens_per_cycle(rate: u64) -> u64 {
    let computed = rate / CHUNK_SIZE as u64 * REFILL_INTERVAL.as_millis() as u64 / 1000;
    computed.max(MIN_TOKENS_PER_REFILL)
}

async fn refill_loop(tokens: Arc<Semaphore>, budget: ThroughputBudget) {
    let mut ticker = interval(REFILL_INTERVAL);
    loop {
        ticker.tick().await;

        // Re-read every cycle so budget changes apply live.
        let rate = budget.get();
        let quota = if rate == 0 {
            // Budget cleared mid-transfer: grant freely.
            u16::MAX as u64
        } else {
            tokens_per_cycle(rate)
        };

        // Top up to the per-cycle quota; unclaimed tokens never accumulate
        // beyond one cycle's worth.
        let available = tokens.available_permits() as u64;
        if available < quota {
            tokens.add_permits((quota - available) as usize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_tokens_per_cycle_math() {
        // Exactly the minimum rate: ten chunks per cycle.
        assert_eq!(tokens_per_cycle(MIN_ENFORCEABLE_RATE), 10);
        // Double the rate, double the grant.
        assert_eq!(tokens_per_cycle(2 * MIN_ENFORCEABLE_RATE), 20);
        // Fractional chunk counts floor down to the minimum grant.
        assert_eq!(tokens_per_cycle(MIN_ENFORCEABLE_RATE + CHUNK_SIZE as u64), 10);
        // 100 chunks/sec budget grants 10 per 100 ms cycle.
        assert_eq!(tokens_per_cycle(CHUNK_SIZE as u64 * 100), 10);
        assert_eq!(tokens_per_cycle(CHUNK_SIZE as u64 * 1000), 100);
    }

    #[test]
    fn test_minimum_rate_constant() {
        // 64 KiB chunks, 10 per cycle, 10 cycles per second.
        assert_eq!(MIN_ENFORCEABLE_RATE, 6_553_600);
    }

    #[tokio::test]
    async fn test_below_minimum_budget_refuses_to_start() {
        let budget = ThroughputBudget::new(1024 * 1024);
        let err = ThroughputLimiter::start(&budget).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got: {err}");
    }

    #[tokio::test]
    async fn test_unlimited_budget_never_sleeps() {
        let budget = ThroughputBudget::new(0);
        let limiter = ThroughputLimiter::start(&budget).unwrap();

        // A 10 MiB transfer is 160 chunks; with no pacing this is
        // effectively instantaneous.
        let start = Instant::now();
        for _ in 0..(10 * 1024 * 1024 / CHUNK_SIZE) {
            limiter.acquire().await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_paced_acquire_blocks_for_refill() {
        let budget = ThroughputBudget::new(MIN_ENFORCEABLE_RATE);
        let limiter = ThroughputLimiter::start(&budget).unwrap();

        // The first cycle grants ten tokens almost immediately.
        for _ in 0..10 {
            limiter.acquire().await.unwrap();
        }

        // The eleventh must wait for the next refill cycle.
        let start = Instant::now();
        limiter.acquire().await.unwrap();
        let waited = start.elapsed();
        assert!(
            waited >= Duration::from_millis(40),
            "eleventh token granted too early: {waited:?}"
        );
    }

    #[tokio::test]
    async fn test_budget_updates_visible_under_lock() {
        let budget = ThroughputBudget::new(0);
        assert_eq!(budget.get(), 0);
        budget.set(MIN_ENFORCEABLE_RATE);
        assert_eq!(budget.get(), MIN_ENFORCEABLE_RATE);

        // Clones share the same value.
        let alias = budget.clone();
        alias.set(0);
        assert_eq!(budget.get(), 0);
    }
}
