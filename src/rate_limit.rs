//! Token-bucket rate limiting.
//!
//! A [`TokenBucket`] holds up to `capacity` tokens and is refilled with one
//! token every `1 / rate` seconds by a background task. Acquiring is a
//! non-blocking check-and-decrement; what to do on rejection is up to the
//! caller, and [`Throttle`] packages the two policies the stages use.

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::emit;
use crate::error::{
    CapacityBelowRateSnafu, InvalidRateSnafu, NoRuntimeSnafu, RateTooHighSnafu, SetupError,
};
use crate::metrics::events::{RateLimitDecision, RateLimited};

/// Highest rate with a non-zero refill period (one token per nanosecond).
pub const MAX_RATE: u32 = 1_000_000_000;

#[derive(Debug)]
struct BucketState {
    available: u32,
    closed: bool,
}

fn lock_state(state: &Mutex<BucketState>) -> MutexGuard<'_, BucketState> {
    // The critical sections never panic, but a poisoned lock still holds a
    // consistent counter.
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Concurrency-safe token bucket with a background refiller.
///
/// The counter is only touched under its mutex and never exceeds
/// `capacity`. Dropping the bucket stops the refiller.
#[derive(Debug)]
pub struct TokenBucket {
    state: Arc<Mutex<BucketState>>,
    capacity: u32,
    rate: u32,
    period: Duration,
    shutdown: CancellationToken,
}

impl TokenBucket {
    /// Create a bucket refilled at `rate` tokens per second, holding at most
    /// `capacity` tokens. Starts with `min(rate, capacity)` tokens.
    ///
    /// Must be called from within a tokio runtime, which hosts the refiller.
    pub fn new(rate: u32, capacity: u32) -> Result<Self, SetupError> {
        ensure!(rate > 0, InvalidRateSnafu { rate });
        ensure!(rate <= MAX_RATE, RateTooHighSnafu { rate, max: MAX_RATE });
        ensure!(capacity >= rate, CapacityBelowRateSnafu { capacity, rate });
        let runtime = tokio::runtime::Handle::try_current().context(NoRuntimeSnafu)?;

        let period = Duration::from_secs(1) / rate;
        let state = Arc::new(Mutex::new(BucketState {
            available: rate.min(capacity),
            closed: false,
        }));
        let shutdown = CancellationToken::new();

        runtime.spawn(run_refiller(
            Arc::clone(&state),
            capacity,
            period,
            shutdown.clone(),
        ));

        debug!(rate, capacity, "Token bucket started");

        Ok(Self {
            state,
            capacity,
            rate,
            period,
            shutdown,
        })
    }

    /// Take one token if available. Never blocks.
    pub fn try_acquire(&self) -> bool {
        let mut state = lock_state(&self.state);
        if state.available > 0 {
            state.available -= 1;
            true
        } else {
            false
        }
    }

    /// Tokens currently available.
    pub fn available(&self) -> u32 {
        lock_state(&self.state).available
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Interval between two refill ticks.
    pub fn refill_period(&self) -> Duration {
        self.period
    }

    /// Stop the refiller. Calling this more than once is a no-op.
    ///
    /// The closed flag is set under the same lock the refiller takes, so no
    /// tick can add a token once `close` has returned.
    pub fn close(&self) {
        {
            let mut state = lock_state(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.shutdown.cancel();
        debug!("Token bucket closed");
    }

    pub fn is_closed(&self) -> bool {
        lock_state(&self.state).closed
    }
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_refiller(
    state: Arc<Mutex<BucketState>>,
    capacity: u32,
    period: Duration,
    shutdown: CancellationToken,
) {
    // First tick one period from now; missed ticks are dropped, not replayed.
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            _ = ticker.tick() => {
                let mut state = lock_state(&state);
                if state.closed {
                    break;
                }
                if state.available < capacity {
                    state.available += 1;
                }
            }
        }
    }

    debug!("Token bucket refiller stopped");
}

/// What a throttled stage does when the bucket is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectPolicy {
    /// Poll the bucket once per refill period until a token is granted.
    #[default]
    Wait,
    /// Fail the item immediately.
    Reject,
}

/// Result of asking a [`Throttle`] for permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Rejected,
    /// Cancellation fired while waiting for a token.
    Cancelled,
}

/// A shared bucket plus the policy to apply on rejection.
#[derive(Debug, Clone)]
pub struct Throttle {
    bucket: Arc<TokenBucket>,
    policy: RejectPolicy,
}

impl Throttle {
    pub fn new(bucket: Arc<TokenBucket>, policy: RejectPolicy) -> Self {
        Self { bucket, policy }
    }

    pub fn bucket(&self) -> &Arc<TokenBucket> {
        &self.bucket
    }

    pub fn policy(&self) -> RejectPolicy {
        self.policy
    }

    /// Ask for one token, applying the reject policy if none is available.
    pub async fn admit(&self, shutdown: &CancellationToken) -> Admission {
        if self.bucket.try_acquire() {
            emit!(RateLimited {
                decision: RateLimitDecision::Granted
            });
            return Admission::Granted;
        }

        if self.policy == RejectPolicy::Reject {
            emit!(RateLimited {
                decision: RateLimitDecision::Rejected
            });
            return Admission::Rejected;
        }

        loop {
            if shutdown
                .run_until_cancelled(tokio::time::sleep(self.bucket.refill_period()))
                .await
                .is_none()
            {
                return Admission::Cancelled;
            }
            if self.bucket.try_acquire() {
                emit!(RateLimited {
                    decision: RateLimitDecision::Waited
                });
                return Admission::Granted;
            }
            // A closed bucket never refills, waiting would never end.
            if self.bucket.is_closed() {
                emit!(RateLimited {
                    decision: RateLimitDecision::Rejected
                });
                return Admission::Rejected;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_new_starts_with_rate_tokens() {
        let bucket = TokenBucket::new(5, 20).unwrap();
        assert_eq!(bucket.available(), 5);
        assert_eq!(bucket.capacity(), 20);
        assert_eq!(bucket.refill_period(), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_parameters() {
        assert!(matches!(
            TokenBucket::new(0, 10),
            Err(SetupError::InvalidRate { rate: 0 })
        ));
        assert!(matches!(
            TokenBucket::new(10, 5),
            Err(SetupError::CapacityBelowRate {
                capacity: 5,
                rate: 10
            })
        ));
        assert!(matches!(
            TokenBucket::new(MAX_RATE + 1, u32::MAX),
            Err(SetupError::RateTooHigh { .. })
        ));
    }

    #[tokio::test]
    async fn test_max_rate_has_nonzero_period() {
        let bucket = TokenBucket::new(MAX_RATE, MAX_RATE).unwrap();
        assert_eq!(bucket.refill_period(), Duration::from_nanos(1));
        bucket.close();
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        assert!(matches!(
            TokenBucket::new(1, 1),
            Err(SetupError::NoRuntime { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_exhausts_bucket() {
        let bucket = TokenBucket::new(3, 3).unwrap();
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        assert_eq!(bucket.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_grants_exactly_one_token_per_period() {
        let bucket = TokenBucket::new(10, 10).unwrap();
        while bucket.try_acquire() {}

        // One refill tick at 100ms, the next not until 200ms.
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_never_exceeds_capacity() {
        let bucket = TokenBucket::new(5, 8).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(bucket.available(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquires_take_exactly_available_tokens() {
        let bucket = Arc::new(TokenBucket::new(32, 32).unwrap());
        let granted = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..64 {
            let bucket = Arc::clone(&bucket);
            let granted = Arc::clone(&granted);
            handles.push(tokio::spawn(async move {
                for _ in 0..4 {
                    if bucket.try_acquire() {
                        granted.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(granted.load(Ordering::SeqCst), 32);
        assert_eq!(bucket.available(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_counter_stays_within_bounds_under_contention() {
        let bucket = Arc::new(TokenBucket::new(50, 50).unwrap());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let bucket = Arc::clone(&bucket);
            handles.push(tokio::spawn(async move {
                for _ in 0..200 {
                    bucket.try_acquire();
                    let available = bucket.available();
                    assert!(available <= bucket.capacity());
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(bucket.available() <= bucket.capacity());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent_and_stops_refill() {
        let bucket = TokenBucket::new(10, 10).unwrap();
        while bucket.try_acquire() {}

        bucket.close();
        bucket.close();
        assert!(bucket.is_closed());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(bucket.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_reject_policy() {
        let bucket = Arc::new(TokenBucket::new(1, 1).unwrap());
        let throttle = Throttle::new(bucket, RejectPolicy::Reject);
        let shutdown = CancellationToken::new();

        assert_eq!(throttle.admit(&shutdown).await, Admission::Granted);
        assert_eq!(throttle.admit(&shutdown).await, Admission::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_wait_policy_waits_for_refill() {
        let bucket = Arc::new(TokenBucket::new(4, 4).unwrap());
        let throttle = Throttle::new(Arc::clone(&bucket), RejectPolicy::Wait);
        let shutdown = CancellationToken::new();

        while bucket.try_acquire() {}

        let start = Instant::now();
        assert_eq!(throttle.admit(&shutdown).await, Admission::Granted);
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_wait_observes_cancellation() {
        let bucket = Arc::new(TokenBucket::new(1, 1).unwrap());
        let throttle = Throttle::new(Arc::clone(&bucket), RejectPolicy::Wait);
        let shutdown = CancellationToken::new();

        assert!(bucket.try_acquire());
        bucket.close();
        shutdown.cancel();

        assert_eq!(throttle.admit(&shutdown).await, Admission::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_wait_on_closed_bucket_rejects() {
        let bucket = Arc::new(TokenBucket::new(1, 1).unwrap());
        let throttle = Throttle::new(Arc::clone(&bucket), RejectPolicy::Wait);
        let shutdown = CancellationToken::new();

        assert!(bucket.try_acquire());
        bucket.close();

        assert_eq!(throttle.admit(&shutdown).await, Admission::Rejected);
    }
}
