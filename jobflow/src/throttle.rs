//! Token-bucket rate limiting driven by a ticker.
//!
//! The bucket holds `ceil(rate)` tokens and starts full. A background
//! ticker adds one token every `1 / rate` seconds, so refills arrive in
//! evenly spaced steps rather than continuously.

use crate::cancellation::{Scope, ScopeError};
use crate::clock::{SharedClock, Ticker, TickerStop};
use crate::errors::{ConfigError, JobflowError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// A token bucket shared by the workers of one stage or pool.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    capacity: u64,
    tokens: AtomicU64,
    refilled: Notify,
    ticker: TickerStop,
}

impl RateLimiter {
    /// Starts a limiter admitting `rate` items per second.
    ///
    /// The refill task stops when `scope` is done or the limiter is dropped.
    pub fn start(rate: f64, clock: SharedClock, scope: &Scope) -> Result<Arc<Self>> {
        let (capacity, period) = bucket_shape(rate)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            JobflowError::resource_exhausted(format!("cannot start rate limiter: {e}"))
        })?;
        let mut ticker = Ticker::new(clock, period)?;

        let limiter = Arc::new(Self {
            rate,
            capacity,
            tokens: AtomicU64::new(capacity),
            refilled: Notify::new(),
            ticker: ticker.stopper(),
        });

        let weak: Weak<Self> = Arc::downgrade(&limiter);
        let scope = scope.clone();
        runtime.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = scope.done() => break,
                    tick = ticker.tick() => {
                        if tick.is_none() {
                            break;
                        }
                        match weak.upgrade() {
                            Some(limiter) => limiter.refill(),
                            None => break,
                        }
                    }
                }
            }
            debug!("Rate limiter refill stopped");
        });

        Ok(limiter)
    }

    fn refill(&self) {
        let added = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                (t < self.capacity).then_some(t + 1)
            })
            .is_ok();
        if added {
            self.refilled.notify_waiters();
        }
    }

    /// Takes a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| t.checked_sub(1))
            .is_ok()
    }

    /// Waits for a token.
    pub async fn acquire(&self, scope: &Scope) -> std::result::Result<(), ScopeError> {
        loop {
            if let Some(cause) = scope.err() {
                return Err(cause);
            }
            let refilled = self.refilled.notified();
            tokio::pin!(refilled);
            refilled.as_mut().enable();

            if self.try_acquire() {
                return Ok(());
            }

            tokio::select! {
                biased;
                cause = scope.done() => return Err(cause),
                () = &mut refilled => {}
            }
        }
    }

    /// Returns the number of tokens currently in the bucket.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.tokens.load(Ordering::Acquire)
    }

    /// Returns the bucket capacity.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the configured rate in items per second.
    #[must_use]
    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.ticker.stop();
    }
}

/// Validates `rate` and returns the bucket capacity and refill period.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn bucket_shape(rate: f64) -> std::result::Result<(u64, Duration), ConfigError> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(ConfigError::new(
            "rate_limit",
            format!("rate must be a positive number of items per second, got {rate}"),
        ));
    }
    let capacity = (rate.ceil() as u64).max(1);
    let period = Duration::from_secs_f64(1.0 / rate);
    if period.is_zero() {
        return Err(ConfigError::new("rate_limit", "rate is too high to schedule"));
    }
    Ok((capacity, period))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{system_clock, ManualClock};

    #[test]
    fn test_bucket_shape() {
        assert_eq!(bucket_shape(10.0).unwrap(), (10, Duration::from_millis(100)));
        assert_eq!(bucket_shape(0.5).unwrap(), (1, Duration::from_secs(2)));
        assert_eq!(bucket_shape(2.5).unwrap().0, 3);
        assert!(bucket_shape(0.0).is_err());
        assert!(bucket_shape(-1.0).is_err());
        assert!(bucket_shape(f64::NAN).is_err());
    }

    #[tokio::test]
    async fn test_bucket_starts_full_and_empties() {
        let limiter = RateLimiter::start(3.0, ManualClock::new(), &Scope::background()).unwrap();
        assert_eq!(limiter.available(), 3);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn test_refill_one_token_per_period() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::start(2.0, clock.clone(), &Scope::background()).unwrap();
        while limiter.try_acquire() {}

        while clock.pending_sleepers() == 0 {
            tokio::task::yield_now().await;
        }
        clock.advance(Duration::from_millis(500));
        limiter.acquire(&Scope::background()).await.unwrap();
        assert_eq!(limiter.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_paces_callers() {
        let clock = system_clock();
        let limiter = RateLimiter::start(10.0, clock.clone(), &Scope::background()).unwrap();
        let scope = Scope::background();
        let start = clock.now();

        for _ in 0..30 {
            limiter.acquire(&scope).await.unwrap();
        }
        // Ten from the full bucket, twenty more at one per 100 ms.
        assert!(clock.now() - start >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_acquire_observes_cancellation() {
        let limiter = RateLimiter::start(1.0, ManualClock::new(), &Scope::background()).unwrap();
        assert!(limiter.try_acquire());

        let (scope, cancel) = Scope::background().with_cancel();
        cancel.cancel();
        assert_eq!(limiter.acquire(&scope).await, Err(ScopeError::Cancelled));
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let err = RateLimiter::start(1.0, ManualClock::new(), &Scope::background()).unwrap_err();
        assert!(matches!(err, JobflowError::ResourceExhausted(_)));
    }
}
