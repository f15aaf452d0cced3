//! One-shot timers and periodic tickers.

use super::{Instant, SharedClock};
use crate::errors::ConfigError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Shared stop flag for timers and tickers.
#[derive(Debug, Default)]
struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    fn stop(&self) -> bool {
        let first = !self.stopped.swap(true, Ordering::SeqCst);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// A one-shot timer that fires once at its deadline unless stopped.
#[derive(Debug, Clone)]
pub struct Timer {
    clock: SharedClock,
    deadline: Instant,
    stop: Arc<StopSignal>,
}

impl Timer {
    /// Creates a timer firing `after` from now.
    #[must_use]
    pub fn new(clock: SharedClock, after: Duration) -> Self {
        let deadline = clock.now() + after;
        Self::at(clock, deadline)
    }

    /// Creates a timer firing at `deadline`.
    #[must_use]
    pub fn at(clock: SharedClock, deadline: Instant) -> Self {
        Self {
            clock,
            deadline,
            stop: Arc::new(StopSignal::default()),
        }
    }

    /// Returns the instant at which the timer fires.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Waits for the timer. Returns `true` if it fired, `false` if stopped.
    pub async fn wait(&self) -> bool {
        let stopped = self.stop.notify.notified();
        tokio::pin!(stopped);
        stopped.as_mut().enable();

        if self.stop.is_stopped() {
            return false;
        }

        tokio::select! {
            biased;
            () = &mut stopped => false,
            () = self.clock.sleep_until(self.deadline) => !self.stop.is_stopped(),
        }
    }

    /// Stops the timer. Returns `true` on the first call.
    pub fn stop(&self) -> bool {
        self.stop.stop()
    }

    /// Returns whether the timer has been stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }
}

/// A periodic ticker producing one signal per period until stopped.
///
/// Ticks that are missed because the consumer was slow are dropped rather
/// than delivered in a burst.
#[derive(Debug)]
pub struct Ticker {
    clock: SharedClock,
    period: Duration,
    next: Instant,
    stop: Arc<StopSignal>,
}

impl Ticker {
    /// Creates a ticker whose first tick is one period from now.
    pub fn new(clock: SharedClock, period: Duration) -> Result<Self, ConfigError> {
        if period.is_zero() {
            return Err(ConfigError::new("period", "ticker period must be non-zero"));
        }
        let next = clock.now() + period;
        Ok(Self {
            clock,
            period,
            next,
            stop: Arc::new(StopSignal::default()),
        })
    }

    /// Returns the ticker period.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Waits for the next tick. Returns `None` once the ticker is stopped.
    pub async fn tick(&mut self) -> Option<Instant> {
        let stopped = self.stop.notify.notified();
        tokio::pin!(stopped);
        stopped.as_mut().enable();

        if self.stop.is_stopped() {
            return None;
        }

        tokio::select! {
            biased;
            () = &mut stopped => None,
            () = self.clock.sleep_until(self.next) => {
                if self.stop.is_stopped() {
                    return None;
                }
                let now = self.clock.now();
                self.next += self.period;
                if self.next <= now {
                    self.next = now + self.period;
                }
                Some(now)
            }
        }
    }

    /// Stops the ticker. Returns `true` on the first call.
    pub fn stop(&self) -> bool {
        self.stop.stop()
    }

    /// Returns a handle that can stop this ticker from another task.
    #[must_use]
    pub fn stopper(&self) -> TickerStop {
        TickerStop {
            stop: self.stop.clone(),
        }
    }
}

/// Remote stop handle for a [`Ticker`].
#[derive(Debug, Clone)]
pub struct TickerStop {
    stop: Arc<StopSignal>,
}

impl TickerStop {
    /// Stops the ticker. Returns `true` on the first call.
    pub fn stop(&self) -> bool {
        self.stop.stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{system_clock, Clock, ManualClock};

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_at_deadline() {
        let clock = system_clock();
        let start = clock.now();
        let timer = Timer::new(clock.clone(), Duration::from_millis(50));
        assert!(timer.wait().await);
        assert!(clock.now() - start >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_timer_stop_before_wait() {
        let timer = Timer::new(ManualClock::new(), Duration::from_secs(60));
        assert!(timer.stop());
        assert!(!timer.stop());
        assert!(!timer.wait().await);
    }

    #[tokio::test]
    async fn test_timer_stop_wakes_waiter() {
        let clock = ManualClock::new();
        let timer = Timer::new(clock.clone(), Duration::from_secs(60));
        let waiter = timer.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        tokio::task::yield_now().await;
        timer.stop();
        assert!(!handle.await.unwrap());
        assert_eq!(clock.pending_sleepers(), 0);
    }

    #[test]
    fn test_ticker_rejects_zero_period() {
        let err = Ticker::new(ManualClock::new(), Duration::ZERO).unwrap_err();
        assert_eq!(err.field, "period");
    }

    #[tokio::test]
    async fn test_ticker_ticks_each_period() {
        let clock = ManualClock::new();
        let start = clock.now();
        let mut ticker = Ticker::new(clock.clone(), Duration::from_secs(1)).unwrap();

        let tick = tokio::spawn(async move {
            let first = ticker.tick().await;
            let second = ticker.tick().await;
            (first, second)
        });

        for _ in 0..2 {
            while clock.pending_sleepers() == 0 {
                tokio::task::yield_now().await;
            }
            clock.advance(Duration::from_secs(1));
        }

        let (first, second) = tick.await.unwrap();
        assert_eq!(first.unwrap() - start, Duration::from_secs(1));
        assert_eq!(second.unwrap() - start, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_stop_ends_sequence() {
        let mut ticker = Ticker::new(system_clock(), Duration::from_millis(10)).unwrap();
        assert!(ticker.tick().await.is_some());
        ticker.stopper().stop();
        assert!(ticker.tick().await.is_none());
    }
}
