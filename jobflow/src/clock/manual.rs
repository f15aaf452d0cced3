//! Hand-driven clock for deterministic tests.

use super::{Clock, Instant};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// A sleeper waiting for the clock to reach its deadline.
#[derive(Debug)]
struct Sleeper {
    deadline: Instant,
    wake: oneshot::Sender<()>,
}

#[derive(Debug)]
struct ManualState {
    now: Instant,
    sleepers: Vec<Sleeper>,
}

/// A clock that only moves when [`advance`](Self::advance) or
/// [`set`](Self::set) is called.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

impl ManualClock {
    /// Creates a manual clock starting at the current instant.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::starting_at(Instant::now())
    }

    /// Creates a manual clock starting at `start`.
    #[must_use]
    pub fn starting_at(start: Instant) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ManualState {
                now: start,
                sleepers: Vec::new(),
            }),
        })
    }

    /// Moves the clock forward and wakes every sleeper whose deadline passed.
    pub fn advance(&self, by: Duration) {
        let due = {
            let mut state = self.state.lock();
            state.now += by;
            Self::take_due(&mut state)
        };
        for sleeper in due {
            let _ = sleeper.wake.send(());
        }
    }

    /// Moves the clock to `to`. Instants earlier than now are ignored.
    pub fn set(&self, to: Instant) {
        let due = {
            let mut state = self.state.lock();
            if to > state.now {
                state.now = to;
            }
            Self::take_due(&mut state)
        };
        for sleeper in due {
            let _ = sleeper.wake.send(());
        }
    }

    /// Returns the number of live sleepers still waiting.
    #[must_use]
    pub fn pending_sleepers(&self) -> usize {
        let mut state = self.state.lock();
        state.sleepers.retain(|s| !s.wake.is_closed());
        state.sleepers.len()
    }

    fn take_due(state: &mut ManualState) -> Vec<Sleeper> {
        let now = state.now;
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.sleepers)
            .into_iter()
            .filter(|s| !s.wake.is_closed())
            .partition(|s| s.deadline <= now);
        state.sleepers = waiting;
        due
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.state.lock().now
    }

    fn sleep_until(&self, deadline: Instant) -> BoxFuture<'static, ()> {
        let mut state = self.state.lock();
        if deadline <= state.now {
            return Box::pin(futures::future::ready(()));
        }
        // Abandoned sleepers are dropped here so cancelled waits release their slot.
        state.sleepers.retain(|s| !s.wake.is_closed());
        let (wake, woken) = oneshot::channel();
        state.sleepers.push(Sleeper { deadline, wake });
        Box::pin(async move {
            let _ = woken.await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[tokio::test]
    async fn test_now_only_moves_on_advance() {
        let clock = ManualClock::new();
        let start = clock.now();
        tokio::task::yield_now().await;
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now() - start, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_sleep_wakes_when_deadline_reached() {
        let clock = ManualClock::new();
        let mut sleep = clock.sleep(Duration::from_millis(100));

        assert!((&mut sleep).now_or_never().is_none());
        clock.advance(Duration::from_millis(99));
        assert!((&mut sleep).now_or_never().is_none());
        clock.advance(Duration::from_millis(1));
        assert!(sleep.now_or_never().is_some());
    }

    #[tokio::test]
    async fn test_dropped_sleepers_are_released() {
        let clock = ManualClock::new();
        let first = clock.sleep(Duration::from_secs(1));
        let _second = clock.sleep(Duration::from_secs(2));
        assert_eq!(clock.pending_sleepers(), 2);

        drop(first);
        assert_eq!(clock.pending_sleepers(), 1);
    }

    #[tokio::test]
    async fn test_set_ignores_past_instants() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(3));
        clock.set(start);
        assert_eq!(clock.now() - start, Duration::from_secs(3));
    }
}
