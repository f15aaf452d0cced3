//! Monotonic time sources, timers and tickers.
//!
//! Everything in the runtime that waits on time goes through a [`Clock`],
//! so tests can swap the tokio-backed [`SystemClock`] for a
//! [`ManualClock`] that only moves when advanced by hand.

mod manual;
mod system;
mod timer;

pub use manual::ManualClock;
pub use system::SystemClock;
pub use timer::{Ticker, TickerStop, Timer};

use futures::future::BoxFuture;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Monotonic instant used across the runtime.
pub type Instant = tokio::time::Instant;

/// A clock shared between scopes, queues and workers.
pub type SharedClock = Arc<dyn Clock>;

/// A monotonic time source.
///
/// `now()` never goes backwards. Sleep futures are cancelled by dropping
/// them, which releases whatever the clock holds for them.
pub trait Clock: Send + Sync + Debug {
    /// Returns the current instant.
    fn now(&self) -> Instant;

    /// Returns a future that resolves once `deadline` has been reached.
    fn sleep_until(&self, deadline: Instant) -> BoxFuture<'static, ()>;

    /// Returns a future that resolves after `duration`.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.sleep_until(self.now() + duration)
    }
}

/// Returns the default tokio-backed clock.
#[must_use]
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
