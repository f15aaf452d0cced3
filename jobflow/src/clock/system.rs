//! Clock backed by `tokio::time`.

use super::{Clock, Instant};
use futures::future::BoxFuture;

/// The production clock.
///
/// Uses tokio's timer wheel, so it follows tokio's paused time in tests
/// started with `start_paused = true`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&self, deadline: Instant) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep_until(deadline))
    }
}
