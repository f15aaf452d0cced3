//! Subscriber setup and service-time measurement.

use crate::clock::{Instant, SharedClock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Output format for [`init_tracing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Installs a global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG` when set, otherwise from
/// `default_filter` (for example `"jobflow=info"`). Returns `true` if this
/// call installed the subscriber and `false` if one was already installed,
/// so calling it more than once is harmless.
pub fn init_tracing(format: LogFormat, default_filter: &str) -> bool {
    if TRACING_INITIALIZED.swap(true, Ordering::SeqCst) {
        return false;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init(),
    };
    installed.is_ok()
}

/// Measures elapsed time against an injected clock.
#[derive(Debug)]
pub struct SpanTimer {
    clock: SharedClock,
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a timer named `name`.
    #[must_use]
    pub fn start(clock: SharedClock, name: impl Into<String>) -> Self {
        let start = clock.now();
        Self {
            clock,
            start,
            name: name.into(),
        }
    }

    /// Returns the instant the timer started.
    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.start
    }

    /// Returns the time elapsed so far.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.start)
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the timer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops the timer and returns the elapsed time.
    #[must_use]
    pub fn finish(self) -> Duration {
        self.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_span_timer_uses_injected_clock() {
        let clock = ManualClock::new();
        let timer = SpanTimer::start(clock.clone(), "job");
        assert_eq!(timer.elapsed(), Duration::ZERO);

        clock.advance(Duration::from_millis(250));
        assert_eq!(timer.name(), "job");
        assert!((timer.elapsed_ms() - 250.0).abs() < 1e-9);
        assert_eq!(timer.finish(), Duration::from_millis(250));
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        let first = init_tracing(LogFormat::Json, "jobflow=debug");
        assert!(!init_tracing(LogFormat::Pretty, "jobflow=debug"));
        // Another test binary may already own the global subscriber.
        let _ = first;
    }
}
