//! Lifecycle events.
//!
//! Pools and pipelines report state changes to an [`EventSink`] using the
//! names below. Payloads are small JSON objects.

mod sink;

#[cfg(test)]
pub use sink::MockEventSink;
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink, SharedEventSink};

use std::sync::Arc;

/// A pool started its workers.
pub const POOL_STARTED: &str = "pool.started";
/// A pool entered draining.
pub const POOL_DRAINING: &str = "pool.draining";
/// A pool stopped and closed its results.
pub const POOL_STOPPED: &str = "pool.stopped";
/// A pool changed its worker count.
pub const POOL_RESIZED: &str = "pool.resized";
/// A transform panicked and was recovered.
pub const WORKER_PANICKED: &str = "worker.panicked";
/// A worker exited after repeated panics and was replaced.
pub const WORKER_REPLACED: &str = "worker.replaced";
/// A pipeline stage closed its output.
pub const STAGE_CLOSED: &str = "stage.closed";
/// A halt-on-error stage cancelled its pipeline.
pub const PIPELINE_HALTED: &str = "pipeline.halted";
/// Every stage of a pipeline finished.
pub const PIPELINE_COMPLETED: &str = "pipeline.completed";

pub(crate) fn is_warning(event_type: &str) -> bool {
    event_type == WORKER_PANICKED || event_type == WORKER_REPLACED || event_type == PIPELINE_HALTED
}

/// Returns the default sink.
#[must_use]
pub fn noop_sink() -> SharedEventSink {
    Arc::new(NoOpEventSink)
}
