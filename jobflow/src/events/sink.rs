//! Event sink trait and implementations.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn, Level};

/// Receives lifecycle events from pools and pipelines.
///
/// Runtime code only calls [`try_emit`](Self::try_emit), which must never
/// block or panic; sinks that need to do I/O should hand the event off.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    ///
    /// # Arguments
    ///
    /// * `event_type` - One of the names in [`crate::events`], e.g. `pool.started`
    /// * `data` - Optional event payload
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>);

    /// Emits an event without blocking. Failures are swallowed.
    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>);
}

/// A sink shared between a pool or pipeline and its workers.
pub type SharedEventSink = Arc<dyn EventSink>;

/// A sink that discards every event. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}
}

/// A sink that writes events through `tracing`.
///
/// Panic and halt events are always logged at warn; everything else at the
/// configured level.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging at `level`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event_type: &str, data: Option<&serde_json::Value>) {
        if super::is_warning(event_type) {
            warn!(event_type, event_data = ?data, "Event: {}", event_type);
        } else if self.level == Level::DEBUG || self.level == Level::TRACE {
            debug!(event_type, event_data = ?data, "Event: {}", event_type);
        } else {
            info!(event_type, event_data = ?data, "Event: {}", event_type);
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log_event(event_type, data.as_ref());
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log_event(event_type, data.as_ref());
    }
}

/// A sink that keeps every event in memory, for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<(String, Option<serde_json::Value>)>>,
}

impl CollectingEventSink {
    /// Creates an empty collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<serde_json::Value>)> {
        self.events.read().clone()
    }

    /// Returns the collected event names in emission order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.events.read().iter().map(|(name, _)| name.clone()).collect()
    }

    /// Returns the number of events named `event_type`.
    #[must_use]
    pub fn count(&self, event_type: &str) -> usize {
        self.events.read().iter().filter(|(t, _)| t == event_type).count()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing has been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Returns events whose name starts with `prefix`.
    #[must_use]
    pub fn events_of_type(&self, prefix: &str) -> Vec<(String, Option<serde_json::Value>)> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.try_emit(event_type, data);
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{POOL_STARTED, WORKER_PANICKED};

    #[tokio::test]
    async fn test_noop_and_logging_sinks_accept_events() {
        NoOpEventSink.emit(POOL_STARTED, None).await;
        let sink = LoggingEventSink::debug();
        sink.emit(POOL_STARTED, Some(serde_json::json!({"workers": 2}))).await;
        sink.try_emit(WORKER_PANICKED, None);
    }

    #[tokio::test]
    async fn test_collecting_sink_keeps_order() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit("pool.started", None).await;
        sink.try_emit("worker.panicked", Some(serde_json::json!({"worker_id": 1})));
        sink.try_emit("pool.stopped", None);

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.names(), vec!["pool.started", "worker.panicked", "pool.stopped"]);
        assert_eq!(sink.events_of_type("pool.").len(), 2);
        assert_eq!(sink.count("worker.panicked"), 1);
    }

    #[test]
    fn test_mock_sink_expectations() {
        let mut mock = MockEventSink::new();
        mock.expect_try_emit()
            .withf(|name, _| name.to_string() == POOL_STARTED)
            .times(1)
            .return_const(());
        mock.try_emit(POOL_STARTED, None);
    }
}
