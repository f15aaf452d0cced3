//! # Jobflow
//!
//! Concurrent job processing on tokio.
//!
//! Jobflow provides the building blocks for running user work with bounded
//! memory and predictable shutdown:
//!
//! - **Cancellation scopes**: a tree of scopes carrying cancellation,
//!   deadlines and typed values, with task groups that live and die with them
//! - **Channel fabric**: bounded queues with explicit close, select over
//!   several queues, and merge, dispatch and broadcast operators
//! - **Pipelines**: stages connected by bounded queues, with per-stage
//!   worker counts, error policies, batching and rate limiting
//! - **Worker pools**: priority dispatch, panic isolation, autoscaling and
//!   graceful shutdown that accounts for every accepted job
//! - **Clocks**: a swappable time source so tests control time
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use jobflow::prelude::*;
//!
//! let pool = Pool::new(
//!     PoolConfig::new("squares", 4),
//!     handler_fn(|x: u64, _ctx| async move { Ok::<_, TransformError>(x * x) }),
//! )?;
//! let results = pool.results();
//! pool.start(&Scope::background())?;
//!
//! for x in 1..=100 {
//!     pool.submit(Job::new(x), &Scope::background()).await?;
//! }
//! let report = pool.shutdown(Duration::from_secs(5)).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod clock;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod observability;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod testing;
pub mod throttle;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{run_guarded, CancelHandle, Guarded, Scope, ScopeError, ScopeKey, TaskGroup};
    pub use crate::clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock, Ticker, Timer};
    pub use crate::errors::{ConfigError, JobflowError, Result, TransformError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink, SharedEventSink};
    pub use crate::metrics::{MetricsRecorder, MetricsSnapshot};
    pub use crate::observability::{init_tracing, LogFormat, SpanTimer};
    pub use crate::pipeline::{
        from_fn, ErrorPolicy, Pipeline, PipelineBuilder, PipelineReport, RetryConfig, StageContext, StageError,
        StageOptions, StageOutcome, Transform,
    };
    pub use crate::pool::{
        handler_fn, FailureKind, Job, JobContext, JobHandler, JobId, JobResult, Outcome, Pool, PoolConfig,
        PoolState, ScalingConfig, ShutdownReport, SkipReason, SubmitError,
    };
    pub use crate::queue::{
        broadcast, dispatch, merge, recv_any, send_any, Queue, QueueReceiver, RecvError, Select, Selected,
        SendError, SlowConsumerPolicy,
    };
    pub use crate::throttle::RateLimiter;
    pub use std::time::Duration;
}

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    #[tokio::test]
    async fn test_prelude_covers_quick_start() {
        let pool = Pool::new(
            PoolConfig::new("squares", 2),
            handler_fn(|x: u64, _ctx| async move { Ok::<_, TransformError>(x * x) }),
        )
        .unwrap();
        let results = pool.results();
        pool.start(&Scope::background()).unwrap();
        for x in 1..=4 {
            pool.submit(Job::new(x), &Scope::background()).await.unwrap();
        }
        let report = pool.shutdown(Duration::from_secs(1)).await.unwrap();

        let mut values: Vec<u64> = results.recv_all().await.iter().filter_map(|r| r.value().copied()).collect();
        values.sort_unstable();
        assert_eq!(values, vec![1, 4, 9, 16]);
        assert_eq!(report.metrics.processed, 4);
    }
}
