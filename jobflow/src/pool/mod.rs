//! Worker pool.
//!
//! This module provides:
//! - [`Pool`], a fixed or autoscaled set of workers fed by bounded queues
//! - [`Job`] and [`JobResult`], the units that go in and come out
//! - [`JobHandler`], the trait user code implements
//! - graceful shutdown with a grace period, reported as a [`ShutdownReport`]
//!
//! Every accepted job yields exactly one [`JobResult`] on the results
//! queue, whether it succeeded, failed, panicked or was skipped.
//!
//! # Example
//!
//! ```rust,ignore
//! use jobflow::prelude::*;
//!
//! let pool = Pool::new(
//!     PoolConfig::new("squares", 4),
//!     handler_fn(|x: u64, _ctx| async move { Ok::<_, TransformError>(x * x) }),
//! )?;
//! pool.start(&Scope::background())?;
//! pool.submit(Job::new(7), &Scope::background()).await?;
//! let results = pool.results();
//! let report = pool.shutdown(Duration::from_secs(5)).await?;
//! ```

mod config;
mod coordinator;
mod handler;
mod job;
mod scaling;
mod worker;


pub use config::{PoolConfig, ScalingConfig};
pub use coordinator::ShutdownReport;
pub use handler::{handler_fn, FnHandler, JobContext, JobHandler};
pub use job::{FailureKind, Job, JobId, JobResult, Outcome, SkipReason};
pub use scaling::ScaleController;
pub use worker::{PanicHook, PanicReport};

use crate::cancellation::{Scope, ScopeError, TaskGroup};
use crate::clock::SharedClock;
use crate::errors::{ConfigError, JobflowError, Result};
use crate::events::{noop_sink, SharedEventSink, POOL_STARTED};
use crate::metrics::{MetricsRecorder, MetricsSnapshot};
use crate::queue::{Queue, QueueReceiver, SendError, TrySendError};
use crate::throttle::RateLimiter;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;
use worker::{EnvParts, WorkerEnv};

/// Lifecycle of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    /// Created, accepting submissions, no workers yet.
    New,
    /// Workers running.
    Running,
    /// Input closed, finishing queued work.
    Draining,
    /// Every worker has exited and every result has been emitted.
    Stopped,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::New => "new",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        })
    }
}

/// A submission the pool did not accept. The job is handed back.
#[derive(PartialEq, Eq, Error)]
pub enum SubmitError<J> {
    /// The pool is draining or stopped.
    #[error("pool is shutting down")]
    ShuttingDown(Job<J>),
    /// The input queue had no room (non-blocking submit only).
    #[error("input queue full")]
    Full(Job<J>),
    /// The caller's scope ended while waiting for room.
    #[error("submit interrupted: {1}")]
    Cancelled(Job<J>, ScopeError),
}

impl<J> SubmitError<J> {
    /// Returns the rejected job.
    pub fn into_job(self) -> Job<J> {
        match self {
            Self::ShuttingDown(job) | Self::Full(job) | Self::Cancelled(job, _) => job,
        }
    }
}

impl<J> fmt::Debug for SubmitError<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShuttingDown(job) => write!(f, "ShuttingDown({})", job.id),
            Self::Full(job) => write!(f, "Full({})", job.id),
            Self::Cancelled(job, cause) => write!(f, "Cancelled({}, {cause:?})", job.id),
        }
    }
}

impl<J> From<SubmitError<J>> for JobflowError {
    fn from(err: SubmitError<J>) -> Self {
        match err {
            SubmitError::ShuttingDown(_) => Self::ShuttingDown,
            SubmitError::Full(job) => Self::resource_exhausted(format!("input queue full, job {}", job.id)),
            SubmitError::Cancelled(_, cause) => Self::Scope(cause),
        }
    }
}

/// A pool of workers running a [`JobHandler`].
///
/// Jobs may be submitted before [`start`](Self::start); they wait in the
/// input queues. Results must be drained from [`results`](Self::results)
/// for workers to make progress.
pub struct Pool<J, R> {
    name: Arc<str>,
    config: PoolConfig,
    handler: Arc<dyn JobHandler<J, R>>,
    clock: Option<SharedClock>,
    events: SharedEventSink,
    on_panic: Option<PanicHook>,
    /// One queue per priority class, lowest class first.
    queues: Vec<Queue<Job<J>>>,
    results: Queue<JobResult<R>>,
    metrics: Arc<MetricsRecorder>,
    state: Arc<watch::Sender<PoolState>>,
    stopped: Arc<watch::Sender<Option<ShutdownReport>>>,
    drain: watch::Sender<Option<Duration>>,
    env: Mutex<Option<Arc<WorkerEnv<J, R>>>>,
}

impl<J, R> Pool<J, R>
where
    J: Clone + Send + 'static,
    R: Send + 'static,
{
    /// Creates a pool.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field of `config`.
    pub fn new(config: PoolConfig, handler: impl JobHandler<J, R> + 'static) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let name: Arc<str> = Arc::from(config.name.as_str());
        let queues = (0..config.priority_classes)
            .map(|_| Queue::bounded(config.input_capacity))
            .collect();
        let (state, _) = watch::channel(PoolState::New);
        let (stopped, _) = watch::channel(None);
        let (drain, _) = watch::channel(None);

        Ok(Self {
            metrics: Arc::new(MetricsRecorder::new(name.to_string())),
            results: Queue::bounded(config.result_capacity),
            name,
            handler: Arc::new(handler),
            clock: None,
            events: noop_sink(),
            on_panic: None,
            queues,
            state: Arc::new(state),
            stopped: Arc::new(stopped),
            drain,
            env: Mutex::new(None),
            config,
        })
    }

    /// Uses `clock` for rate limiting, batching, grace periods and
    /// autoscaling instead of the clock of the scope passed to
    /// [`start`](Self::start).
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sends lifecycle events to `events`.
    #[must_use]
    pub fn with_event_sink(mut self, events: SharedEventSink) -> Self {
        self.events = events;
        self
    }

    /// Calls `hook` for every recovered handler panic.
    #[must_use]
    pub fn on_panic(mut self, hook: impl Fn(&PanicReport) + Send + Sync + 'static) -> Self {
        self.on_panic = Some(Arc::new(hook));
        self
    }

    /// Returns the pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Starts `min_workers` workers under a child of `scope`.
    ///
    /// Cancelling `scope` stops the pool: queued jobs are reported as
    /// skipped and in-flight jobs observe the cancellation.
    ///
    /// # Errors
    ///
    /// Fails with [`JobflowError::InvalidState`] if already started, or
    /// [`JobflowError::ResourceExhausted`] outside a tokio runtime.
    pub fn start(&self, scope: &Scope) -> Result<()> {
        let mut slot = self.env.lock();
        let state = self.state();
        if slot.is_some() || state != PoolState::New {
            return Err(JobflowError::invalid_state(PoolState::New.to_string(), state));
        }

        let clock = self.clock.clone().unwrap_or_else(|| scope.clock().clone());
        let (pool_scope, cancel) = scope.with_cancel();
        let group = TaskGroup::new(&pool_scope)?;
        let limiter = match self.config.rate_limit {
            Some(rate) => Some(RateLimiter::start(rate, clock.clone(), &pool_scope)?),
            None => None,
        };

        let parts = EnvParts {
            name: self.name.clone(),
            config: self.config.clone(),
            handler: self.handler.clone(),
            queues: self.queues.clone(),
            results: self.results.clone(),
            metrics: self.metrics.clone(),
            clock,
            events: self.events.clone(),
            on_panic: self.on_panic.clone(),
            state: self.state.clone(),
            stopped: self.stopped.clone(),
        };
        let env = Arc::new(WorkerEnv::new(parts, pool_scope, cancel, group, limiter));
        for _ in 0..self.config.min_workers {
            env.spawn_worker();
        }
        self.state.send_replace(PoolState::Running);

        info!(
            pool = %self.name,
            workers = self.config.min_workers,
            max_workers = self.config.max_workers,
            priority_classes = self.config.priority_classes,
            "Pool started"
        );
        self.events.try_emit(
            POOL_STARTED,
            Some(json!({ "pool": &*self.name, "workers": self.config.min_workers })),
        );

        let runtime = env.group.runtime().clone();
        runtime.spawn(coordinator::coordinate(Arc::clone(&env), self.drain.subscribe()));
        *slot = Some(env);
        Ok(())
    }

    /// Submits a job, waiting for room in its input queue.
    ///
    /// # Errors
    ///
    /// Hands the job back if the pool is shutting down or `scope` ends
    /// first.
    pub async fn submit(&self, job: Job<J>, scope: &Scope) -> std::result::Result<(), SubmitError<J>> {
        if !self.accepting() {
            return Err(SubmitError::ShuttingDown(job));
        }
        let queue = &self.queues[self.class_of(job.priority)];
        self.metrics.record_submitted();
        match queue.send(job, scope).await {
            Ok(()) => Ok(()),
            Err(SendError::Closed(job)) => {
                self.metrics.rollback_submitted();
                Err(SubmitError::ShuttingDown(job))
            }
            Err(SendError::Cancelled(job, cause)) => {
                self.metrics.rollback_submitted();
                Err(SubmitError::Cancelled(job, cause))
            }
        }
    }

    /// Submits a job without waiting.
    ///
    /// # Errors
    ///
    /// Hands the job back if the pool is shutting down or its input queue
    /// is full.
    pub fn try_submit(&self, job: Job<J>) -> std::result::Result<(), SubmitError<J>> {
        if !self.accepting() {
            return Err(SubmitError::ShuttingDown(job));
        }
        let queue = &self.queues[self.class_of(job.priority)];
        self.metrics.record_submitted();
        queue.try_send(job).map_err(|err| {
            self.metrics.rollback_submitted();
            match err {
                TrySendError::Full(job) => SubmitError::Full(job),
                TrySendError::Closed(job) => SubmitError::ShuttingDown(job),
            }
        })
    }

    /// Returns the results queue. It closes once the pool has stopped and
    /// every result has been sent.
    #[must_use]
    pub fn results(&self) -> QueueReceiver<JobResult<R>> {
        self.results.receiver()
    }

    /// Changes the number of workers. Workers removed finish their current
    /// job first. Returns the previous count.
    ///
    /// # Errors
    ///
    /// Fails with [`JobflowError::Config`] if `workers` is outside
    /// `[min_workers, max_workers]`, or [`JobflowError::InvalidState`] if
    /// the pool is not running.
    pub fn resize(&self, workers: usize) -> Result<usize> {
        if workers < self.config.min_workers || workers > self.config.max_workers {
            return Err(ConfigError::new(
                "workers",
                format!(
                    "must be between {} and {}, got {workers}",
                    self.config.min_workers, self.config.max_workers
                ),
            )
            .into());
        }
        let env = self.running_env()?;
        let state = self.state();
        if state != PoolState::Running {
            return Err(JobflowError::invalid_state(PoolState::Running.to_string(), state));
        }
        Ok(env.resize_to(workers))
    }

    /// Stops accepting jobs and starts draining without waiting.
    /// Repeated calls keep the first grace period.
    ///
    /// # Errors
    ///
    /// Fails with [`JobflowError::InvalidState`] if the pool was never
    /// started.
    pub fn request_shutdown(&self, grace: Duration) -> Result<()> {
        let env = self.running_env()?;
        env.begin_draining();
        self.drain.send_if_modified(|requested| {
            if requested.is_none() {
                *requested = Some(grace);
                true
            } else {
                false
            }
        });
        Ok(())
    }

    /// Drains the pool, waiting up to `grace` for queued and in-flight jobs
    /// before cancelling them, and returns once every worker has exited.
    ///
    /// # Errors
    ///
    /// Fails with [`JobflowError::InvalidState`] if the pool was never
    /// started.
    pub async fn shutdown(&self, grace: Duration) -> Result<ShutdownReport> {
        self.request_shutdown(grace)?;
        self.stopped().await
    }

    /// Waits until the pool has stopped, however the stop was triggered.
    ///
    /// # Errors
    ///
    /// Fails with [`JobflowError::InvalidState`] if the pool was never
    /// started.
    pub async fn stopped(&self) -> Result<ShutdownReport> {
        self.running_env()?;
        let mut rx = self.stopped.subscribe();
        let report = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| JobflowError::invalid_state("shutdown report", "coordinator gone"))?;
        report
            .as_ref()
            .cloned()
            .ok_or_else(|| JobflowError::invalid_state("shutdown report", "missing"))
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> PoolState {
        *self.state.borrow()
    }

    /// Returns a consistent metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.queues.iter().map(Queue::len).sum())
    }

    /// Returns the number of running workers, including retiring workers
    /// still finishing a job.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.metrics.active_workers()
    }

    fn accepting(&self) -> bool {
        matches!(self.state(), PoolState::New | PoolState::Running)
    }

    /// Maps a job priority to its queue. Higher priorities are served
    /// first; `None` shares the lowest class, and priorities beyond the
    /// configured classes share the highest.
    fn class_of(&self, priority: Option<u8>) -> usize {
        let top = self.queues.len() - 1;
        priority.map_or(0, |p| usize::from(p).min(top))
    }

    fn running_env(&self) -> Result<Arc<WorkerEnv<J, R>>> {
        self.env
            .lock()
            .clone()
            .ok_or_else(|| JobflowError::invalid_state("started", PoolState::New))
    }
}

impl<J, R> fmt::Debug for Pool<J, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("state", &*self.state.borrow())
            .field("workers", &self.metrics.active_workers())
            .finish()
    }
}
