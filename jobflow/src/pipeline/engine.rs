//! Pipeline execution.
//!
//! Each stage runs its workers in a [`TaskGroup`] under the pipeline scope.
//! A per-stage closer waits for the group to quiesce and then closes the
//! stage's output, so end-of-stream flows downstream one stage at a time.
//! A supervisor waits for every closer, publishes the [`PipelineReport`]
//! and releases the pipeline scope.

use super::retry::{with_retry, AttemptError};
use super::stage::{ErrorPolicy, StageContext, StageError, StageOptions, StageOutcome, StageSpec, Transform};
use crate::cancellation::{run_guarded, CancelHandle, Guarded, Scope, ScopeError, TaskGroup};
use crate::clock::SharedClock;
use crate::errors::{JobflowError, Result, TransformError};
use crate::events::{SharedEventSink, PIPELINE_COMPLETED, PIPELINE_HALTED, STAGE_CLOSED, WORKER_PANICKED};
use crate::metrics::{Completion, MetricsRecorder, MetricsSnapshot};
use crate::observability::SpanTimer;
use crate::pool::SkipReason;
use crate::queue::{Queue, QueueReceiver, RecvError};
use crate::throttle::RateLimiter;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    /// Pipeline name.
    pub name: String,
    /// A halt-on-error stage stopped the pipeline.
    pub halted: bool,
    /// The pipeline scope was cancelled or timed out from outside.
    pub cancelled: Option<ScopeError>,
    /// Final metrics per stage, in stage order.
    pub stages: Vec<MetricsSnapshot>,
}

impl PipelineReport {
    /// Returns true if every stage drained its input normally.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !self.halted && self.cancelled.is_none()
    }
}

/// A stage wired to its queues.
struct StageRuntime<T> {
    name: Arc<str>,
    workers: usize,
    transform: Arc<dyn Transform<T>>,
    options: StageOptions,
    input: Queue<T>,
    output: Queue<T>,
    metrics: Arc<MetricsRecorder>,
}

struct Running {
    cancel: CancelHandle,
    clock: SharedClock,
}

/// A built pipeline. See [`PipelineBuilder`](super::PipelineBuilder).
pub struct Pipeline<T> {
    name: Arc<str>,
    stages: Vec<Arc<StageRuntime<T>>>,
    input: Queue<T>,
    output: Queue<T>,
    errors: Option<Queue<StageError>>,
    clock: Option<SharedClock>,
    events: SharedEventSink,
    halted: Arc<AtomicBool>,
    running: Mutex<Option<Running>>,
    report: Arc<watch::Sender<Option<PipelineReport>>>,
}

impl<T: Clone + Send + 'static> Pipeline<T> {
    pub(crate) fn new(
        name: String,
        specs: Vec<StageSpec<T>>,
        output_capacity: usize,
        error_capacity: Option<usize>,
        clock: Option<SharedClock>,
        events: SharedEventSink,
    ) -> Self {
        let name: Arc<str> = Arc::from(name);
        let output = Queue::bounded(output_capacity);
        let inputs: Vec<Queue<T>> = specs.iter().map(|s| Queue::bounded(s.capacity)).collect();

        let stages = specs
            .into_iter()
            .enumerate()
            .map(|(i, spec)| {
                let next = inputs.get(i + 1).cloned().unwrap_or_else(|| output.clone());
                Arc::new(StageRuntime {
                    metrics: Arc::new(MetricsRecorder::new(format!("{name}/{}", spec.name))),
                    name: spec.name,
                    workers: spec.workers,
                    transform: spec.transform,
                    options: spec.options,
                    input: inputs[i].clone(),
                    output: next,
                })
            })
            .collect();

        let (report, _) = watch::channel(None);
        Self {
            input: inputs[0].clone(),
            name,
            stages,
            output,
            errors: error_capacity.map(Queue::bounded),
            clock,
            events,
            halted: Arc::new(AtomicBool::new(false)),
            running: Mutex::new(None),
            report: Arc::new(report),
        }
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the stage names in order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| &*s.name).collect()
    }

    /// Returns the input queue. Close it to let the pipeline drain.
    #[must_use]
    pub fn input(&self) -> Queue<T> {
        self.input.clone()
    }

    /// Returns the output queue. It closes after the last stage finishes.
    #[must_use]
    pub fn output(&self) -> QueueReceiver<T> {
        self.output.receiver()
    }

    /// Returns the error queue, if one was configured.
    #[must_use]
    pub fn errors(&self) -> Option<QueueReceiver<StageError>> {
        self.errors.as_ref().map(Queue::receiver)
    }

    /// Starts every stage under a child of `scope`.
    ///
    /// Cancelling `scope` stops the pipeline; stages then close their
    /// outputs without draining.
    ///
    /// # Errors
    ///
    /// Fails with [`JobflowError::InvalidState`] if already started, or
    /// [`JobflowError::ResourceExhausted`] outside a tokio runtime.
    pub fn start(&self, scope: &Scope) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(JobflowError::invalid_state("not started", "started"));
        }

        let (pipeline_scope, cancel) = scope.with_cancel();
        let clock = self.clock.clone().unwrap_or_else(|| scope.clock().clone());
        let closers = TaskGroup::new(&pipeline_scope)?;

        for stage in &self.stages {
            let group = TaskGroup::new(&pipeline_scope)?;
            let limiter = match stage.options.rate_limit {
                Some(rate) => Some(RateLimiter::start(rate, clock.clone(), group.scope())?),
                None => None,
            };

            for worker_id in 0..stage.workers {
                let worker = StageWorker {
                    pipeline: self.name.clone(),
                    stage: stage.clone(),
                    worker_id,
                    limiter: limiter.clone(),
                    clock: clock.clone(),
                    errors: self.errors.clone(),
                    halt: cancel.clone(),
                    halted: self.halted.clone(),
                    events: self.events.clone(),
                };
                group.spawn(format!("{}-{worker_id}", stage.name), move |scope| worker.run(scope));
            }
            info!(
                pipeline = %self.name,
                stage = %stage.name,
                workers = stage.workers,
                "Stage started"
            );

            let stage = stage.clone();
            let pipeline = self.name.clone();
            let events = self.events.clone();
            closers.spawn(format!("{}-closer", stage.name), move |_| async move {
                group.wait().await;
                group.cancel_all();
                drop(limiter);
                stage.output.close();
                for failure in group.failures() {
                    warn!(pipeline = %pipeline, stage = %stage.name, task = %failure.name, "Stage worker died: {}", failure.message);
                }
                info!(pipeline = %pipeline, stage = %stage.name, "Stage closed");
                events.try_emit(
                    STAGE_CLOSED,
                    Some(json!({ "pipeline": &*pipeline, "stage": &*stage.name })),
                );
            });
        }

        let supervisor = Supervisor {
            name: self.name.clone(),
            stages: self.stages.clone(),
            input: self.input.clone(),
            errors: self.errors.clone(),
            halted: self.halted.clone(),
            events: self.events.clone(),
            report: self.report.clone(),
        };
        let runtime = closers.runtime().clone();
        let cleanup = cancel.clone();
        runtime.spawn(async move {
            closers.wait().await;
            supervisor.finish(&pipeline_scope);
            cleanup.cancel();
        });

        *running = Some(Running { cancel, clock });
        info!(pipeline = %self.name, stages = self.stages.len(), "Pipeline started");
        Ok(())
    }

    /// Waits until every stage has finished.
    ///
    /// # Errors
    ///
    /// Fails with [`JobflowError::InvalidState`] if the pipeline was never
    /// started.
    pub async fn wait(&self) -> Result<PipelineReport> {
        if self.running.lock().is_none() {
            return Err(JobflowError::invalid_state("started", "not started"));
        }
        let mut rx = self.report.subscribe();
        let report = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| JobflowError::invalid_state("report", "supervisor gone"))?;
        report
            .as_ref()
            .cloned()
            .ok_or_else(|| JobflowError::invalid_state("report", "missing"))
    }

    /// Closes the input and waits up to `grace` for the stages to drain,
    /// then cancels whatever is still running.
    ///
    /// # Errors
    ///
    /// Fails with [`JobflowError::InvalidState`] if the pipeline was never
    /// started.
    pub async fn shutdown(&self, grace: Duration) -> Result<PipelineReport> {
        let (cancel, clock) = {
            let running = self.running.lock();
            let running = running
                .as_ref()
                .ok_or_else(|| JobflowError::invalid_state("started", "not started"))?;
            (running.cancel.clone(), running.clock.clone())
        };
        self.input.close();

        tokio::select! {
            report = self.wait() => report,
            () = clock.sleep(grace) => {
                warn!(pipeline = %self.name, grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX), "Pipeline did not drain in time, cancelling");
                cancel.cancel_with(ScopeError::DeadlineExceeded);
                self.wait().await
            }
        }
    }

    /// Cancels the pipeline without draining.
    pub fn cancel(&self) {
        if let Some(running) = self.running.lock().as_ref() {
            running.cancel.cancel();
        }
    }

    /// Returns true once every stage has finished.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.report.borrow().is_some()
    }

    /// Returns a metrics snapshot per stage, in stage order.
    #[must_use]
    pub fn metrics(&self) -> Vec<MetricsSnapshot> {
        self.stages
            .iter()
            .map(|s| s.metrics.snapshot(s.input.len()))
            .collect()
    }
}

impl<T> std::fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("stages", &self.stages.len())
            .field("started", &self.running.lock().is_some())
            .field("done", &self.report.borrow().is_some())
            .finish()
    }
}

struct Supervisor<T> {
    name: Arc<str>,
    stages: Vec<Arc<StageRuntime<T>>>,
    input: Queue<T>,
    errors: Option<Queue<StageError>>,
    halted: Arc<AtomicBool>,
    events: SharedEventSink,
    report: Arc<watch::Sender<Option<PipelineReport>>>,
}

impl<T> Supervisor<T> {
    fn finish(&self, scope: &Scope) {
        let halted = self.halted.load(Ordering::SeqCst);
        let cancelled = if halted { None } else { scope.err() };

        self.input.close();
        if let Some(errors) = &self.errors {
            errors.close();
        }

        let report = PipelineReport {
            name: self.name.to_string(),
            halted,
            cancelled,
            stages: self
                .stages
                .iter()
                .map(|s| s.metrics.snapshot(s.input.len()))
                .collect(),
        };
        info!(
            pipeline = %self.name,
            halted,
            cancelled = ?cancelled,
            "Pipeline completed"
        );
        self.events.try_emit(
            PIPELINE_COMPLETED,
            Some(json!({
                "pipeline": &*self.name,
                "halted": halted,
                "cancelled": cancelled.map(|c| c.to_string()),
            })),
        );
        self.report.send_replace(Some(report));
    }
}

/// What a successful attempt returned.
enum Produced<T> {
    Items(Vec<T>),
    Declined(String),
}

struct StageWorker<T> {
    pipeline: Arc<str>,
    stage: Arc<StageRuntime<T>>,
    worker_id: usize,
    limiter: Option<Arc<RateLimiter>>,
    clock: SharedClock,
    errors: Option<Queue<StageError>>,
    halt: CancelHandle,
    halted: Arc<AtomicBool>,
    events: SharedEventSink,
}

impl<T: Clone + Send + 'static> StageWorker<T> {
    async fn run(self, scope: Scope) {
        self.stage.metrics.worker_started(self.worker_id);
        debug!(stage = %self.stage.name, worker_id = self.worker_id, "Stage worker started");

        while let Some(unit) = self.next_unit(&scope).await {
            if !self.process(unit, &scope).await {
                break;
            }
        }

        self.stage.metrics.worker_stopped(self.worker_id);
        debug!(stage = %self.stage.name, worker_id = self.worker_id, "Stage worker stopped");
    }

    /// Receives one item, or a batch when batching is enabled.
    ///
    /// A partial batch is returned when the input closes, the flush
    /// interval passes or the scope is done; `process` accounts for it.
    /// Returns `None` once there is nothing left to do.
    async fn next_unit(&self, scope: &Scope) -> Option<Vec<T>> {
        let first = self.stage.input.recv(scope).await.ok()?;
        let Some(size) = self.stage.options.batch_size else {
            return Some(vec![first]);
        };

        let mut batch = Vec::with_capacity(size);
        batch.push(first);
        let flush_at = self.stage.options.batch_flush.map(|d| self.clock.now() + d);

        while batch.len() < size {
            let next = match flush_at {
                Some(deadline) => tokio::select! {
                    biased;
                    next = self.stage.input.recv(scope) => next,
                    () = self.clock.sleep_until(deadline) => break,
                },
                None => self.stage.input.recv(scope).await,
            };
            match next {
                Ok(item) => batch.push(item),
                Err(RecvError::Closed) => break,
                Err(RecvError::Cancelled(cause)) => {
                    debug!(
                        stage = %self.stage.name,
                        worker_id = self.worker_id,
                        pending = batch.len(),
                        %cause,
                        "Batch collection interrupted"
                    );
                    break;
                }
            }
        }
        Some(batch)
    }

    /// Runs one unit through the transform. Returns false when the worker
    /// should stop.
    async fn process(&self, unit: Vec<T>, scope: &Scope) -> bool {
        let count = unit.len();
        let metrics = &self.stage.metrics;
        for _ in 0..count {
            metrics.record_submitted();
        }
        metrics.record_started(count as u64);
        let timer = SpanTimer::start(self.clock.clone(), &*self.stage.name);

        if let Some(limiter) = &self.limiter {
            if limiter.acquire(scope).await.is_err() {
                self.finish(count, Completion::Skipped(SkipReason::Cancelled), timer.finish());
                return false;
            }
        }

        let (result, attempts) = match &self.stage.options.error_policy {
            ErrorPolicy::Retry(config) => {
                with_retry(config, &self.stage.name, scope, move |attempt| {
                    self.attempt(unit.clone(), attempt, scope)
                })
                .await
            }
            ErrorPolicy::Halt | ErrorPolicy::Skip => (self.attempt(unit, 1, scope).await, 1),
        };
        let elapsed = timer.finish();

        match result {
            Ok(Produced::Items(items)) => {
                self.finish(count, Completion::Processed, elapsed);
                for item in items {
                    if self.stage.output.send(item, scope).await.is_err() {
                        return false;
                    }
                }
                true
            }
            Ok(Produced::Declined(reason)) => {
                debug!(stage = %self.stage.name, worker_id = self.worker_id, %reason, "Item declined");
                self.finish(count, Completion::Skipped(SkipReason::Declined), elapsed);
                true
            }
            Err(AttemptError::Failed(error)) => {
                self.finish(count, Completion::Errored, elapsed);
                self.route(error, attempts, scope).await
            }
            Err(AttemptError::Interrupted(_)) => {
                self.finish(count, Completion::Skipped(SkipReason::Cancelled), elapsed);
                false
            }
        }
    }

    async fn attempt(&self, unit: Vec<T>, attempt: u32, scope: &Scope) -> std::result::Result<Produced<T>, AttemptError> {
        let timeout = self.stage.options.per_item_timeout;
        let (item_scope, _deadline) = match timeout {
            Some(timeout) => scope
                .with_timeout(timeout)
                .map(|(s, handle)| (s, Some(handle)))
                .map_err(|e| TransformError::new("resource-exhausted", e.to_string()))?,
            None => (scope.clone(), None),
        };
        let ctx = StageContext::new(self.stage.name.clone(), self.worker_id, attempt, item_scope.clone());
        let transform = &self.stage.transform;

        let outcome = if self.stage.options.batch_size.is_some() {
            run_guarded(transform.apply_batch(unit, &ctx), &item_scope).await
        } else {
            let Some(item) = unit.into_iter().next() else {
                return Ok(Produced::Items(Vec::new()));
            };
            run_guarded(transform.apply(item, &ctx), &item_scope).await
        };

        match outcome {
            Guarded::Completed(StageOutcome::Produce(items)) => Ok(Produced::Items(items)),
            Guarded::Completed(StageOutcome::Skip(reason)) => Ok(Produced::Declined(reason)),
            Guarded::Completed(StageOutcome::Error(error)) => Err(error.into()),
            Guarded::Panicked(message) => {
                warn!(
                    pipeline = %self.pipeline,
                    stage = %self.stage.name,
                    worker_id = self.worker_id,
                    %message,
                    "Transform panicked"
                );
                self.stage.metrics.record_panic(self.worker_id);
                self.events.try_emit(
                    WORKER_PANICKED,
                    Some(json!({
                        "pipeline": &*self.pipeline,
                        "stage": &*self.stage.name,
                        "worker_id": self.worker_id,
                        "message": message,
                    })),
                );
                Err(TransformError::panic(message).into())
            }
            Guarded::Interrupted(cause) => match scope.err() {
                Some(outer) => Err(AttemptError::Interrupted(outer)),
                None => Err(TransformError::timeout(format!("item exceeded {timeout:?} ({cause})")).into()),
            },
        }
    }

    fn finish(&self, count: usize, completion: Completion, elapsed: Duration) {
        let share = elapsed / u32::try_from(count.max(1)).unwrap_or(u32::MAX);
        for _ in 0..count {
            self.stage
                .metrics
                .record_finished(Some(self.worker_id), completion, share);
        }
    }

    /// Delivers a stage error and applies the halt policy. Returns false
    /// when the worker should stop.
    async fn route(&self, error: TransformError, attempts: u32, scope: &Scope) -> bool {
        let halt = matches!(self.stage.options.error_policy, ErrorPolicy::Halt);
        let err = StageError::new(&self.stage.name, self.worker_id, error, attempts);
        debug!(stage = %self.stage.name, worker_id = self.worker_id, attempts, error = %err, "Item failed");

        match &self.errors {
            Some(errors) => {
                if errors.send(err, scope).await.is_err() && !halt {
                    return false;
                }
            }
            None => warn!(pipeline = %self.pipeline, error = %err, "Stage error dropped, no error queue"),
        }

        if halt {
            if !self.halted.swap(true, Ordering::SeqCst) {
                warn!(pipeline = %self.pipeline, stage = %self.stage.name, "Halting pipeline on error");
                self.events.try_emit(
                    PIPELINE_HALTED,
                    Some(json!({ "pipeline": &*self.pipeline, "stage": &*self.stage.name })),
                );
            }
            self.halt.cancel();
            return false;
        }
        true
    }
}
