//! Worker loop.
//!
//! A worker waits for jobs under its own idle scope, which is cancelled
//! when the pool shrinks, and runs each job under a job scope derived from
//! the pool scope, so a retiring worker still finishes the job it holds.

use super::config::PoolConfig;
use super::coordinator::ShutdownReport;
use super::handler::{JobContext, JobHandler};
use super::job::{FailureKind, Job, JobId, JobResult, Outcome};
use super::PoolState;
use crate::cancellation::{run_guarded, CancelHandle, Guarded, Scope, TaskGroup};
use crate::clock::SharedClock;
use crate::errors::{panic_message, TransformError};
use crate::events::{SharedEventSink, POOL_RESIZED, WORKER_PANICKED, WORKER_REPLACED};
use crate::metrics::MetricsRecorder;
use crate::observability::SpanTimer;
use crate::pipeline::{with_retry, AttemptError};
use crate::queue::{recv_biased, Queue, QueueReceiver, RecvError, SendError};
use crate::throttle::RateLimiter;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Details of a recovered handler panic, passed to the pool's panic hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicReport {
    /// Pool name.
    pub pool: String,
    /// Worker that recovered the panic.
    pub worker_id: usize,
    /// The job being handled, or `None` for a batch.
    pub job_id: Option<JobId>,
    /// Panic message.
    pub message: String,
}

/// Callback invoked for every recovered panic.
pub type PanicHook = Arc<dyn Fn(&PanicReport) + Send + Sync>;

/// One or more jobs picked up together.
enum Work<J> {
    Single(Job<J>),
    Batch(Vec<Job<J>>),
}

/// Everything a running pool shares between its workers and coordinator.
pub(crate) struct WorkerEnv<J, R> {
    pub(crate) name: Arc<str>,
    pub(crate) config: PoolConfig,
    pub(crate) handler: Arc<dyn JobHandler<J, R>>,
    pub(crate) queues: Vec<Queue<Job<J>>>,
    receivers: Vec<QueueReceiver<Job<J>>>,
    pub(crate) results: Queue<JobResult<R>>,
    pub(crate) metrics: Arc<MetricsRecorder>,
    pub(crate) clock: SharedClock,
    pub(crate) events: SharedEventSink,
    on_panic: Option<PanicHook>,
    pub(crate) state: Arc<watch::Sender<PoolState>>,
    pub(crate) stopped: Arc<watch::Sender<Option<ShutdownReport>>>,
    /// The pool scope. Job scopes derive from it.
    pub(crate) scope: Scope,
    pub(crate) cancel: CancelHandle,
    pub(crate) group: TaskGroup,
    limiter: Option<Arc<RateLimiter>>,
    /// Retire handles of the workers that are not retiring.
    workers: DashMap<usize, CancelHandle>,
    next_worker_id: AtomicUsize,
    resize_lock: Mutex<()>,
    /// Highest class first.
    priority_order: Vec<usize>,
    /// Lowest class first, for the starvation quota.
    starved_order: Vec<usize>,
}

/// Parts of a pool handed to [`WorkerEnv::new`].
pub(crate) struct EnvParts<J, R> {
    pub(crate) name: Arc<str>,
    pub(crate) config: PoolConfig,
    pub(crate) handler: Arc<dyn JobHandler<J, R>>,
    pub(crate) queues: Vec<Queue<Job<J>>>,
    pub(crate) results: Queue<JobResult<R>>,
    pub(crate) metrics: Arc<MetricsRecorder>,
    pub(crate) clock: SharedClock,
    pub(crate) events: SharedEventSink,
    pub(crate) on_panic: Option<PanicHook>,
    pub(crate) state: Arc<watch::Sender<PoolState>>,
    pub(crate) stopped: Arc<watch::Sender<Option<ShutdownReport>>>,
}

impl<J, R> WorkerEnv<J, R>
where
    J: Clone + Send + 'static,
    R: Send + 'static,
{
    pub(crate) fn new(
        parts: EnvParts<J, R>,
        scope: Scope,
        cancel: CancelHandle,
        group: TaskGroup,
        limiter: Option<Arc<RateLimiter>>,
    ) -> Self {
        let classes = parts.queues.len();
        Self {
            receivers: parts.queues.iter().map(Queue::receiver).collect(),
            name: parts.name,
            config: parts.config,
            handler: parts.handler,
            queues: parts.queues,
            results: parts.results,
            metrics: parts.metrics,
            clock: parts.clock,
            events: parts.events,
            on_panic: parts.on_panic,
            state: parts.state,
            stopped: parts.stopped,
            scope,
            cancel,
            group,
            limiter,
            workers: DashMap::new(),
            next_worker_id: AtomicUsize::new(0),
            resize_lock: Mutex::new(()),
            priority_order: (0..classes).rev().collect(),
            starved_order: (0..classes).collect(),
        }
    }

    /// Number of workers that are not retiring.
    pub(crate) fn target_workers(&self) -> usize {
        self.workers.len()
    }

    /// Jobs waiting across all priority classes.
    pub(crate) fn backlog(&self) -> usize {
        self.queues.iter().map(Queue::len).sum()
    }

    pub(crate) fn spawn_worker(self: &Arc<Self>) -> usize {
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
        let (idle, retire) = self.scope.with_cancel();
        self.workers.insert(worker_id, retire);
        self.metrics.worker_started(worker_id);

        let env = Arc::clone(self);
        self.group
            .spawn(format!("{}-worker-{worker_id}", self.name), move |_| env.run(worker_id, idle));
        worker_id
    }

    /// Grows or shrinks the worker set to `target`. Returns the previous
    /// size.
    pub(crate) fn resize_to(self: &Arc<Self>, target: usize) -> usize {
        let _guard = self.resize_lock.lock();
        let current = self.workers.len();

        if target > current {
            for _ in current..target {
                self.spawn_worker();
            }
        } else if target < current {
            let mut ids: Vec<usize> = self.workers.iter().map(|entry| *entry.key()).collect();
            ids.sort_unstable();
            for id in ids.into_iter().rev().take(current - target) {
                if let Some((_, retire)) = self.workers.remove(&id) {
                    retire.cancel();
                }
            }
        }

        if target != current {
            info!(pool = %self.name, from = current, to = target, "Pool resized");
            self.events.try_emit(
                POOL_RESIZED,
                Some(json!({ "pool": &*self.name, "from": current, "to": target })),
            );
        }
        current
    }

    async fn run(self: Arc<Self>, worker_id: usize, idle: Scope) {
        debug!(pool = %self.name, worker_id, "Worker started");
        let mut picks: u64 = 0;
        let mut consecutive_panics: u32 = 0;

        while let Some(work) = self.next_work(&idle, &mut picks).await {
            if self.execute(worker_id, work).await {
                consecutive_panics += 1;
                if consecutive_panics >= self.config.panic_threshold {
                    self.replace(worker_id, consecutive_panics);
                    break;
                }
            } else {
                consecutive_panics = 0;
            }
        }

        self.workers.remove(&worker_id);
        self.metrics.worker_stopped(worker_id);
        debug!(pool = %self.name, worker_id, "Worker stopped");
    }

    fn replace(self: &Arc<Self>, worker_id: usize, panics: u32) {
        let _guard = self.resize_lock.lock();
        self.workers.remove(&worker_id);
        if self.scope.is_done() {
            return;
        }
        self.metrics.record_replacement();
        let replacement = self.spawn_worker();
        warn!(
            pool = %self.name,
            worker_id,
            replacement,
            panics,
            "Worker exceeded panic threshold, replaced"
        );
        self.events.try_emit(
            WORKER_REPLACED,
            Some(json!({
                "pool": &*self.name,
                "worker_id": worker_id,
                "replacement": replacement,
                "panics": panics,
            })),
        );
    }

    async fn next_job(&self, idle: &Scope, picks: &mut u64) -> Result<Job<J>, RecvError> {
        if self.receivers.len() == 1 {
            return self.receivers[0].recv(idle).await;
        }
        *picks += 1;
        let order = if *picks % u64::from(self.config.starvation_quota) == 0 {
            &self.starved_order
        } else {
            &self.priority_order
        };
        recv_biased(&self.receivers, order, idle).await.map(|(_, job)| job)
    }

    /// Waits for the next job, or a batch when batching is enabled.
    ///
    /// Jobs already taken are always returned so that each gets a result,
    /// even if the idle scope is cancelled while a batch is collected.
    async fn next_work(&self, idle: &Scope, picks: &mut u64) -> Option<Work<J>> {
        let first = self.next_job(idle, picks).await.ok()?;
        let Some(size) = self.config.batch_size else {
            return Some(Work::Single(first));
        };

        let mut batch = Vec::with_capacity(size);
        batch.push(first);
        let flush_at = self.config.batch_flush().map(|d| self.clock.now() + d);

        while batch.len() < size {
            let next = match flush_at {
                Some(deadline) => tokio::select! {
                    biased;
                    next = self.next_job(idle, picks) => next,
                    () = self.clock.sleep_until(deadline) => break,
                },
                None => self.next_job(idle, picks).await,
            };
            match next {
                Ok(job) => batch.push(job),
                Err(_) => break,
            }
        }
        Some(Work::Batch(batch))
    }

    /// Runs the work and emits one result per job. Returns true if the
    /// handler panicked.
    async fn execute(&self, worker_id: usize, work: Work<J>) -> bool {
        let jobs = match &work {
            Work::Single(_) => 1,
            Work::Batch(batch) => batch.len(),
        };
        self.metrics.record_started(jobs as u64);

        if let Some(limiter) = &self.limiter {
            if let Err(cause) = limiter.acquire(&self.scope).await {
                let ids = match work {
                    Work::Single(job) => vec![job.id],
                    Work::Batch(batch) => batch.into_iter().map(|job| job.id).collect(),
                };
                for id in ids {
                    let outcome = Outcome::Skipped { reason: cause.into() };
                    self.complete(Some(worker_id), id, outcome, 0, Duration::ZERO).await;
                }
                return false;
            }
        }

        match work {
            Work::Single(job) => self.execute_one(worker_id, job).await,
            Work::Batch(batch) => self.execute_batch(worker_id, batch).await,
        }
    }

    /// Derives the job scope, applying `timeout` if set.
    fn job_scope(&self, timeout: Option<Duration>) -> Result<(Scope, Option<CancelHandle>), String> {
        match timeout {
            Some(timeout) => self
                .scope
                .with_timeout(timeout)
                .map(|(scope, handle)| (scope, Some(handle)))
                .map_err(|e| e.to_string()),
            None => Ok((self.scope.clone(), None)),
        }
    }

    async fn execute_one(&self, worker_id: usize, job: Job<J>) -> bool {
        let timer = SpanTimer::start(self.clock.clone(), job.id.as_str());
        let Job {
            id,
            payload,
            timeout,
            max_attempts,
            ..
        } = job;

        let (scope, _deadline) = match self.job_scope(timeout.or_else(|| self.config.job_timeout())) {
            Ok(scope) => scope,
            Err(detail) => {
                let outcome = Outcome::Failure {
                    kind: FailureKind::ResourceExhausted,
                    detail,
                };
                self.complete(Some(worker_id), id, outcome, 0, timer.finish()).await;
                return false;
            }
        };

        let max_attempts = max_attempts.unwrap_or(self.config.retry.max_attempts).max(1);
        let (result, attempts) = if max_attempts > 1 {
            let retry = self.config.retry.clone().with_max_attempts(max_attempts);
            let (id, scope) = (&id, &scope);
            with_retry(&retry, id.as_str(), scope, move |attempt| {
                self.attempt(worker_id, id, payload.clone(), attempt, scope)
            })
            .await
        } else {
            (self.attempt(worker_id, &id, payload, 1, &scope).await, 1)
        };

        let (outcome, panicked) = match result {
            Ok(value) => (Outcome::Success { value }, false),
            Err(AttemptError::Failed(error)) if error.is_panic() => (
                Outcome::Failure {
                    kind: FailureKind::WorkerPanic,
                    detail: error.detail,
                },
                true,
            ),
            Err(AttemptError::Failed(error)) => (
                Outcome::Failure {
                    kind: FailureKind::Transform,
                    detail: error.to_string(),
                },
                false,
            ),
            Err(AttemptError::Interrupted(cause)) => (Outcome::Skipped { reason: cause.into() }, false),
        };
        self.complete(Some(worker_id), id, outcome, attempts, timer.finish())
            .await;
        panicked
    }

    async fn attempt(
        &self,
        worker_id: usize,
        id: &JobId,
        payload: J,
        attempt: u32,
        scope: &Scope,
    ) -> Result<R, AttemptError> {
        let ctx = JobContext::new(vec![id.clone()], worker_id, attempt, scope.clone());
        match run_guarded(self.handler.handle(payload, &ctx), scope).await {
            Guarded::Completed(Ok(value)) => Ok(value),
            Guarded::Completed(Err(error)) => Err(error.into()),
            Guarded::Panicked(message) => {
                self.report_panic(worker_id, Some(id), &message);
                Err(TransformError::panic(message).into())
            }
            Guarded::Interrupted(cause) => Err(AttemptError::Interrupted(cause)),
        }
    }

    async fn execute_batch(&self, worker_id: usize, batch: Vec<Job<J>>) -> bool {
        let timer = SpanTimer::start(self.clock.clone(), format!("{}-batch", self.name));
        let timeout = batch
            .iter()
            .filter_map(|job| job.timeout)
            .min()
            .or_else(|| self.config.job_timeout());
        let (ids, payloads): (Vec<JobId>, Vec<J>) = batch.into_iter().map(|job| (job.id, job.payload)).unzip();

        let (scope, _deadline) = match self.job_scope(timeout) {
            Ok(scope) => scope,
            Err(detail) => {
                let share = timer.finish() / u32::try_from(ids.len().max(1)).unwrap_or(u32::MAX);
                for id in ids {
                    let outcome = Outcome::Failure {
                        kind: FailureKind::ResourceExhausted,
                        detail: detail.clone(),
                    };
                    self.complete(Some(worker_id), id, outcome, 0, share).await;
                }
                return false;
            }
        };

        let ctx = JobContext::new(ids.clone(), worker_id, 1, scope.clone());
        let mut panicked = false;
        let outcomes: Vec<Outcome<R>> = match run_guarded(self.handler.handle_batch(payloads, &ctx), &scope).await {
            Guarded::Completed(results) => {
                let mut results = results.into_iter();
                ids.iter()
                    .map(|_| match results.next() {
                        Some(Ok(value)) => Outcome::Success { value },
                        Some(Err(error)) => Outcome::Failure {
                            kind: FailureKind::Transform,
                            detail: error.to_string(),
                        },
                        None => Outcome::Failure {
                            kind: FailureKind::Transform,
                            detail: "batch handler returned too few results".to_string(),
                        },
                    })
                    .collect()
            }
            Guarded::Panicked(message) => {
                self.report_panic(worker_id, None, &message);
                panicked = true;
                ids.iter()
                    .map(|_| Outcome::Failure {
                        kind: FailureKind::WorkerPanic,
                        detail: message.clone(),
                    })
                    .collect()
            }
            Guarded::Interrupted(cause) => ids
                .iter()
                .map(|_| Outcome::Skipped { reason: cause.into() })
                .collect(),
        };

        let share = timer.finish() / u32::try_from(ids.len().max(1)).unwrap_or(u32::MAX);
        for (id, outcome) in ids.into_iter().zip(outcomes) {
            self.complete(Some(worker_id), id, outcome, 1, share).await;
        }
        panicked
    }

    fn report_panic(&self, worker_id: usize, job_id: Option<&JobId>, message: &str) {
        warn!(
            pool = %self.name,
            worker_id,
            job_id = job_id.map(JobId::as_str),
            %message,
            "Job handler panicked"
        );
        self.metrics.record_panic(worker_id);
        self.events.try_emit(
            WORKER_PANICKED,
            Some(json!({
                "pool": &*self.name,
                "worker_id": worker_id,
                "job_id": job_id.map(JobId::as_str),
                "message": message,
            })),
        );

        if let Some(hook) = &self.on_panic {
            let report = PanicReport {
                pool: self.name.to_string(),
                worker_id,
                job_id: job_id.cloned(),
                message: message.to_string(),
            };
            if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| hook(&report))) {
                warn!(
                    pool = %self.name,
                    worker_id,
                    message = %panic_message(payload.as_ref()),
                    "Panic hook panicked"
                );
            }
        }
    }

    /// Accounts for a finished job and emits its result.
    ///
    /// While the pool scope is live a full results queue applies
    /// back-pressure. Once it ends, results bypass the capacity bound so
    /// shutdown never waits on an undrained [`Pool::results`](super::Pool::results)
    /// and no result is lost.
    pub(crate) async fn complete(
        &self,
        worker_id: Option<usize>,
        job_id: JobId,
        outcome: Outcome<R>,
        attempts: u32,
        duration: Duration,
    ) {
        self.metrics
            .record_finished(worker_id, outcome.completion(), duration);
        debug!(
            pool = %self.name,
            worker_id,
            job_id = %job_id,
            success = outcome.is_success(),
            skip_reason = ?outcome.skip_reason(),
            attempts,
            "Job finished"
        );

        let mut result = JobResult::new(job_id, worker_id, outcome, attempts, duration);
        if worker_id.is_some() {
            result = result.traversed(&*self.name);
        }
        let rejected = match self.results.send(result, &self.scope).await {
            Ok(()) => return,
            Err(SendError::Cancelled(result, _)) => self.results.force_send(result).err(),
            Err(SendError::Closed(result)) => Some(result),
        };
        if let Some(result) = rejected {
            warn!(pool = %self.name, job_id = %result.job_id, "Results queue closed, result dropped");
        }
    }
}
