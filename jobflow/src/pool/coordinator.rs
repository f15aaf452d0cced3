//! Graceful shutdown and autoscaling.
//!
//! One coordinator task runs per started pool. It samples the backlog for
//! the autoscaler, and when a drain is requested or the caller's scope is
//! cancelled it walks the pool through `Running -> Draining -> Stopped`:
//! the input queues close, workers finish what is queued until the grace
//! period expires, in-flight jobs are then cancelled, and whatever is
//! still queued is reported as skipped.

use super::job::{Outcome, SkipReason};
use super::scaling::ScaleController;
use super::worker::WorkerEnv;
use super::PoolState;
use crate::cancellation::ScopeError;
use crate::clock::{Instant, Ticker};
use crate::events::{POOL_DRAINING, POOL_STOPPED};
use crate::metrics::MetricsSnapshot;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Summary of a completed shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Pool name.
    pub pool: String,
    /// True if in-flight jobs had to be cancelled, either because the
    /// grace period expired or because the caller's scope was cancelled.
    pub forced: bool,
    /// Time from the start of draining until every worker exited.
    pub drain_time: Duration,
    /// Jobs still queued at the end, reported as
    /// [`SkipReason::ShuttingDown`].
    pub abandoned: u64,
    /// Final metrics.
    pub metrics: MetricsSnapshot,
}

enum Signal {
    Drain(Duration),
    Cancelled(ScopeError),
    Quiesced,
    Tick(Option<Instant>),
}

/// Resolves with the grace period once a drain is requested.
///
/// A dropped sender means the pool handle is gone; that drains with no
/// grace.
async fn wait_for_drain(rx: &mut watch::Receiver<Option<Duration>>) -> Duration {
    loop {
        let requested = *rx.borrow_and_update();
        if let Some(grace) = requested {
            return grace;
        }
        if rx.changed().await.is_err() {
            return Duration::ZERO;
        }
    }
}

async fn next_tick(ticker: &mut Option<Ticker>) -> Option<Instant> {
    match ticker {
        Some(ticker) => ticker.tick().await,
        None => std::future::pending().await,
    }
}

pub(crate) async fn coordinate<J, R>(env: Arc<WorkerEnv<J, R>>, mut drain: watch::Receiver<Option<Duration>>)
where
    J: Clone + Send + 'static,
    R: Send + 'static,
{
    let scaling = env.config.scaling.clone();
    let mut scaler = scaling
        .enabled
        .then(|| ScaleController::new(scaling.clone(), env.config.min_workers, env.config.max_workers));
    let mut ticker = if scaler.is_some() {
        Ticker::new(env.clock.clone(), scaling.sample_interval()).ok()
    } else {
        None
    };

    let (forced, drain_time) = loop {
        let signal = tokio::select! {
            biased;
            grace = wait_for_drain(&mut drain) => Signal::Drain(grace),
            cause = env.scope.done() => Signal::Cancelled(cause),
            () = env.group.wait() => Signal::Quiesced,
            tick = next_tick(&mut ticker) => Signal::Tick(tick),
        };

        match signal {
            Signal::Drain(grace) => {
                let started = env.clock.now();
                env.begin_draining();
                let forced = env.drain_within(grace).await;
                break (forced, env.clock.now().saturating_duration_since(started));
            }
            Signal::Cancelled(cause) => {
                warn!(pool = %env.name, %cause, "Pool scope ended, stopping");
                let started = env.clock.now();
                env.begin_draining();
                env.group.wait().await;
                break (true, env.clock.now().saturating_duration_since(started));
            }
            Signal::Quiesced => {
                warn!(pool = %env.name, "All workers exited, stopping");
                env.begin_draining();
                break (false, Duration::ZERO);
            }
            Signal::Tick(Some(now)) => {
                let running = *env.state.borrow() == PoolState::Running;
                if let (true, Some(scaler)) = (running, scaler.as_mut()) {
                    let backlog = env.backlog();
                    if let Some(target) = scaler.observe(now, backlog, env.target_workers()) {
                        debug!(pool = %env.name, backlog, target, "Autoscaling");
                        env.resize_to(target);
                    }
                }
            }
            Signal::Tick(None) => ticker = None,
        }
    };

    drop(ticker);
    env.finish(forced, drain_time).await;
}

impl<J, R> WorkerEnv<J, R>
where
    J: Clone + Send + 'static,
    R: Send + 'static,
{
    /// Moves a running pool to `Draining` and closes its input queues.
    /// Returns false if the pool was not running.
    pub(crate) fn begin_draining(&self) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == PoolState::Running {
                *state = PoolState::Draining;
                true
            } else {
                false
            }
        });
        if changed {
            for queue in &self.queues {
                queue.close();
            }
            info!(pool = %self.name, backlog = self.backlog(), "Pool draining");
            self.events
                .try_emit(POOL_DRAINING, Some(json!({ "pool": &*self.name, "backlog": self.backlog() })));
        }
        changed
    }

    /// Waits for the workers to exit, cancelling in-flight jobs once
    /// `grace` has passed. Returns true if cancellation was needed.
    async fn drain_within(&self, grace: Duration) -> bool {
        let deadline = self.clock.now() + grace;
        tokio::select! {
            biased;
            () = self.group.wait() => false,
            () = self.clock.sleep_until(deadline) => {
                warn!(
                    pool = %self.name,
                    grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                    in_flight = self.metrics.in_flight(),
                    "Grace period expired, cancelling in-flight jobs"
                );
                self.cancel.cancel_with(ScopeError::DeadlineExceeded);
                self.group.wait().await;
                true
            }
        }
    }

    async fn finish(&self, forced: bool, drain_time: Duration) {
        // Every worker has exited, so ending the pool scope only sends the
        // leftovers past a full results queue.
        self.cancel.cancel();
        let mut abandoned: u64 = 0;
        for queue in &self.queues {
            while let Ok(job) = queue.try_recv() {
                let outcome = Outcome::Skipped {
                    reason: SkipReason::ShuttingDown,
                };
                self.complete(None, job.id, outcome, 0, Duration::ZERO).await;
                abandoned += 1;
            }
        }
        self.results.close();
        self.state.send_replace(PoolState::Stopped);

        for failure in self.group.failures() {
            warn!(pool = %self.name, task = %failure.name, "Worker died: {}", failure.message);
        }

        let report = ShutdownReport {
            pool: self.name.to_string(),
            forced,
            drain_time,
            abandoned,
            metrics: self.metrics.snapshot(self.backlog()),
        };
        info!(
            pool = %self.name,
            forced,
            abandoned,
            drain_ms = u64::try_from(drain_time.as_millis()).unwrap_or(u64::MAX),
            processed = report.metrics.processed,
            errored = report.metrics.errored,
            skipped = report.metrics.skipped,
            "Pool stopped"
        );
        self.events.try_emit(
            POOL_STOPPED,
            Some(json!({
                "pool": &*self.name,
                "forced": forced,
                "abandoned": abandoned,
                "processed": report.metrics.processed,
                "errored": report.metrics.errored,
                "skipped": report.metrics.skipped,
            })),
        );

        self.stopped.send_replace(Some(report));
    }
}
