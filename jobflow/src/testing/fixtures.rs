//! Harnesses for driving pools and pipelines in tests.

use crate::cancellation::Scope;
use crate::clock::{ManualClock, SharedClock};
use crate::errors::Result;
use crate::pool::{Job, JobId, JobResult, Pool, ShutdownReport};
use crate::queue::Queue;
use std::sync::Arc;
use std::time::Duration;

/// A background scope driven by a [`ManualClock`].
///
/// Deadlines derived from the scope only pass when the clock is advanced.
#[must_use]
pub fn manual_scope() -> (Scope, Arc<ManualClock>) {
    let clock = ManualClock::new();
    let shared: SharedClock = clock.clone();
    (Scope::background_with_clock(shared), clock)
}

/// What a pool produced for a batch of submissions.
#[derive(Debug)]
pub struct PoolRun<R> {
    /// Ids of the accepted jobs, in submission order.
    pub submitted: Vec<JobId>,
    /// Every result, in emission order.
    pub results: Vec<JobResult<R>>,
    /// The shutdown report.
    pub report: ShutdownReport,
}

/// Starts `pool`, submits `jobs`, shuts down with `grace` and collects
/// every result.
///
/// Results are drained concurrently, so the pool never blocks on a full
/// results queue.
///
/// # Errors
///
/// Fails if the pool cannot start or was already started.
pub async fn run_pool<J, R>(
    pool: &Pool<J, R>,
    jobs: impl IntoIterator<Item = Job<J>>,
    grace: Duration,
) -> Result<PoolRun<R>>
where
    J: Clone + Send + 'static,
    R: Send + 'static,
{
    let receiver = pool.results();
    let collector = tokio::spawn(async move { receiver.recv_all().await });

    let scope = Scope::background();
    pool.start(&scope)?;
    let mut submitted = Vec::new();
    for job in jobs {
        let id = job.id.clone();
        if pool.submit(job, &scope).await.is_ok() {
            submitted.push(id);
        }
    }

    let report = pool.shutdown(grace).await?;
    let results = collector.await.unwrap_or_default();
    Ok(PoolRun {
        submitted,
        results,
        report,
    })
}

/// Sends `items` to `input` and closes it.
pub async fn feed<T>(input: &Queue<T>, items: impl IntoIterator<Item = T>) {
    let scope = Scope::background();
    for item in items {
        if input.send(item, &scope).await.is_err() {
            break;
        }
    }
    input.close();
}
