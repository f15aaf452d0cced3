//! Fan-in and fan-out operators.
//!
//! Each operator spawns its forwarders in a [`TaskGroup`] under the given
//! scope and returns immediately. Outputs close once every input is closed
//! and drained, or as soon as the scope is done.

use super::channel::{Queue, QueueReceiver};
use super::error::RecvError;
use super::select::send_any;
use crate::cancellation::{Scope, TaskGroup};
use crate::errors::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Closes every held queue when the last clone is dropped.
struct CloseOnDrop<T> {
    queues: Vec<Queue<T>>,
}

impl<T> CloseOnDrop<T> {
    fn close_now(&self) {
        for q in &self.queues {
            q.close();
        }
    }
}

impl<T> Drop for CloseOnDrop<T> {
    fn drop(&mut self) {
        self.close_now();
    }
}

/// Merges `inputs` into a single output queue of the given capacity.
///
/// Every item of every input is forwarded. The output closes when all
/// inputs are closed, or immediately when `scope` is done.
pub fn merge<T>(inputs: Vec<QueueReceiver<T>>, capacity: usize, scope: &Scope) -> Result<QueueReceiver<T>>
where
    T: Send + 'static,
{
    let group = TaskGroup::new(scope)?;
    let output = Queue::bounded(capacity);
    let closer = Arc::new(CloseOnDrop {
        queues: vec![output.clone()],
    });

    for (index, input) in inputs.into_iter().enumerate() {
        let output = output.clone();
        let closer = closer.clone();
        group.spawn(format!("merge-{index}"), move |scope| async move {
            loop {
                let item = match input.recv(&scope).await {
                    Ok(item) => item,
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Cancelled(cause)) => {
                        debug!(input = index, %cause, "Merge forwarder stopped");
                        closer.close_now();
                        break;
                    }
                };
                if output.send(item, &scope).await.is_err() {
                    closer.close_now();
                    break;
                }
            }
        });
    }

    Ok(output.receiver())
}

/// Splits `input` across `consumers` output queues.
///
/// Each item goes to exactly one consumer: whichever has room first, with
/// ties broken at random.
pub fn dispatch<T>(
    input: QueueReceiver<T>,
    consumers: usize,
    capacity: usize,
    scope: &Scope,
) -> Result<Vec<QueueReceiver<T>>>
where
    T: Send + 'static,
{
    if consumers == 0 {
        return Err(ConfigError::new("consumers", "dispatch needs at least one consumer").into());
    }
    let group = TaskGroup::new(scope)?;
    let outputs: Vec<Queue<T>> = (0..consumers).map(|_| Queue::bounded(capacity)).collect();
    let receivers = outputs.iter().map(Queue::receiver).collect();
    let closer = CloseOnDrop {
        queues: outputs.clone(),
    };

    group.spawn("dispatch", move |scope| async move {
        let _closer = closer;
        while let Ok(item) = input.recv(&scope).await {
            if send_any(&outputs, item, &scope).await.is_err() {
                break;
            }
        }
    });

    Ok(receivers)
}

/// What a broadcast does when a consumer has no room for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlowConsumerPolicy {
    /// Wait for the slow consumer, back-pressuring every consumer.
    #[default]
    Block,
    /// Drop the item for that consumer only and count the drop.
    DropItem,
}

/// Per-consumer drop counters of a broadcast.
#[derive(Debug, Clone)]
pub struct DropCounters {
    counts: Arc<[AtomicU64]>,
}

impl DropCounters {
    fn new(consumers: usize) -> Self {
        Self {
            counts: (0..consumers).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Returns how many items consumer `index` missed.
    #[must_use]
    pub fn get(&self, index: usize) -> u64 {
        self.counts
            .get(index)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Returns every consumer's drop count.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u64> {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }

    /// Returns the total number of dropped deliveries.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.snapshot().iter().sum()
    }
}

/// Outputs of a [`broadcast`].
#[derive(Debug)]
pub struct Broadcast<T> {
    /// One queue per consumer, in consumer order.
    pub outputs: Vec<QueueReceiver<T>>,
    drops: DropCounters,
}

impl<T> Broadcast<T> {
    /// Returns the drop counters. Always zero under [`SlowConsumerPolicy::Block`].
    #[must_use]
    pub fn drops(&self) -> DropCounters {
        self.drops.clone()
    }
}

/// Copies every item of `input` to each of `consumers` output queues.
pub fn broadcast<T>(
    input: QueueReceiver<T>,
    consumers: usize,
    capacity: usize,
    policy: SlowConsumerPolicy,
    scope: &Scope,
) -> Result<Broadcast<T>>
where
    T: Clone + Send + 'static,
{
    if consumers == 0 {
        return Err(ConfigError::new("consumers", "broadcast needs at least one consumer").into());
    }
    let group = TaskGroup::new(scope)?;
    let outputs: Vec<Queue<T>> = (0..consumers).map(|_| Queue::bounded(capacity)).collect();
    let receivers = outputs.iter().map(Queue::receiver).collect();
    let drops = DropCounters::new(consumers);
    let counters = drops.clone();
    let closer = CloseOnDrop {
        queues: outputs.clone(),
    };

    group.spawn("broadcast", move |scope| async move {
        let _closer = closer;
        'items: while let Ok(item) = input.recv(&scope).await {
            for (index, output) in outputs.iter().enumerate() {
                match policy {
                    SlowConsumerPolicy::Block => {
                        if output.send(item.clone(), &scope).await.is_err() {
                            break 'items;
                        }
                    }
                    SlowConsumerPolicy::DropItem => {
                        if output.try_send(item.clone()).is_err() {
                            counters.counts[index].fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        }
    });

    Ok(Broadcast {
        outputs: receivers,
        drops,
    })
}
