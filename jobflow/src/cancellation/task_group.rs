//! Tasks spawned inside a scope, awaited by quiescence.

use super::{CancelHandle, Scope};
use crate::errors::{panic_message, JobflowError, Result};
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::warn;

/// A task in the group that panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// Name the task was spawned with.
    pub name: String,
    /// Panic message.
    pub message: String,
}

/// Decrements the active count when a task ends, panicking or not.
struct ActiveGuard {
    active: Arc<watch::Sender<usize>>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// A group of related tasks sharing one cancellation scope.
///
/// Every task receives a handle to the group scope. [`wait`](Self::wait)
/// resolves once no task is running, including tasks spawned while
/// waiting, and can be dropped and re-awaited safely.
pub struct TaskGroup {
    scope: Scope,
    cancel: CancelHandle,
    runtime: Handle,
    active: Arc<watch::Sender<usize>>,
    failures: Arc<Mutex<Vec<TaskFailure>>>,
}

impl TaskGroup {
    /// Creates a group whose scope is a child of `parent`.
    ///
    /// Fails with [`JobflowError::ResourceExhausted`] outside a tokio runtime.
    pub fn new(parent: &Scope) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            JobflowError::resource_exhausted(format!("cannot spawn task group: {e}"))
        })?;
        let (scope, cancel) = parent.with_cancel();
        let (active, _) = watch::channel(0_usize);
        Ok(Self {
            scope,
            cancel,
            runtime,
            active: Arc::new(active),
            failures: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Returns the group scope.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Spawns a task in the group.
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, task: F)
    where
        F: FnOnce(Scope) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        self.active.send_modify(|n| *n += 1);
        let guard = ActiveGuard {
            active: self.active.clone(),
        };
        let failures = self.failures.clone();
        let scope = self.scope.clone();

        self.runtime.spawn(async move {
            let _guard = guard;
            if let Err(payload) = AssertUnwindSafe(task(scope)).catch_unwind().await {
                let message = panic_message(payload.as_ref());
                warn!(task = %name, %message, "Task in group panicked");
                failures.lock().push(TaskFailure { name, message });
            }
        });
    }

    /// Cancels the group scope, and with it every task that observes it.
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    /// Waits until no task in the group is running.
    pub async fn wait(&self) {
        let mut rx = self.active.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Returns the number of running tasks.
    #[must_use]
    pub fn task_count(&self) -> usize {
        *self.active.borrow()
    }

    /// Returns the tasks that panicked so far.
    #[must_use]
    pub fn failures(&self) -> Vec<TaskFailure> {
        self.failures.lock().clone()
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("task_count", &self.task_count())
            .field("cancelled", &self.scope.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_on_empty_group_returns() {
        let group = TaskGroup::new(&Scope::background()).unwrap();
        group.wait().await;
        assert_eq!(group.task_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_all_tasks() {
        let group = TaskGroup::new(&Scope::background()).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..4 {
            let counter = counter.clone();
            group.spawn(format!("task-{i}"), move |_scope| async move {
                tokio::task::yield_now().await;
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        group.wait().await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert!(group.failures().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_task_is_recorded() {
        let group = TaskGroup::new(&Scope::background()).unwrap();
        group.spawn("ok", |_scope| async {});
        group.spawn("boom", |_scope| async { panic!("Intentional") });

        group.wait().await;
        let failures = group.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].name, "boom");
        assert_eq!(failures[0].message, "Intentional");
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_respects_cancellation() {
        let group = TaskGroup::new(&Scope::background()).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = counter.clone();
        group.spawn("long_task", move |scope| async move {
            for _ in 0..10 {
                tokio::select! {
                    _ = scope.done() => return,
                    () = tokio::time::sleep(Duration::from_millis(10)) => {
                        counter_clone.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(35)).await;
        group.cancel_all();
        group.wait().await;

        let count = counter.load(Ordering::SeqCst);
        assert!(count < 10);
    }

    #[tokio::test]
    async fn test_parent_cancel_reaches_group() {
        let (parent, cancel) = Scope::background().with_cancel();
        let group = TaskGroup::new(&parent).unwrap();
        group.spawn("waiter", |scope| async move {
            scope.done().await;
        });

        cancel.cancel();
        group.wait().await;
        assert!(group.scope().is_done());
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let err = TaskGroup::new(&Scope::background()).unwrap_err();
        assert!(matches!(err, JobflowError::ResourceExhausted(_)));
    }
}
