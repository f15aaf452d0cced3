//! Tree-structured cancellation scopes.

use super::ScopeKey;
use crate::clock::{system_clock, Instant, SharedClock};
use crate::errors::{JobflowError, Result};
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Why a scope became done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ScopeError {
    /// The scope or one of its ancestors was cancelled explicitly.
    #[error("context cancelled")]
    Cancelled,
    /// The scope's deadline, or an ancestor's, passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

type BoundValue = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
struct ScopeState {
    cause: Option<ScopeError>,
    children: Vec<Weak<ScopeInner>>,
    timer: Option<JoinHandle<()>>,
}

struct ScopeInner {
    parent: Option<Scope>,
    clock: SharedClock,
    deadline: Option<Instant>,
    binding: Option<(u64, BoundValue)>,
    state: Mutex<ScopeState>,
    done: watch::Sender<bool>,
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}

/// A node in the cancellation tree.
///
/// A scope becomes done when it is cancelled, when its deadline passes, or
/// when any ancestor becomes done. Once done it stays done, and every
/// current and future waiter on [`done`](Self::done) observes it.
///
/// Cloning a scope is cheap and yields another handle to the same node.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    /// Returns a root scope that is never cancelled, using the system clock.
    #[must_use]
    pub fn background() -> Self {
        Self::background_with_clock(system_clock())
    }

    /// Returns a root scope whose timers run on `clock`.
    #[must_use]
    pub fn background_with_clock(clock: SharedClock) -> Self {
        Self::from_parts(None, clock, None, None)
    }

    fn from_parts(
        parent: Option<Self>,
        clock: SharedClock,
        deadline: Option<Instant>,
        binding: Option<(u64, BoundValue)>,
    ) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(ScopeInner {
                parent,
                clock,
                deadline,
                binding,
                state: Mutex::new(ScopeState::default()),
                done,
            }),
        }
    }

    /// Creates a child linked into this scope's cancellation tree.
    fn child(&self, deadline: Option<Instant>, binding: Option<(u64, BoundValue)>) -> Self {
        let deadline = match (self.inner.deadline, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let child = Self::from_parts(Some(self.clone()), self.inner.clock.clone(), deadline, binding);

        let inherited = {
            let mut state = self.inner.state.lock();
            match state.cause {
                Some(cause) => Some(cause),
                None => {
                    state.children.retain(|w| w.strong_count() > 0);
                    state.children.push(Arc::downgrade(&child.inner));
                    None
                }
            }
        };
        if let Some(cause) = inherited {
            child.cancel_with(cause);
        }
        child
    }

    /// Derives a child scope and the function that cancels it.
    #[must_use]
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let child = self.child(None, None);
        let handle = CancelHandle {
            scope: child.clone(),
        };
        (child, handle)
    }

    /// Derives a child scope that becomes done at `deadline`.
    ///
    /// The earliest deadline in the ancestry wins. Arming the timer needs a
    /// tokio runtime; without one this fails with
    /// [`JobflowError::ResourceExhausted`].
    pub fn with_deadline(&self, deadline: Instant) -> Result<(Self, CancelHandle)> {
        let child = self.child(Some(deadline), None);
        let handle = CancelHandle {
            scope: child.clone(),
        };

        if child.err().is_some() {
            return Ok((child, handle));
        }
        if deadline <= self.inner.clock.now() {
            child.cancel_with(ScopeError::DeadlineExceeded);
            return Ok((child, handle));
        }
        // An earlier ancestor deadline already covers this child.
        if self.inner.deadline.is_some_and(|d| d <= deadline) {
            return Ok((child, handle));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            JobflowError::resource_exhausted(format!("cannot arm deadline timer: {e}"))
        })?;
        let sleep = self.inner.clock.sleep_until(deadline);
        let weak = Arc::downgrade(&child.inner);
        let timer = runtime.spawn(async move {
            sleep.await;
            if let Some(inner) = weak.upgrade() {
                Scope { inner }.cancel_with(ScopeError::DeadlineExceeded);
            }
        });

        let mut state = child.inner.state.lock();
        if state.cause.is_some() {
            timer.abort();
        } else {
            state.timer = Some(timer);
        }
        drop(state);

        Ok((child, handle))
    }

    /// Derives a child scope that becomes done after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Result<(Self, CancelHandle)> {
        let deadline = self.inner.clock.now() + timeout;
        self.with_deadline(deadline)
    }

    /// Derives a child scope carrying a `key -> value` binding.
    ///
    /// The child is cancelled with this scope but has no cancel function of
    /// its own.
    #[must_use]
    pub fn with_value<T>(&self, key: &ScopeKey<T>, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        let bound: BoundValue = Arc::new(value);
        self.child(None, Some((key.id(), bound)))
    }

    /// Looks up `key`, walking from this scope towards the root.
    #[must_use]
    pub fn value<T>(&self, key: &ScopeKey<T>) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let mut current = Some(self);
        while let Some(scope) = current {
            if let Some((id, value)) = &scope.inner.binding {
                if *id == key.id() {
                    return value.clone().downcast::<T>().ok();
                }
            }
            current = scope.inner.parent.as_ref();
        }
        None
    }

    /// Returns `None` while live, otherwise why the scope is done.
    #[must_use]
    pub fn err(&self) -> Option<ScopeError> {
        self.inner.state.lock().cause
    }

    /// Returns whether the scope is done.
    #[must_use]
    pub fn is_done(&self) -> bool {
        *self.inner.done.borrow()
    }

    /// Returns a future that resolves with the cause once the scope is done.
    ///
    /// The future owns a handle to the scope, so it can be held across
    /// `select!` arms and moved into tasks.
    pub fn done(&self) -> impl Future<Output = ScopeError> + Send + 'static {
        let scope = self.clone();
        let mut rx = self.inner.done.subscribe();
        async move {
            // The sender lives as long as `scope`, so this only errors if it never fires.
            let _ = rx.wait_for(|done| *done).await;
            scope.err().unwrap_or(ScopeError::Cancelled)
        }
    }

    /// Returns the effective deadline: the earliest in the ancestry.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Returns the time left before the deadline, if there is one.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(self.inner.clock.now()))
    }

    /// Returns the clock this scope's timers run on.
    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    /// Returns the number of live children registered with this scope.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .children
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Marks the scope done with `cause` and propagates to descendants.
    ///
    /// Only the first cause sticks. Children are signalled exactly once
    /// and the scope lock is not held while they are visited.
    pub(crate) fn cancel_with(&self, cause: ScopeError) {
        let (children, timer) = {
            let mut state = self.inner.state.lock();
            if state.cause.is_some() {
                return;
            }
            state.cause = Some(cause);
            (std::mem::take(&mut state.children), state.timer.take())
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        self.inner.done.send_replace(true);

        for child in children.iter().filter_map(Weak::upgrade) {
            Self { inner: child }.cancel_with(cause);
        }
        if let Some(parent) = &self.inner.parent {
            parent.forget_child(&self.inner);
        }
    }

    fn forget_child(&self, child: &Arc<ScopeInner>) {
        let target = Arc::as_ptr(child);
        self.inner
            .state
            .lock()
            .children
            .retain(|w| w.strong_count() > 0 && !std::ptr::eq(w.as_ptr(), target));
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("err", &self.err())
            .field("deadline", &self.inner.deadline)
            .field("has_parent", &self.inner.parent.is_some())
            .finish()
    }
}

/// The cancel function returned alongside a derived scope.
///
/// Cancelling is idempotent and also stops the scope's deadline timer.
/// Dropping the handle does not cancel.
#[derive(Clone)]
pub struct CancelHandle {
    scope: Scope,
}

impl CancelHandle {
    /// Cancels the scope and all of its descendants.
    pub fn cancel(&self) {
        self.scope.cancel_with(ScopeError::Cancelled);
    }

    /// Cancels with a specific cause.
    pub(crate) fn cancel_with(&self, cause: ScopeError) {
        self.scope.cancel_with(cause);
    }

    /// Returns whether the scope has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.scope.is_done()
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use futures::FutureExt;

    #[test]
    fn test_background_is_never_done() {
        let root = Scope::background();
        assert!(root.err().is_none());
        assert!(!root.is_done());
        assert!(root.deadline().is_none());
        assert!(root.done().now_or_never().is_none());
    }

    #[tokio::test]
    async fn test_cancel_marks_done_with_cause() {
        let (scope, cancel) = Scope::background().with_cancel();
        cancel.cancel();

        assert_eq!(scope.err(), Some(ScopeError::Cancelled));
        assert_eq!(scope.done().await, ScopeError::Cancelled);
        // Future waiters still observe it.
        assert_eq!(scope.done().await, ScopeError::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_first_cause_wins() {
        let (scope, cancel) = Scope::background().with_cancel();
        cancel.cancel_with(ScopeError::DeadlineExceeded);
        cancel.cancel();
        assert_eq!(scope.err(), Some(ScopeError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_parent_cancel_propagates_to_descendants() {
        let (parent, cancel) = Scope::background().with_cancel();
        let (child, _child_cancel) = parent.with_cancel();
        let grandchild = child.with_value(&ScopeKey::<u8>::new("k"), 1);

        cancel.cancel();
        assert_eq!(child.err(), Some(ScopeError::Cancelled));
        assert_eq!(grandchild.err(), Some(ScopeError::Cancelled));
    }

    #[tokio::test]
    async fn test_child_cancel_does_not_touch_parent() {
        let (parent, _cancel) = Scope::background().with_cancel();
        let (child, child_cancel) = parent.with_cancel();
        assert_eq!(parent.child_count(), 1);

        child_cancel.cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());
        assert_eq!(parent.child_count(), 0);
    }

    #[tokio::test]
    async fn test_child_of_cancelled_parent_starts_cancelled() {
        let (parent, cancel) = Scope::background().with_cancel();
        cancel.cancel();
        let (child, _) = parent.with_cancel();
        assert_eq!(child.err(), Some(ScopeError::Cancelled));
    }

    #[tokio::test]
    async fn test_deadline_fires_on_manual_clock() {
        let clock = ManualClock::new();
        let root = Scope::background_with_clock(clock.clone());
        let (scope, _cancel) = root.with_timeout(Duration::from_secs(10)).unwrap();

        while clock.pending_sleepers() == 0 {
            tokio::task::yield_now().await;
        }
        clock.advance(Duration::from_secs(9));
        tokio::task::yield_now().await;
        assert!(scope.err().is_none());

        clock.advance(Duration::from_secs(1));
        assert_eq!(scope.done().await, ScopeError::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_past_deadline_is_done_immediately() {
        let root = Scope::background();
        let (scope, _) = root.with_deadline(root.clock().now()).unwrap();
        assert_eq!(scope.err(), Some(ScopeError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_earliest_deadline_wins() {
        let clock = ManualClock::new();
        let root = Scope::background_with_clock(clock.clone());
        let (outer, _) = root.with_timeout(Duration::from_secs(1)).unwrap();
        let (inner, _) = outer.with_timeout(Duration::from_secs(60)).unwrap();

        assert_eq!(inner.deadline(), outer.deadline());
        assert_eq!(inner.remaining(), Some(Duration::from_secs(1)));

        while clock.pending_sleepers() == 0 {
            tokio::task::yield_now().await;
        }
        clock.advance(Duration::from_secs(1));
        assert_eq!(inner.done().await, ScopeError::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_cancel_stops_deadline_timer() {
        let clock = ManualClock::new();
        let root = Scope::background_with_clock(clock.clone());
        let (scope, cancel) = root.with_timeout(Duration::from_secs(5)).unwrap();
        while clock.pending_sleepers() == 0 {
            tokio::task::yield_now().await;
        }

        cancel.cancel();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(clock.pending_sleepers(), 0);
        assert_eq!(scope.err(), Some(ScopeError::Cancelled));
    }

    #[test]
    fn test_deadline_without_runtime_is_resource_error() {
        let root = Scope::background_with_clock(ManualClock::new());
        let err = root.with_timeout(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, JobflowError::ResourceExhausted(_)));
    }

    #[test]
    fn test_values_are_found_through_ancestors() {
        let user: ScopeKey<String> = ScopeKey::new("user");
        let attempt: ScopeKey<u32> = ScopeKey::new("attempt");

        let root = Scope::background();
        let with_user = root.with_value(&user, "ada".to_string());
        let (child, _) = with_user.with_cancel();
        let leaf = child.with_value(&attempt, 3);

        assert_eq!(leaf.value(&user).as_deref(), Some(&"ada".to_string()));
        assert_eq!(leaf.value(&attempt).as_deref(), Some(&3));
        assert!(root.value(&user).is_none());
    }

    #[test]
    fn test_keys_compare_by_identity_not_name() {
        let first: ScopeKey<u32> = ScopeKey::new("id");
        let second: ScopeKey<u32> = ScopeKey::new("id");

        let scope = Scope::background().with_value(&first, 1);
        assert_eq!(scope.value(&first).as_deref(), Some(&1));
        assert!(scope.value(&second).is_none());
    }

    #[test]
    fn test_nearest_binding_shadows() {
        let key: ScopeKey<&'static str> = ScopeKey::new("layer");
        let scope = Scope::background()
            .with_value(&key, "outer")
            .with_value(&key, "inner");
        assert_eq!(scope.value(&key).as_deref(), Some(&"inner"));
    }
}
