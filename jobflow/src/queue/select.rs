//! Multi-way select over queue operations and a scope.

use super::channel::{Parked, Queue, QueueReceiver};
use super::error::{RecvError, SendError, TryRecvError, TrySendError};
use crate::cancellation::{Scope, ScopeError};
use futures::future::select_all;
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::futures::Notified;

/// Which arm of a [`Select`] fired.
#[derive(Debug, PartialEq, Eq)]
pub enum Selected<T> {
    /// A recv arm produced a value.
    Received {
        /// Arm index, in registration order.
        arm: usize,
        /// The received value.
        value: T,
    },
    /// A recv arm's queue is closed and drained.
    RecvClosed {
        /// Arm index.
        arm: usize,
    },
    /// A send arm delivered its value.
    Sent {
        /// Arm index.
        arm: usize,
    },
    /// A send arm's queue is closed. The value is handed back.
    SendClosed {
        /// Arm index.
        arm: usize,
        /// The undelivered value.
        value: T,
    },
    /// The scope became done first. Unsent values are handed back with
    /// their arm index.
    Done {
        /// Why the scope is done.
        cause: ScopeError,
        /// Values of send arms that did not fire.
        unsent: Vec<(usize, T)>,
    },
}

enum Arm<'a, T> {
    Recv(&'a Queue<T>),
    Send(&'a Queue<T>, Option<T>),
}

impl<'a, T> Arm<'a, T> {
    fn queue(&self) -> &'a Queue<T> {
        match *self {
            Self::Recv(q) | Self::Send(q, _) => q,
        }
    }
}

/// A select over any mix of recv-ready, send-ready and scope-done events.
///
/// The first ready arm fires. When several are ready at once, one is picked
/// at random so no arm starves. A done scope is checked before any arm.
///
/// ```rust,ignore
/// let fired = Select::new()
///     .recv(&jobs)
///     .send(&audit, entry)
///     .scope(&scope)
///     .wait()
///     .await;
/// ```
pub struct Select<'a, T> {
    arms: Vec<Arm<'a, T>>,
    scope: Option<&'a Scope>,
}

impl<T> Default for Select<'_, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, T> Select<'a, T> {
    /// Creates an empty select.
    #[must_use]
    pub fn new() -> Self {
        Self {
            arms: Vec::new(),
            scope: None,
        }
    }

    /// Adds an arm that fires when `queue` yields a value or is drained.
    #[must_use]
    pub fn recv(mut self, queue: &'a QueueReceiver<T>) -> Self {
        self.arms.push(Arm::Recv(queue.queue()));
        self
    }

    /// Adds an arm that fires when `queue` accepts `value` or is closed.
    #[must_use]
    pub fn send(mut self, queue: &'a Queue<T>, value: T) -> Self {
        self.arms.push(Arm::Send(queue, Some(value)));
        self
    }

    /// Adds the scope-done arm.
    #[must_use]
    pub fn scope(mut self, scope: &'a Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Fires the first ready arm without waiting.
    pub fn try_select(&mut self) -> Option<Selected<T>> {
        if let Some(cause) = self.scope.and_then(Scope::err) {
            return Some(self.done(cause));
        }
        let n = self.arms.len();
        if n == 0 {
            return None;
        }
        let start = rand::thread_rng().gen_range(0..n);
        (0..n).find_map(|i| self.try_arm((start + i) % n))
    }

    /// Waits for the first arm to fire.
    ///
    /// A select with no arms and no scope never completes.
    pub async fn wait(mut self) -> Selected<T> {
        loop {
            let mut wakers: Vec<Pin<Box<Notified<'a>>>> = self
                .arms
                .iter()
                .map(|arm| {
                    let q = arm.queue();
                    match arm {
                        Arm::Recv(_) => Box::pin(q.readable()),
                        Arm::Send(..) => Box::pin(q.writable()),
                    }
                })
                .collect();
            for waker in &mut wakers {
                waker.as_mut().enable();
            }

            if let Some(fired) = self.try_select() {
                return fired;
            }

            let parked: Vec<Parked<'a, T>> = self
                .arms
                .iter()
                .filter_map(|arm| match *arm {
                    Arm::Recv(q) => Some(q.park()),
                    Arm::Send(..) => None,
                })
                .collect();

            let scope_done = wait_scope(self.scope);
            tokio::select! {
                biased;
                cause = scope_done => return self.done(cause),
                _ = wait_any(wakers) => {}
            }
            drop(parked);
        }
    }

    fn try_arm(&mut self, index: usize) -> Option<Selected<T>> {
        match &mut self.arms[index] {
            Arm::Recv(q) => match q.try_recv() {
                Ok(value) => Some(Selected::Received { arm: index, value }),
                Err(TryRecvError::Closed) => Some(Selected::RecvClosed { arm: index }),
                Err(TryRecvError::Empty) => None,
            },
            Arm::Send(q, slot) => {
                let value = slot.take()?;
                match q.try_send(value) {
                    Ok(()) => Some(Selected::Sent { arm: index }),
                    Err(TrySendError::Closed(value)) => {
                        Some(Selected::SendClosed { arm: index, value })
                    }
                    Err(TrySendError::Full(value)) => {
                        *slot = Some(value);
                        None
                    }
                }
            }
        }
    }

    fn done(&mut self, cause: ScopeError) -> Selected<T> {
        let unsent = self
            .arms
            .iter_mut()
            .enumerate()
            .filter_map(|(i, arm)| match arm {
                Arm::Send(_, slot) => slot.take().map(|v| (i, v)),
                Arm::Recv(_) => None,
            })
            .collect();
        Selected::Done { cause, unsent }
    }
}

async fn wait_scope(scope: Option<&Scope>) -> ScopeError {
    match scope {
        Some(scope) => scope.done().await,
        None => std::future::pending().await,
    }
}

async fn wait_any<F>(wakers: Vec<Pin<Box<F>>>)
where
    F: Future<Output = ()>,
{
    if wakers.is_empty() {
        std::future::pending::<()>().await;
    } else {
        select_all(wakers).await;
    }
}

/// Sends `value` to whichever queue accepts it first.
///
/// Returns the index of the receiving queue. Closed queues are skipped;
/// if every queue is closed the value is handed back as `Closed`.
pub async fn send_any<T>(queues: &[Queue<T>], value: T, scope: &Scope) -> Result<usize, SendError<T>> {
    let mut value = value;
    loop {
        if let Some(cause) = scope.err() {
            return Err(SendError::Cancelled(value, cause));
        }
        let mut wakers: Vec<_> = queues.iter().map(|q| Box::pin(q.writable())).collect();
        for waker in &mut wakers {
            waker.as_mut().enable();
        }

        let n = queues.len();
        let start = if n == 0 { 0 } else { rand::thread_rng().gen_range(0..n) };
        let mut any_open = false;
        for i in (0..n).map(|i| (start + i) % n) {
            match queues[i].try_send(value) {
                Ok(()) => return Ok(i),
                Err(TrySendError::Full(v)) => {
                    any_open = true;
                    value = v;
                }
                Err(TrySendError::Closed(v)) => value = v,
            }
        }
        if !any_open {
            return Err(SendError::Closed(value));
        }

        tokio::select! {
            biased;
            cause = scope.done() => return Err(SendError::Cancelled(value, cause)),
            _ = select_all(wakers) => {}
        }
    }
}

/// Receives from whichever queue has a value first, trying them in a
/// random order.
///
/// Returns the index of the queue the value came from. Reports `Closed`
/// only once every queue is closed and drained.
pub async fn recv_any<T>(queues: &[QueueReceiver<T>], scope: &Scope) -> Result<(usize, T), RecvError> {
    let n = queues.len();
    let start = if n == 0 { 0 } else { rand::thread_rng().gen_range(0..n) };
    let order: Vec<usize> = (0..n).map(|i| (start + i) % n).collect();
    recv_biased(queues, &order, scope).await
}

/// Receives from the first queue in `order` that has a value.
///
/// Indices missing from `order` are never polled. Used for priority
/// classes, where `order` lists the preferred queue first.
pub async fn recv_biased<T>(
    queues: &[QueueReceiver<T>],
    order: &[usize],
    scope: &Scope,
) -> Result<(usize, T), RecvError> {
    loop {
        if let Some(cause) = scope.err() {
            return Err(RecvError::Cancelled(cause));
        }
        let candidates: Vec<(usize, &Queue<T>)> = order
            .iter()
            .filter_map(|&i| queues.get(i).map(|q| (i, q.queue())))
            .collect();
        let mut wakers: Vec<_> = candidates.iter().map(|(_, q)| Box::pin(q.readable())).collect();
        for waker in &mut wakers {
            waker.as_mut().enable();
        }

        let mut open = Vec::with_capacity(candidates.len());
        for &(i, q) in &candidates {
            match q.try_recv() {
                Ok(value) => return Ok((i, value)),
                Err(TryRecvError::Empty) => open.push(q),
                Err(TryRecvError::Closed) => {}
            }
        }
        if open.is_empty() {
            return Err(RecvError::Closed);
        }

        let parked: Vec<_> = open.iter().map(|q| q.park()).collect();
        tokio::select! {
            biased;
            cause = scope.done() => return Err(RecvError::Cancelled(cause)),
            _ = select_all(wakers) => {}
        }
        drop(parked);
    }
}
