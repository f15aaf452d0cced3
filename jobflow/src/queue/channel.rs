//! Bounded multi-producer, multi-consumer FIFO queue.

use super::error::{RecvError, SendError, TryRecvError, TrySendError};
use crate::cancellation::{Scope, ScopeError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Observable lifecycle of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// Accepting sends.
    Open,
    /// Closed, but buffered items remain to be received.
    Draining,
    /// Closed and empty. Terminal.
    Closed,
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

struct Buffer<T> {
    items: VecDeque<T>,
    closed: bool,
    /// Receivers currently suspended waiting for an item.
    parked: usize,
    sent: u64,
    received: u64,
}

pub(crate) struct Shared<T> {
    capacity: Option<usize>,
    buffer: Mutex<Buffer<T>>,
    /// Signalled when an item is pushed or the queue closes.
    readable: Notify,
    /// Signalled when room frees up, a receiver parks, or the queue closes.
    writable: Notify,
}

impl<T> Shared<T> {
    fn has_room(&self, buffer: &Buffer<T>) -> bool {
        match self.capacity {
            None => true,
            // A rendezvous queue admits one item per suspended receiver.
            Some(cap) => buffer.items.len() < cap + buffer.parked,
        }
    }

    /// True when more items are buffered than capacity plus parked
    /// receivers allow, which happens when a receiver leaves after a
    /// rendezvous sender already handed it an item.
    fn is_overcommitted(&self, buffer: &Buffer<T>) -> bool {
        self.capacity
            .is_some_and(|cap| buffer.items.len() > cap + buffer.parked)
    }
}

/// Marks a receiver as suspended until dropped or disarmed.
pub(crate) struct Parked<'a, T> {
    shared: &'a Shared<T>,
    armed: bool,
}

impl<T> Drop for Parked<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            let stranded = {
                let mut buffer = self.shared.buffer.lock();
                buffer.parked = buffer.parked.saturating_sub(1);
                self.shared.is_overcommitted(&buffer)
            };
            // Pass the handed-off item on to another receiver.
            if stranded {
                self.shared.readable.notify_waiters();
            }
        }
    }
}

/// A typed FIFO queue with a fixed capacity.
///
/// Cloning yields another handle to the same queue, so any number of
/// producers and consumers can share it. Capacity `0` makes every send a
/// rendezvous with a receiver. Closing is one-way: later sends fail with
/// `Closed`, receivers drain what is buffered and then observe `Closed`.
pub struct Queue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Queue<T> {
    /// Creates a queue holding at most `capacity` buffered items.
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity))
    }

    /// Creates a queue without a capacity bound.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            shared: Arc::new(Shared {
                capacity,
                buffer: Mutex::new(Buffer {
                    items: VecDeque::with_capacity(capacity.unwrap_or(0).min(1024)),
                    closed: false,
                    parked: 0,
                    sent: 0,
                    received: 0,
                }),
                readable: Notify::new(),
                writable: Notify::new(),
            }),
        }
    }

    /// Sends `value`, waiting for room while the queue is full.
    ///
    /// A done scope wins over available room, so a cancelled producer never
    /// delivers.
    pub async fn send(&self, value: T, scope: &Scope) -> Result<(), SendError<T>> {
        let mut value = value;
        loop {
            if let Some(cause) = scope.err() {
                return Err(SendError::Cancelled(value, cause));
            }

            let writable = self.shared.writable.notified();
            tokio::pin!(writable);
            writable.as_mut().enable();

            match self.try_send(value) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Closed(v)) => return Err(SendError::Closed(v)),
                Err(TrySendError::Full(v)) => value = v,
            }

            tokio::select! {
                biased;
                cause = scope.done() => return Err(SendError::Cancelled(value, cause)),
                () = &mut writable => {}
            }
        }
    }

    /// Sends `value` only if it can be accepted right now.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        {
            let mut buffer = self.shared.buffer.lock();
            if buffer.closed {
                return Err(TrySendError::Closed(value));
            }
            if !self.shared.has_room(&buffer) {
                return Err(TrySendError::Full(value));
            }
            buffer.items.push_back(value);
            buffer.sent += 1;
        }
        self.shared.readable.notify_waiters();
        Ok(())
    }

    /// Receives the next item, waiting while the queue is empty and open.
    ///
    /// On a rendezvous queue an item handed to this receiver before its
    /// scope ended is still returned, since the sender already saw the
    /// hand-off succeed.
    pub async fn recv(&self, scope: &Scope) -> Result<T, RecvError> {
        let mut parked: Option<Parked<'_, T>> = None;
        loop {
            if let Some(cause) = scope.err() {
                return self.claim_or(parked.as_mut(), cause);
            }

            let readable = self.shared.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();

            match self.pop(parked.as_mut()) {
                Ok(value) => return Ok(value),
                Err(TryRecvError::Closed) => return Err(RecvError::Closed),
                Err(TryRecvError::Empty) => {}
            }
            if parked.is_none() {
                parked = Some(self.park());
            }

            tokio::select! {
                biased;
                cause = scope.done() => return self.claim_or(parked.as_mut(), cause),
                () = &mut readable => {}
            }
        }
    }

    fn claim_or(&self, parked: Option<&mut Parked<'_, T>>, cause: ScopeError) -> Result<T, RecvError> {
        parked
            .and_then(|parked| self.claim_handed_off(parked))
            .ok_or(RecvError::Cancelled(cause))
    }

    /// Takes the item a rendezvous sender handed to `parked`, if any.
    fn claim_handed_off(&self, parked: &mut Parked<'_, T>) -> Option<T> {
        if !parked.armed {
            return None;
        }
        let value = {
            let mut buffer = self.shared.buffer.lock();
            let cap = self.shared.capacity?;
            // Leaving would strand an item only if every other slot is taken.
            if buffer.items.len() < cap + buffer.parked {
                return None;
            }
            let value = buffer.items.pop_front()?;
            buffer.received += 1;
            buffer.parked = buffer.parked.saturating_sub(1);
            parked.armed = false;
            value
        };
        self.shared.writable.notify_waiters();
        Some(value)
    }

    /// Appends `value` ignoring the capacity bound.
    ///
    /// Used for results that must not be lost once waiting for room is no
    /// longer allowed. Fails only if the queue is closed.
    pub(crate) fn force_send(&self, value: T) -> Result<(), T> {
        {
            let mut buffer = self.shared.buffer.lock();
            if buffer.closed {
                return Err(value);
            }
            buffer.items.push_back(value);
            buffer.sent += 1;
        }
        self.shared.readable.notify_waiters();
        Ok(())
    }

    /// Receives an item only if one is buffered right now.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.pop(None)
    }

    /// Receives until the queue is closed and drained.
    pub async fn recv_all(&self) -> Vec<T> {
        let scope = Scope::background();
        let mut items = Vec::new();
        while let Ok(item) = self.recv(&scope).await {
            items.push(item);
        }
        items
    }

    /// Closes the queue. Returns `true` for the call that closed it.
    pub fn close(&self) -> bool {
        {
            let mut buffer = self.shared.buffer.lock();
            if buffer.closed {
                return false;
            }
            buffer.closed = true;
        }
        self.shared.readable.notify_waiters();
        self.shared.writable.notify_waiters();
        true
    }

    /// Returns the queue's lifecycle state.
    #[must_use]
    pub fn state(&self) -> QueueState {
        let buffer = self.shared.buffer.lock();
        match (buffer.closed, buffer.items.is_empty()) {
            (false, _) => QueueState::Open,
            (true, false) => QueueState::Draining,
            (true, true) => QueueState::Closed,
        }
    }

    /// Returns true once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.buffer.lock().closed
    }

    /// Returns the number of buffered items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.buffer.lock().items.len()
    }

    /// Returns true if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the capacity, or `None` for an unbounded queue.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.shared.capacity
    }

    /// Returns how many items were ever accepted.
    #[must_use]
    pub fn sent_count(&self) -> u64 {
        self.shared.buffer.lock().sent
    }

    /// Returns how many items were ever received.
    #[must_use]
    pub fn received_count(&self) -> u64 {
        self.shared.buffer.lock().received
    }

    /// Returns a receive-only handle to this queue.
    #[must_use]
    pub fn receiver(&self) -> QueueReceiver<T> {
        QueueReceiver {
            queue: self.clone(),
        }
    }

    /// Returns true if both handles refer to the same queue.
    #[must_use]
    pub fn same_queue(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn readable(&self) -> Notified<'_> {
        self.shared.readable.notified()
    }

    pub(crate) fn writable(&self) -> Notified<'_> {
        self.shared.writable.notified()
    }

    /// Registers a suspended receiver, letting a rendezvous sender through.
    pub(crate) fn park(&self) -> Parked<'_, T> {
        self.shared.buffer.lock().parked += 1;
        self.shared.writable.notify_waiters();
        Parked {
            shared: &self.shared,
            armed: true,
        }
    }

    /// Pops the head item. A parked receiver that ends its wait here is
    /// unparked under the same lock.
    pub(crate) fn pop(&self, parked: Option<&mut Parked<'_, T>>) -> Result<T, TryRecvError> {
        let popped = {
            let mut buffer = self.shared.buffer.lock();
            let popped = match buffer.items.pop_front() {
                Some(value) => {
                    buffer.received += 1;
                    Ok(value)
                }
                None if buffer.closed => Err(TryRecvError::Closed),
                None => return Err(TryRecvError::Empty),
            };
            if let Some(parked) = parked {
                if parked.armed {
                    parked.armed = false;
                    buffer.parked = buffer.parked.saturating_sub(1);
                }
            }
            popped
        };
        if popped.is_ok() {
            self.shared.writable.notify_waiters();
        }
        popped
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buffer = self.shared.buffer.lock();
        f.debug_struct("Queue")
            .field("capacity", &self.shared.capacity)
            .field("len", &buffer.items.len())
            .field("closed", &buffer.closed)
            .field("parked", &buffer.parked)
            .finish()
    }
}

/// A receive-only view of a [`Queue`].
///
/// Handed out wherever the caller should consume but never produce or
/// close, such as pool results and pipeline outputs.
pub struct QueueReceiver<T> {
    queue: Queue<T>,
}

impl<T> Clone for QueueReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl<T> QueueReceiver<T> {
    /// Receives the next item. See [`Queue::recv`].
    pub async fn recv(&self, scope: &Scope) -> Result<T, RecvError> {
        self.queue.recv(scope).await
    }

    /// Receives an item only if one is buffered right now.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.queue.try_recv()
    }

    /// Receives until the queue is closed and drained.
    pub async fn recv_all(&self) -> Vec<T> {
        self.queue.recv_all().await
    }

    /// Returns the queue's lifecycle state.
    #[must_use]
    pub fn state(&self) -> QueueState {
        self.queue.state()
    }

    /// Returns true once the producer side closed the queue.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Returns the number of buffered items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Returns the capacity, or `None` for an unbounded queue.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.queue.capacity()
    }

    /// Returns how many items were ever received.
    #[must_use]
    pub fn received_count(&self) -> u64 {
        self.queue.received_count()
    }

    pub(crate) fn queue(&self) -> &Queue<T> {
        &self.queue
    }
}

impl<T> fmt::Debug for QueueReceiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("QueueReceiver").field(&self.queue).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, assert_ready_eq, task};

    #[tokio::test]
    async fn test_fifo_within_one_producer() {
        let q = Queue::bounded(4);
        let scope = Scope::background();
        for i in 0..4 {
            q.send(i, &scope).await.unwrap();
        }
        q.close();
        assert_eq!(q.recv_all().await, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_try_send_full_and_closed() {
        let q = Queue::bounded(1);
        assert!(q.try_send(1).is_ok());
        assert_eq!(q.try_send(2), Err(TrySendError::Full(2)));
        assert!(q.close());
        assert!(!q.close());
        assert_eq!(q.try_send(3), Err(TrySendError::Closed(3)));
    }

    #[test]
    fn test_close_drains_then_reports_closed() {
        let q = Queue::bounded(2);
        q.try_send("a").unwrap();
        q.close();
        assert_eq!(q.state(), QueueState::Draining);
        assert_eq!(q.try_recv(), Ok("a"));
        assert_eq!(q.state(), QueueState::Closed);
        assert_eq!(q.try_recv(), Err(TryRecvError::Closed));
    }

    #[test]
    fn test_try_recv_empty_on_open_queue() {
        let q: Queue<u8> = Queue::bounded(1);
        assert_eq!(q.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(q.state(), QueueState::Open);
    }

    #[test]
    fn test_recv_wakes_on_send() {
        let q = Queue::bounded(1);
        let scope = Scope::background();
        let mut recv = task::spawn(q.recv(&scope));
        assert_pending!(recv.poll());

        q.try_send(7).unwrap();
        assert!(recv.is_woken());
        assert_ready_eq!(recv.poll(), Ok(7));
    }

    #[test]
    fn test_send_blocks_while_full() {
        let q = Queue::bounded(1);
        let scope = Scope::background();
        q.try_send(1).unwrap();

        let mut send = task::spawn(q.send(2, &scope));
        assert_pending!(send.poll());

        assert_eq!(q.try_recv(), Ok(1));
        assert!(send.is_woken());
        assert_ready!(send.poll()).unwrap();
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_rendezvous_needs_a_waiting_receiver() {
        let q = Queue::bounded(0);
        let scope = Scope::background();
        assert_eq!(q.try_send(1), Err(TrySendError::Full(1)));

        let mut recv = task::spawn(q.recv(&scope));
        assert_pending!(recv.poll());

        // One parked receiver admits exactly one item.
        assert!(q.try_send(1).is_ok());
        assert_eq!(q.try_send(2), Err(TrySendError::Full(2)));
        assert_ready_eq!(recv.poll(), Ok(1));
        assert_eq!(q.try_send(3), Err(TrySendError::Full(3)));
    }

    #[test]
    fn test_cancelled_receiver_unparks() {
        let q: Queue<u8> = Queue::bounded(0);
        let scope = Scope::background();
        let mut recv = task::spawn(q.recv(&scope));
        assert_pending!(recv.poll());
        drop(recv);
        assert_eq!(q.try_send(1), Err(TrySendError::Full(1)));
    }

    #[test]
    fn test_cancelled_receiver_keeps_handed_off_item() {
        let q = Queue::bounded(0);
        let (scope, cancel) = Scope::background().with_cancel();
        let mut recv = task::spawn(q.recv(&scope));
        assert_pending!(recv.poll());

        assert!(q.try_send(1).is_ok());
        cancel.cancel();
        assert_ready_eq!(recv.poll(), Ok(1));
        assert!(q.is_empty());
        assert_eq!(q.received_count(), 1);
    }

    #[test]
    fn test_dropped_receiver_passes_item_on() {
        let q = Queue::bounded(0);
        let scope = Scope::background();
        let mut first = task::spawn(q.recv(&scope));
        let mut second = task::spawn(q.recv(&scope));
        assert_pending!(first.poll());
        assert_pending!(second.poll());

        assert!(q.try_send(1).is_ok());
        assert!(q.try_send(2).is_ok());
        drop(first);
        assert_ready_eq!(second.poll(), Ok(1));

        // The second item is the next receiver's, and no new send fits.
        assert_eq!(q.try_send(3), Err(TrySendError::Full(3)));
        assert_eq!(q.try_recv(), Ok(2));
        assert!(q.is_empty());
    }

    #[test]
    fn test_force_send_ignores_capacity() {
        let q = Queue::bounded(1);
        q.try_send(1).unwrap();
        assert_eq!(q.force_send(2), Ok(()));
        assert_eq!(q.len(), 2);
        q.close();
        assert_eq!(q.force_send(3), Err(3));
        assert_eq!(q.state(), QueueState::Draining);
        assert_eq!(q.try_recv(), Ok(1));
        assert_eq!(q.try_recv(), Ok(2));
        assert_eq!(q.try_recv(), Err(TryRecvError::Closed));
    }

    #[test]
    fn test_close_wakes_blocked_receiver() {
        let q: Queue<u8> = Queue::bounded(1);
        let scope = Scope::background();
        let mut recv = task::spawn(q.recv(&scope));
        assert_pending!(recv.poll());

        q.close();
        assert!(recv.is_woken());
        assert_ready_eq!(recv.poll(), Err(RecvError::Closed));
    }

    #[test]
    fn test_close_fails_blocked_sender() {
        let q = Queue::bounded(0);
        let scope = Scope::background();
        let mut send = task::spawn(q.send(5, &scope));
        assert_pending!(send.poll());

        q.close();
        assert!(send.is_woken());
        assert_ready_eq!(send.poll(), Err(SendError::Closed(5)));
    }

    #[tokio::test]
    async fn test_cancellation_wins_over_ready_data() {
        let q = Queue::bounded(1);
        q.try_send(1).unwrap();
        let (scope, cancel) = Scope::background().with_cancel();
        cancel.cancel();

        assert_eq!(
            q.recv(&scope).await,
            Err(RecvError::Cancelled(ScopeError::Cancelled))
        );
        let err = q.send(2, &scope).await.unwrap_err();
        assert_eq!(err.into_inner(), 2);
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_send_observes_deadline() {
        let q = Queue::bounded(0);
        let (scope, _cancel) = Scope::background()
            .with_timeout(Duration::from_millis(30))
            .unwrap();
        let err = q.send("late", &scope).await.unwrap_err();
        assert_eq!(err, SendError::Cancelled("late", ScopeError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_many_producers_many_consumers() {
        let q = Queue::bounded(2);
        let scope = Scope::background();

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let q = q.clone();
                let scope = scope.clone();
                tokio::spawn(async move {
                    for i in 0..25 {
                        q.send(p * 100 + i, &scope).await.unwrap();
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let rx = q.receiver();
                tokio::spawn(async move { rx.recv_all().await })
            })
            .collect();

        for p in producers {
            p.await.unwrap();
        }
        q.close();

        let mut all = Vec::new();
        for c in consumers {
            all.extend(c.await.unwrap());
        }
        all.sort_unstable();
        let mut expected: Vec<_> = (0..4).flat_map(|p| (0..25).map(move |i| p * 100 + i)).collect();
        expected.sort_unstable();
        assert_eq!(all, expected);
        assert_eq!(q.sent_count(), 100);
        assert_eq!(q.received_count(), 100);
    }
}
