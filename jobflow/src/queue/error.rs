//! Queue operation outcomes.
//!
//! Failed sends hand the value back so callers can retry, reroute or
//! report it.

use crate::cancellation::ScopeError;
use std::fmt;
use thiserror::Error;

/// A blocking send did not deliver its value.
#[derive(PartialEq, Eq, Error)]
pub enum SendError<T> {
    /// The queue was closed.
    #[error("send on closed queue")]
    Closed(T),
    /// The governing scope became done first.
    #[error("send interrupted: {1}")]
    Cancelled(T, ScopeError),
}

impl<T> SendError<T> {
    /// Returns the undelivered value.
    pub fn into_inner(self) -> T {
        match self {
            Self::Closed(value) | Self::Cancelled(value, _) => value,
        }
    }

    /// Returns true if the queue was closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(_) => f.write_str("Closed(..)"),
            Self::Cancelled(_, cause) => write!(f, "Cancelled(.., {cause:?})"),
        }
    }
}

/// A non-blocking send did not deliver its value.
#[derive(PartialEq, Eq, Error)]
pub enum TrySendError<T> {
    /// The queue had no room, or no parked receiver for a rendezvous queue.
    #[error("queue full")]
    Full(T),
    /// The queue was closed.
    #[error("send on closed queue")]
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Returns the undelivered value.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(value) | Self::Closed(value) => value,
        }
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

/// A blocking receive returned without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvError {
    /// The queue is closed and fully drained.
    #[error("queue closed")]
    Closed,
    /// The governing scope became done first.
    #[error("receive interrupted: {0}")]
    Cancelled(ScopeError),
}

/// A non-blocking receive returned without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TryRecvError {
    /// Nothing is buffered right now.
    #[error("queue empty")]
    Empty,
    /// The queue is closed and fully drained.
    #[error("queue closed")]
    Closed,
}
