//! Panic-recovering execution raced against a scope.

use super::{Scope, ScopeError};
use crate::errors::panic_message;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

/// How a guarded future ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guarded<T> {
    /// The future ran to completion.
    Completed(T),
    /// The future panicked. Carries the panic message.
    Panicked(String),
    /// The scope became done first. The future was dropped.
    Interrupted(ScopeError),
}

impl<T> Guarded<T> {
    /// Returns the value if the future completed.
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            _ => None,
        }
    }
}

/// Runs `fut` until it completes, panics, or `scope` becomes done.
///
/// A scope that is already done wins before the future is polled.
pub async fn run_guarded<F>(fut: F, scope: &Scope) -> Guarded<F::Output>
where
    F: Future,
{
    if let Some(cause) = scope.err() {
        return Guarded::Interrupted(cause);
    }

    tokio::select! {
        biased;
        cause = scope.done() => Guarded::Interrupted(cause),
        outcome = AssertUnwindSafe(fut).catch_unwind() => match outcome {
            Ok(value) => Guarded::Completed(value),
            Err(payload) => Guarded::Panicked(panic_message(payload.as_ref())),
        },
    }
}
