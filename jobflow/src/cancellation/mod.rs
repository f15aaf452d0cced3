//! Structured cancellation.
//!
//! This module provides:
//! - [`Scope`], a cancellation tree carrying deadlines and typed values
//! - [`TaskGroup`] for tasks that live and die with a scope
//! - [`run_guarded`] for panic-safe execution raced against a scope

mod guard;
mod key;
mod scope;
mod task_group;

pub use guard::{run_guarded, Guarded};
pub use key::ScopeKey;
pub use scope::{CancelHandle, Scope, ScopeError};
pub use task_group::{TaskFailure, TaskGroup};
