//! Staged pipelines.
//!
//! This module provides:
//! - Stage transforms and per-stage options
//! - Pipeline builder with validation
//! - The execution engine with ordered end-of-stream propagation
//! - Retry with backoff and jitter

mod builder;
mod engine;
mod retry;
mod stage;

#[cfg(test)]
mod integration_tests;

pub use builder::PipelineBuilder;
pub use engine::{Pipeline, PipelineReport};
pub use retry::{
    should_retry, with_retry, AttemptError, BackoffStrategy, JitterStrategy, RetryConfig, RetryDecision,
    RetryState,
};
pub use stage::{
    from_fn, ErrorPolicy, FnTransform, StageContext, StageError, StageOptions, StageOutcome, StageSpec,
    Transform,
};
