//! Testing utilities for pools and pipelines.
//!
//! This module provides:
//! - Scripted job handlers
//! - Assertions for exactly-once delivery and metric consistency
//! - Harnesses that drive a pool to completion

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_exactly_once, assert_metrics_consistent, assert_skipped, assert_succeeded, count_outcomes,
    count_skipped, OutcomeCounts,
};
pub use fixtures::{feed, manual_scope, run_pool, PoolRun};
pub use mocks::{FlakyHandler, PanickingHandler, RecordingHandler, SlowHandler};
