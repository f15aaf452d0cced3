//! Stage transforms, per-stage options and stage errors.

use super::retry::RetryConfig;
use crate::cancellation::Scope;
use crate::errors::{ConfigError, TransformError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// What a transform did with its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome<T> {
    /// Zero or more items to pass downstream, in order.
    Produce(Vec<T>),
    /// The input failed. Routed according to the stage's [`ErrorPolicy`].
    Error(TransformError),
    /// The transform declined the input. Nothing is emitted.
    Skip(String),
}

impl<T> StageOutcome<T> {
    /// Produces a single item.
    #[must_use]
    pub fn one(item: T) -> Self {
        Self::Produce(vec![item])
    }

    /// Produces nothing.
    #[must_use]
    pub fn none() -> Self {
        Self::Produce(Vec::new())
    }
}

impl<T> From<Result<T, TransformError>> for StageOutcome<T> {
    fn from(result: Result<T, TransformError>) -> Self {
        match result {
            Ok(item) => Self::one(item),
            Err(err) => Self::Error(err),
        }
    }
}

/// Execution context handed to a transform.
#[derive(Debug, Clone)]
pub struct StageContext {
    stage: Arc<str>,
    worker_id: usize,
    attempt: u32,
    scope: Scope,
}

impl StageContext {
    pub(crate) fn new(stage: Arc<str>, worker_id: usize, attempt: u32, scope: Scope) -> Self {
        Self {
            stage,
            worker_id,
            attempt,
            scope,
        }
    }

    /// Returns the stage name.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Returns the worker index within the stage.
    #[must_use]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Returns the 1-based attempt number.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns the scope governing this item.
    ///
    /// Long-running transforms should observe it; when a per-item timeout
    /// is configured its deadline is already applied.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

/// A stage transform.
///
/// `apply_batch` is only called for stages configured with a batch size.
/// The default runs `apply` on each item in order and stops at the first
/// non-produce outcome.
#[async_trait]
pub trait Transform<T: Send + 'static>: Send + Sync {
    /// Transforms a single item.
    async fn apply(&self, item: T, ctx: &StageContext) -> StageOutcome<T>;

    /// Transforms a batch of items.
    async fn apply_batch(&self, items: Vec<T>, ctx: &StageContext) -> StageOutcome<T> {
        let mut produced = Vec::with_capacity(items.len());
        for item in items {
            match self.apply(item, ctx).await {
                StageOutcome::Produce(out) => produced.extend(out),
                other => return other,
            }
        }
        StageOutcome::Produce(produced)
    }
}

/// A transform backed by an async closure. See [`from_fn`].
pub struct FnTransform<F, T> {
    f: F,
    _item: PhantomData<fn(T) -> T>,
}

/// Wraps an async closure as a [`Transform`].
///
/// ```rust,ignore
/// let square = from_fn(|x: u64, _ctx| async move { StageOutcome::one(x * x) });
/// ```
pub fn from_fn<T, F, Fut>(f: F) -> FnTransform<F, T>
where
    T: Send + 'static,
    F: Fn(T, StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = StageOutcome<T>> + Send,
{
    FnTransform { f, _item: PhantomData }
}

#[async_trait]
impl<T, F, Fut> Transform<T> for FnTransform<F, T>
where
    T: Send + 'static,
    F: Fn(T, StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = StageOutcome<T>> + Send,
{
    async fn apply(&self, item: T, ctx: &StageContext) -> StageOutcome<T> {
        (self.f)(item, ctx.clone()).await
    }
}

/// What a stage does with a failed item.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy", content = "retry")]
pub enum ErrorPolicy {
    /// Route the error and cancel the whole pipeline.
    Halt,
    /// Route the error and continue with the next item.
    #[default]
    Skip,
    /// Retry the item, then route the error once attempts run out.
    Retry(RetryConfig),
}

/// Per-stage options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOptions {
    /// Failure handling.
    pub error_policy: ErrorPolicy,
    /// Maximum items per second across the stage's workers.
    pub rate_limit: Option<f64>,
    /// Items handed to [`Transform::apply_batch`] at once.
    pub batch_size: Option<usize>,
    /// Longest a partial batch waits before it is flushed.
    pub batch_flush: Option<Duration>,
    /// Deadline applied to each item or batch.
    pub per_item_timeout: Option<Duration>,
}

impl StageOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the error policy.
    #[must_use]
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Limits throughput to `per_second` items.
    #[must_use]
    pub fn with_rate_limit(mut self, per_second: f64) -> Self {
        self.rate_limit = Some(per_second);
        self
    }

    /// Enables batching. `flush` bounds how long a partial batch waits.
    #[must_use]
    pub fn with_batching(mut self, size: usize, flush: Option<Duration>) -> Self {
        self.batch_size = Some(size);
        self.batch_flush = flush;
        self
    }

    /// Sets the per-item timeout.
    #[must_use]
    pub fn with_per_item_timeout(mut self, timeout: Duration) -> Self {
        self.per_item_timeout = Some(timeout);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if let Some(rate) = self.rate_limit {
            crate::throttle::bucket_shape(rate)?;
        }
        if self.batch_size == Some(0) {
            return Err(ConfigError::new("batch_size", "must be at least 1"));
        }
        if self.batch_flush == Some(Duration::ZERO) {
            return Err(ConfigError::new("batch_flush", "must be positive"));
        }
        if self.per_item_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::new("per_item_timeout", "must be positive"));
        }
        if let ErrorPolicy::Retry(retry) = &self.error_policy {
            if retry.max_attempts == 0 {
                return Err(ConfigError::new("max_attempts", "must be at least 1"));
            }
        }
        Ok(())
    }
}

/// An item failure, as delivered on the pipeline's error queue.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("stage {stage} worker {worker_id}: {kind}: {detail}")]
pub struct StageError {
    /// Stage that failed.
    pub stage: String,
    /// Worker within the stage.
    pub worker_id: usize,
    /// Error kind, `panic` for recovered panics.
    pub kind: String,
    /// Error detail.
    pub detail: String,
    /// Attempts made before giving up.
    pub attempts: u32,
    /// When the failure was recorded.
    pub occurred_at: DateTime<Utc>,
}

impl StageError {
    pub(crate) fn new(stage: &str, worker_id: usize, error: TransformError, attempts: u32) -> Self {
        Self {
            stage: stage.to_string(),
            worker_id,
            kind: error.kind,
            detail: error.detail,
            attempts,
            occurred_at: Utc::now(),
        }
    }
}

/// A stage as registered with a [`PipelineBuilder`](super::PipelineBuilder).
pub struct StageSpec<T> {
    pub(crate) name: Arc<str>,
    pub(crate) workers: usize,
    pub(crate) capacity: usize,
    pub(crate) transform: Arc<dyn Transform<T>>,
    pub(crate) options: StageOptions,
}

impl<T: Send + 'static> StageSpec<T> {
    /// Describes a stage.
    pub fn new(
        name: impl AsRef<str>,
        workers: usize,
        capacity: usize,
        transform: impl Transform<T> + 'static,
        options: StageOptions,
    ) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            workers,
            capacity,
            transform: Arc::new(transform),
            options,
        }
    }

    /// Returns the stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::new("name", "stage name must not be empty"));
        }
        if self.workers == 0 {
            return Err(ConfigError::new(
                "workers",
                format!("stage '{}' needs at least one worker", self.name),
            ));
        }
        self.options.validate()
    }
}

impl<T> std::fmt::Debug for StageSpec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageSpec")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .field("capacity", &self.capacity)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubler;

    #[async_trait]
    impl Transform<u32> for Doubler {
        async fn apply(&self, item: u32, _ctx: &StageContext) -> StageOutcome<u32> {
            if item == 0 {
                StageOutcome::Skip("zero".into())
            } else {
                StageOutcome::one(item * 2)
            }
        }
    }

    fn ctx() -> StageContext {
        StageContext::new(Arc::from("double"), 0, 1, Scope::background())
    }

    #[tokio::test]
    async fn test_default_batch_applies_in_order() {
        let out = Doubler.apply_batch(vec![1, 2, 3], &ctx()).await;
        assert_eq!(out, StageOutcome::Produce(vec![2, 4, 6]));
    }

    #[tokio::test]
    async fn test_default_batch_stops_at_first_skip() {
        let out = Doubler.apply_batch(vec![1, 0, 3], &ctx()).await;
        assert_eq!(out, StageOutcome::Skip("zero".into()));
    }

    #[tokio::test]
    async fn test_from_fn_sees_context() {
        let t = from_fn(|x: u32, ctx: StageContext| async move {
            StageOutcome::one(x + u32::try_from(ctx.worker_id()).unwrap_or(0) + ctx.attempt())
        });
        assert_eq!(t.apply(10, &ctx()).await, StageOutcome::one(11));
    }

    #[test]
    fn test_result_into_outcome() {
        let ok: StageOutcome<u32> = Ok(3).into();
        let err: StageOutcome<u32> = Err(TransformError::new("io", "eof")).into();
        assert_eq!(ok, StageOutcome::one(3));
        assert!(matches!(err, StageOutcome::Error(e) if e.kind == "io"));
    }

    #[test]
    fn test_options_validation() {
        assert!(StageOptions::new().validate().is_ok());
        assert_eq!(
            StageOptions::new().with_batching(0, None).validate().unwrap_err().field,
            "batch_size"
        );
        assert_eq!(
            StageOptions::new().with_rate_limit(-1.0).validate().unwrap_err().field,
            "rate_limit"
        );
        let no_attempts = StageOptions::new().with_error_policy(ErrorPolicy::Retry(RetryConfig::new().with_max_attempts(0)));
        assert_eq!(no_attempts.validate().unwrap_err().field, "max_attempts");
    }

    #[test]
    fn test_stage_spec_requires_workers() {
        let spec = StageSpec::new("double", 0, 1, Doubler, StageOptions::new());
        assert_eq!(spec.validate().unwrap_err().field, "workers");
    }

    #[test]
    fn test_stage_error_display() {
        let err = StageError::new("parse", 2, TransformError::new("io", "eof"), 3);
        assert_eq!(err.to_string(), "stage parse worker 2: io: eof");
        assert_eq!(err.attempts, 3);
    }
}
