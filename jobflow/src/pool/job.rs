//! Jobs and their results.

use crate::cancellation::ScopeError;
use crate::metrics::Completion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Identifies a job across submission and result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Wraps a caller-chosen id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a time-ordered UUID v7 id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A unit of work submitted to a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job<J> {
    /// Job id, echoed on the result.
    pub id: JobId,
    /// Handler input.
    pub payload: J,
    /// Priority class. Higher values are served first; `None` is the
    /// lowest class.
    pub priority: Option<u8>,
    /// Deadline for this job, overriding the pool default.
    pub timeout: Option<Duration>,
    /// Attempts allowed, overriding the pool retry policy.
    pub max_attempts: Option<u32>,
}

impl<J> Job<J> {
    /// Creates a job with a generated id.
    #[must_use]
    pub fn new(payload: J) -> Self {
        Self::with_id(JobId::generate(), payload)
    }

    /// Creates a job with a caller-chosen id.
    #[must_use]
    pub fn with_id(id: impl Into<JobId>, payload: J) -> Self {
        Self {
            id: id.into(),
            payload,
            priority: None,
            timeout: None,
            max_attempts: None,
        }
    }

    /// Sets the priority class.
    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the job deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the number of attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }
}

/// Why a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// The handler returned an error.
    Transform,
    /// The handler panicked.
    WorkerPanic,
    /// The worker could not set up the job, e.g. arm its deadline.
    ResourceExhausted,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transform => "transform",
            Self::WorkerPanic => "worker-panic",
            Self::ResourceExhausted => "resource-exhausted",
        })
    }
}

/// Why a job or item was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// Still queued when the pool stopped.
    ShuttingDown,
    /// A job deadline or the shutdown grace period expired.
    DeadlineExceeded,
    /// The pool scope was cancelled.
    Cancelled,
    /// A pipeline transform declined the item.
    Declined,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ShuttingDown => "shutting-down",
            Self::DeadlineExceeded => "deadline-exceeded",
            Self::Cancelled => "cancelled",
            Self::Declined => "declined",
        })
    }
}

impl From<ScopeError> for SkipReason {
    fn from(cause: ScopeError) -> Self {
        match cause {
            ScopeError::Cancelled => Self::Cancelled,
            ScopeError::DeadlineExceeded => Self::DeadlineExceeded,
        }
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome<R> {
    /// The handler returned a value.
    Success {
        /// Handler output.
        value: R,
    },
    /// The handler failed or panicked.
    Failure {
        /// Failure category.
        kind: FailureKind,
        /// Error detail or panic message.
        detail: String,
    },
    /// The job never completed.
    Skipped {
        /// Why.
        reason: SkipReason,
    },
}

impl<R> Outcome<R> {
    /// Returns true for a success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Returns true for a failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }

    /// Returns true for a skip.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }

    /// Returns the value of a success.
    pub fn value(&self) -> Option<&R> {
        match self {
            Self::Success { value } => Some(value),
            _ => None,
        }
    }

    /// Returns the skip reason, if skipped.
    #[must_use]
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            Self::Skipped { reason } => Some(*reason),
            _ => None,
        }
    }

    pub(crate) fn completion(&self) -> Completion {
        match self {
            Self::Success { .. } => Completion::Processed,
            Self::Failure { .. } => Completion::Errored,
            Self::Skipped { reason } => Completion::Skipped(*reason),
        }
    }
}

/// The record emitted for every accepted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult<R> {
    /// The job's id.
    pub job_id: JobId,
    /// Worker that ran the job; `None` if it never reached one.
    pub worker_id: Option<usize>,
    /// How the job ended.
    pub outcome: Outcome<R>,
    /// Attempts made.
    pub attempts: u32,
    /// Time spent in the handler, including retry backoff.
    pub duration: Duration,
    /// Names of the pools or stages the job passed through, in order.
    pub stages: Vec<String>,
    /// When the result was produced.
    pub finished_at: DateTime<Utc>,
}

impl<R> JobResult<R> {
    pub(crate) fn new(
        job_id: JobId,
        worker_id: Option<usize>,
        outcome: Outcome<R>,
        attempts: u32,
        duration: Duration,
    ) -> Self {
        Self {
            job_id,
            worker_id,
            outcome,
            attempts,
            duration,
            stages: Vec::new(),
            finished_at: Utc::now(),
        }
    }

    /// Appends `stage` to the traversed stages.
    #[must_use]
    pub(crate) fn traversed(mut self, stage: impl Into<String>) -> Self {
        self.stages.push(stage.into());
        self
    }

    /// Returns the value of a successful job.
    pub fn value(&self) -> Option<&R> {
        self.outcome.value()
    }
}
