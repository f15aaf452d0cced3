//! Assertions over job results and metrics.

use crate::metrics::MetricsSnapshot;
use crate::pool::{JobId, JobResult, Outcome, SkipReason};
use std::collections::HashMap;

/// Outcome totals for a set of results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    /// Successful jobs.
    pub succeeded: usize,
    /// Failed or panicked jobs.
    pub failed: usize,
    /// Skipped jobs.
    pub skipped: usize,
}

impl OutcomeCounts {
    /// Returns the number of results counted.
    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

/// Counts results by outcome.
pub fn count_outcomes<R>(results: &[JobResult<R>]) -> OutcomeCounts {
    results
        .iter()
        .fold(OutcomeCounts::default(), |mut counts, result| {
            match result.outcome {
                Outcome::Success { .. } => counts.succeeded += 1,
                Outcome::Failure { .. } => counts.failed += 1,
                Outcome::Skipped { .. } => counts.skipped += 1,
            }
            counts
        })
}

/// Counts results skipped for `reason`.
pub fn count_skipped<R>(results: &[JobResult<R>], reason: SkipReason) -> usize {
    results
        .iter()
        .filter(|r| r.outcome.skip_reason() == Some(reason))
        .count()
}

/// Asserts that every id in `submitted` has exactly one result and that
/// no result carries an unknown id.
pub fn assert_exactly_once<'a, R>(results: &[JobResult<R>], submitted: impl IntoIterator<Item = &'a JobId>) {
    let mut seen: HashMap<&JobId, usize> = HashMap::new();
    for result in results {
        *seen.entry(&result.job_id).or_default() += 1;
    }

    let mut expected = 0;
    for id in submitted {
        expected += 1;
        match seen.remove(id) {
            Some(1) => {}
            Some(n) => panic!("Expected one result for job {id}, got {n}"),
            None => panic!("Expected a result for job {id}, got none"),
        }
    }
    assert!(
        seen.is_empty(),
        "Got results for {} unknown jobs: {:?}",
        seen.len(),
        seen.keys().collect::<Vec<_>>()
    );
    assert_eq!(results.len(), expected, "Expected {expected} results, got {}", results.len());
}

/// Asserts that a snapshot's counters add up.
pub fn assert_metrics_consistent(snapshot: &MetricsSnapshot) {
    assert!(
        snapshot.is_consistent(),
        "Expected processed + errored + skipped + in_flight == submitted, got {} + {} + {} + {} vs {}",
        snapshot.processed,
        snapshot.errored,
        snapshot.skipped,
        snapshot.in_flight,
        snapshot.submitted
    );
    let by_reason = snapshot.skipped_by_reason;
    assert_eq!(
        by_reason.shutting_down + by_reason.deadline_exceeded + by_reason.cancelled + by_reason.declined,
        snapshot.skipped,
        "Skip reasons do not add up to the skipped total"
    );
}

/// Asserts that a result succeeded.
pub fn assert_succeeded<R: std::fmt::Debug>(result: &JobResult<R>) {
    assert!(
        result.outcome.is_success(),
        "Expected job {} to succeed, got {:?}",
        result.job_id,
        result.outcome
    );
}

/// Asserts that a result was skipped for `reason`.
pub fn assert_skipped<R: std::fmt::Debug>(result: &JobResult<R>, reason: SkipReason) {
    assert_eq!(
        result.outcome.skip_reason(),
        Some(reason),
        "Expected job {} to be skipped ({reason}), got {:?}",
        result.job_id,
        result.outcome
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Completion, MetricsRecorder};
    use crate::pool::FailureKind;
    use std::time::Duration;

    fn result(id: &str, outcome: Outcome<u32>) -> JobResult<u32> {
        JobResult::new(JobId::new(id), Some(0), outcome, 1, Duration::ZERO)
    }

    fn sample() -> Vec<JobResult<u32>> {
        vec![
            result("a", Outcome::Success { value: 1 }),
            result(
                "b",
                Outcome::Failure {
                    kind: FailureKind::Transform,
                    detail: "bad".to_string(),
                },
            ),
            result(
                "c",
                Outcome::Skipped {
                    reason: SkipReason::ShuttingDown,
                },
            ),
        ]
    }

    #[test]
    fn test_count_outcomes() {
        let counts = count_outcomes(&sample());
        assert_eq!(
            counts,
            OutcomeCounts {
                succeeded: 1,
                failed: 1,
                skipped: 1
            }
        );
        assert_eq!(counts.total(), 3);
        assert_eq!(count_skipped(&sample(), SkipReason::ShuttingDown), 1);
    }

    #[test]
    fn test_exactly_once_passes() {
        let ids = [JobId::new("a"), JobId::new("b"), JobId::new("c")];
        assert_exactly_once(&sample(), &ids);
    }

    #[test]
    #[should_panic(expected = "Expected one result for job a")]
    fn test_exactly_once_catches_duplicates() {
        let mut results = sample();
        results.push(result("a", Outcome::Success { value: 2 }));
        let ids = [JobId::new("a"), JobId::new("b"), JobId::new("c")];
        assert_exactly_once(&results, &ids);
    }

    #[test]
    #[should_panic(expected = "Expected a result for job d")]
    fn test_exactly_once_catches_missing() {
        let ids = [JobId::new("a"), JobId::new("b"), JobId::new("c"), JobId::new("d")];
        assert_exactly_once(&sample(), &ids);
    }

    #[test]
    fn test_metrics_consistent() {
        let recorder = MetricsRecorder::new("check");
        recorder.record_submitted();
        recorder.record_submitted();
        recorder.record_started(1);
        recorder.record_finished(Some(0), Completion::Processed, Duration::from_millis(1));
        assert_metrics_consistent(&recorder.snapshot(1));
    }

    #[test]
    #[should_panic(expected = "Expected job c to succeed")]
    fn test_assert_succeeded_fails() {
        assert_succeeded(&sample()[2]);
    }

    #[test]
    fn test_assert_skipped() {
        assert_skipped(&sample()[2], SkipReason::ShuttingDown);
    }
}
