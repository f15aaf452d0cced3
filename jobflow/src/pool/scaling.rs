//! Autoscaling decisions.

use super::config::ScalingConfig;
use crate::clock::Instant;

/// Turns backlog samples into resize decisions.
///
/// Pure state machine: the coordinator feeds it samples and applies the
/// sizes it returns.
#[derive(Debug, Clone)]
pub struct ScaleController {
    config: ScalingConfig,
    min_workers: usize,
    max_workers: usize,
    above_since: Option<Instant>,
    below_since: Option<Instant>,
    last_change: Option<Instant>,
}

impl ScaleController {
    /// Creates a controller bounded by `[min_workers, max_workers]`.
    #[must_use]
    pub fn new(config: ScalingConfig, min_workers: usize, max_workers: usize) -> Self {
        Self {
            config,
            min_workers,
            max_workers,
            above_since: None,
            below_since: None,
            last_change: None,
        }
    }

    /// Records a backlog sample. Returns the new worker count when the
    /// pool should be resized.
    pub fn observe(&mut self, now: Instant, backlog: usize, current: usize) -> Option<usize> {
        let target = if backlog > self.config.high_water {
            self.below_since = None;
            let since = *self.above_since.get_or_insert(now);
            (self.held(since, now) && current < self.max_workers).then(|| current + 1)
        } else if backlog < self.config.low_water {
            self.above_since = None;
            let since = *self.below_since.get_or_insert(now);
            (self.held(since, now) && current > self.min_workers).then(|| current - 1)
        } else {
            self.above_since = None;
            self.below_since = None;
            None
        }?;

        if let Some(last) = self.last_change {
            if now.saturating_duration_since(last) < self.config.debounce() {
                return None;
            }
        }
        self.last_change = Some(now);
        self.above_since = None;
        self.below_since = None;
        Some(target)
    }

    fn held(&self, since: Instant, now: Instant) -> bool {
        now.saturating_duration_since(since) >= self.config.window()
    }
}
