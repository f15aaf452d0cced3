//! Pool configuration.

use crate::errors::ConfigError;
use crate::pipeline::RetryConfig;
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backlog-driven autoscaling.
///
/// The coordinator samples the input backlog every `sample_interval_ms`.
/// A backlog above `high_water` for `window_ms` adds a worker; one below
/// `low_water` for `window_ms` removes one. Consecutive changes are at
/// least `debounce_ms` apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// Whether autoscaling runs.
    pub enabled: bool,
    /// Backlog above which the pool grows.
    pub high_water: usize,
    /// Backlog below which the pool shrinks.
    pub low_water: usize,
    /// How long a condition must hold.
    pub window_ms: u64,
    /// Minimum time between changes.
    pub debounce_ms: u64,
    /// Backlog sampling period.
    pub sample_interval_ms: u64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            high_water: 16,
            low_water: 1,
            window_ms: 1_000,
            debounce_ms: 2_000,
            sample_interval_ms: 100,
        }
    }
}

impl ScalingConfig {
    /// Enabled scaling with the given water marks and default timings.
    #[must_use]
    pub fn enabled(high_water: usize, low_water: usize) -> Self {
        Self {
            enabled: true,
            high_water,
            low_water,
            ..Self::default()
        }
    }

    /// Sets the window.
    #[must_use]
    pub fn with_window_ms(mut self, window_ms: u64) -> Self {
        self.window_ms = window_ms;
        self
    }

    /// Sets the debounce interval.
    #[must_use]
    pub fn with_debounce_ms(mut self, debounce_ms: u64) -> Self {
        self.debounce_ms = debounce_ms;
        self
    }

    /// Sets the sampling period.
    #[must_use]
    pub fn with_sample_interval_ms(mut self, interval_ms: u64) -> Self {
        self.sample_interval_ms = interval_ms;
        self
    }

    /// Returns the window as a duration.
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Returns the debounce interval as a duration.
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Returns the sampling period as a duration.
    #[must_use]
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.low_water >= self.high_water {
            return Err(ConfigError::new(
                "scaling.low_water",
                format!(
                    "low water mark {} must be below high water mark {}",
                    self.low_water, self.high_water
                ),
            ));
        }
        if self.sample_interval_ms == 0 {
            return Err(ConfigError::new("scaling.sample_interval_ms", "must be positive"));
        }
        Ok(())
    }
}

/// Configuration for a [`Pool`](super::Pool).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Label used in logs, events and metrics.
    pub name: String,
    /// Workers started initially, and the floor for resizing.
    pub min_workers: usize,
    /// Ceiling for resizing.
    pub max_workers: usize,
    /// Capacity of each input queue.
    pub input_capacity: usize,
    /// Capacity of the results queue.
    pub result_capacity: usize,
    /// Default per-job deadline.
    pub job_timeout_ms: Option<u64>,
    /// Number of priority classes. One means no priority dispatch.
    pub priority_classes: usize,
    /// Every Kth pick serves the lowest class first.
    pub starvation_quota: u32,
    /// Maximum jobs per second across all workers.
    pub rate_limit: Option<f64>,
    /// Jobs handed to the handler at once.
    pub batch_size: Option<usize>,
    /// Longest a partial batch waits.
    pub batch_flush_ms: Option<u64>,
    /// Consecutive panics after which a worker is replaced.
    pub panic_threshold: u32,
    /// Retry policy for handler errors.
    pub retry: RetryConfig,
    /// Autoscaling.
    pub scaling: ScalingConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "pool".to_string(),
            min_workers: 1,
            max_workers: 1,
            input_capacity: DEFAULT_QUEUE_CAPACITY,
            result_capacity: DEFAULT_QUEUE_CAPACITY,
            job_timeout_ms: None,
            priority_classes: 1,
            starvation_quota: 4,
            rate_limit: None,
            batch_size: None,
            batch_flush_ms: None,
            panic_threshold: 3,
            retry: RetryConfig::none(),
            scaling: ScalingConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Creates a config with a fixed worker count.
    #[must_use]
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        Self {
            name: name.into(),
            min_workers: workers,
            max_workers: workers,
            ..Self::default()
        }
    }

    /// Sets the worker range.
    #[must_use]
    pub fn with_workers(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    /// Sets the input and result queue capacities.
    #[must_use]
    pub fn with_capacity(mut self, input: usize, results: usize) -> Self {
        self.input_capacity = input;
        self.result_capacity = results;
        self
    }

    /// Sets the default per-job deadline.
    #[must_use]
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Enables priority dispatch.
    #[must_use]
    pub fn with_priority_classes(mut self, classes: usize, starvation_quota: u32) -> Self {
        self.priority_classes = classes;
        self.starvation_quota = starvation_quota;
        self
    }

    /// Limits throughput to `per_second` jobs.
    #[must_use]
    pub fn with_rate_limit(mut self, per_second: f64) -> Self {
        self.rate_limit = Some(per_second);
        self
    }

    /// Enables batching.
    #[must_use]
    pub fn with_batching(mut self, size: usize, flush: Option<Duration>) -> Self {
        self.batch_size = Some(size);
        self.batch_flush_ms = flush.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Sets the panic threshold.
    #[must_use]
    pub fn with_panic_threshold(mut self, threshold: u32) -> Self {
        self.panic_threshold = threshold;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the autoscaling policy.
    #[must_use]
    pub fn with_scaling(mut self, scaling: ScalingConfig) -> Self {
        self.scaling = scaling;
        self
    }

    /// Returns the default job deadline.
    #[must_use]
    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_ms.map(Duration::from_millis)
    }

    /// Returns the batch flush interval.
    #[must_use]
    pub fn batch_flush(&self) -> Option<Duration> {
        self.batch_flush_ms.map(Duration::from_millis)
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_workers == 0 {
            return Err(ConfigError::new("min_workers", "must be at least 1"));
        }
        if self.max_workers < self.min_workers {
            return Err(ConfigError::new(
                "max_workers",
                format!(
                    "must be at least min_workers ({}), got {}",
                    self.min_workers, self.max_workers
                ),
            ));
        }
        if self.priority_classes == 0 || self.priority_classes > usize::from(u8::MAX) + 1 {
            return Err(ConfigError::new("priority_classes", "must be between 1 and 256"));
        }
        if self.priority_classes > 1 && self.starvation_quota == 0 {
            return Err(ConfigError::new("starvation_quota", "must be at least 1"));
        }
        if let Some(rate) = self.rate_limit {
            crate::throttle::bucket_shape(rate)?;
        }
        if self.job_timeout_ms == Some(0) {
            return Err(ConfigError::new("job_timeout_ms", "must be positive"));
        }
        if self.batch_size == Some(0) {
            return Err(ConfigError::new("batch_size", "must be at least 1"));
        }
        if self.batch_flush_ms == Some(0) {
            return Err(ConfigError::new("batch_flush_ms", "must be positive"));
        }
        if self.panic_threshold == 0 {
            return Err(ConfigError::new("panic_threshold", "must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::new("retry.max_attempts", "must be at least 1"));
        }
        self.scaling.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config_is_valid() {
        let config = PoolConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.panic_threshold, 3);
        assert_eq!(config.retry.max_attempts, 1);
    }

    #[test]
    fn test_worker_bounds() {
        assert_eq!(
            PoolConfig::new("p", 0).validate().unwrap_err().field,
            "min_workers"
        );
        assert_eq!(
            PoolConfig::new("p", 4).with_workers(4, 2).validate().unwrap_err().field,
            "max_workers"
        );
    }

    #[test]
    fn test_priority_and_batching_bounds() {
        assert_eq!(
            PoolConfig::new("p", 1)
                .with_priority_classes(3, 0)
                .validate()
                .unwrap_err()
                .field,
            "starvation_quota"
        );
        assert_eq!(
            PoolConfig::new("p", 1).with_batching(0, None).validate().unwrap_err().field,
            "batch_size"
        );
        assert_eq!(
            PoolConfig::new("p", 1).with_rate_limit(0.0).validate().unwrap_err().field,
            "rate_limit"
        );
    }

    #[test]
    fn test_scaling_water_marks() {
        let config = PoolConfig::new("p", 1).with_scaling(ScalingConfig::enabled(2, 2));
        assert_eq!(config.validate().unwrap_err().field, "scaling.low_water");
        let disabled = PoolConfig::new("p", 1).with_scaling(ScalingConfig {
            low_water: 5,
            high_water: 1,
            ..ScalingConfig::default()
        });
        assert!(disabled.validate().is_ok());
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: PoolConfig = serde_json::from_str(
            r#"{"name": "ingest", "min_workers": 2, "max_workers": 8, "job_timeout_ms": 250,
                "scaling": {"enabled": true, "high_water": 32}}"#,
        )
        .unwrap();
        assert_eq!(config.name, "ingest");
        assert_eq!(config.job_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.input_capacity, DEFAULT_QUEUE_CAPACITY);
        assert!(config.scaling.enabled);
        assert_eq!(config.scaling.low_water, 1);
        assert!(config.validate().is_ok());
    }
}
