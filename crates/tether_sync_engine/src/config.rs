//! Configuration for the sync service.

use rand::Rng;
use std::time::Duration;

/// Configuration for sync passes.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Failed attempts after which an operation is no longer retried
    /// automatically.
    pub max_retries: u32,
    /// Backoff between failed attempts of one operation.
    pub retry: RetryConfig,
    /// Upper bound for a single transport call.
    pub transport_timeout: Duration,
    /// Interval for automatic sync while online.
    pub sync_interval: Option<Duration>,
    /// Whether scheduled passes pull remote changes before pushing.
    pub pull_on_trigger: bool,
    /// Age after which exhausted or parked operations are pruned at the
    /// end of a pass. `None` keeps them until pruned explicitly.
    pub stale_operation_age: Option<Duration>,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            max_retries: 3,
            retry: RetryConfig::default(),
            transport_timeout: Duration::from_secs(30),
            sync_interval: None,
            pull_on_trigger: true,
            stale_operation_age: Some(Duration::from_secs(7 * 24 * 60 * 60)),
        }
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the transport call timeout.
    pub fn with_transport_timeout(mut self, timeout: Duration) -> Self {
        self.transport_timeout = timeout;
        self
    }

    /// Sets the sync interval for automatic sync.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Sets whether scheduled passes pull first.
    pub fn with_pull_on_trigger(mut self, pull: bool) -> Self {
        self.pull_on_trigger = pull;
        self
    }

    /// Sets the automatic pruning age; `None` disables automatic pruning.
    pub fn with_stale_operation_age(mut self, age: Option<Duration>) -> Self {
        self.stale_operation_age = age;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay after the first failed attempt is `initial_delay × multiplier`.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5 * 60),
            backoff_multiplier: 2.0,
            add_jitter: false,
        }
    }

    /// Creates a configuration that retries without waiting.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Returns how long an operation that failed `retry_count` times cools
    /// down before its next attempt: `initial_delay × multiplier^retry_count`,
    /// capped at `max_delay`. Zero for an operation that never failed.
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}
