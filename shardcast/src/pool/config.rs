use std::time::Duration;

use shardcast_api::DispatchError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "shardcast";

/// Configuration for a [`Dispatcher`](super::Dispatcher).
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Upper bound on worker threads. `None` uses the number of CPUs.
    /// The pool never has more workers than units.
    pub parallelism: Option<usize>,

    /// Deadline applied when `submit` is called without one. `None` waits forever.
    pub default_timeout: Option<Duration>,

    /// How long the result collector waits on the worker channels before
    /// re-checking the stop flag.
    pub poll_interval: Duration,

    /// Prefix for worker and collector thread names.
    pub thread_name_prefix: String,

    /// Capacity of each worker's inbound job queue. `None` is unbounded.
    pub inbound_capacity: Option<usize>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            parallelism: None,
            default_timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            inbound_capacity: None,
        }
    }
}

impl DispatcherConfig {
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn with_inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = Some(capacity);
        self
    }

    /// Number of worker threads for `unit_count` units.
    pub fn effective_parallelism(&self, unit_count: usize) -> usize {
        let parallelism = self.parallelism.unwrap_or_else(num_cpus::get).max(1);
        parallelism.min(unit_count)
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.parallelism == Some(0) {
            return Err(DispatchError::InvalidConfig("parallelism must be at least 1".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(DispatchError::InvalidConfig("poll_interval must be non-zero".into()));
        }
        if self.inbound_capacity == Some(0) {
            return Err(DispatchError::InvalidConfig("inbound_capacity must be at least 1".into()));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(DispatchError::InvalidConfig("thread_name_prefix must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_parallelism_is_capped_by_units() {
        let config = DispatcherConfig::default().with_parallelism(8);
        assert_eq!(config.effective_parallelism(3), 3);
        assert_eq!(config.effective_parallelism(20), 8);
        assert_eq!(config.effective_parallelism(0), 0);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(DispatcherConfig::default().validate().is_ok());
        assert!(DispatcherConfig::default().with_parallelism(0).validate().is_err());
        assert!(DispatcherConfig::default().with_poll_interval(Duration::ZERO).validate().is_err());
        assert!(DispatcherConfig::default().with_inbound_capacity(0).validate().is_err());
    }
}
