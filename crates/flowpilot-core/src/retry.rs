// Retry policy and backoff computation
//
// Executors are wrapped with classified retries and jittered exponential
// backoff. A server-specified retry_after always overrides the computed
// delay for that attempt.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    60.0
}

fn default_exponential_base() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

/// Retry configuration, declarable per node and defaulted per workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial one)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in seconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay: f64,

    /// Upper bound on any computed delay, in seconds
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,

    /// Backoff multiplier
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,

    /// Randomize each delay within [0.5d, 1.5d]
    #[serde(default = "default_true")]
    pub jitter: bool,

    #[serde(default = "default_true")]
    pub retry_on_transient: bool,

    #[serde(default = "default_true")]
    pub retry_on_resource: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            exponential_base: default_exponential_base(),
            jitter: true,
            retry_on_transient: true,
            retry_on_resource: true,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: 0.0,
            max_delay: 0.0,
            exponential_base: 1.0,
            jitter: false,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, seconds: f64) -> Self {
        self.initial_delay = seconds;
        self
    }

    pub fn with_max_delay(mut self, seconds: f64) -> Self {
        self.max_delay = seconds;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn has_attempts_remaining(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay before the retry following `attempt` (0-indexed). A
    /// server-specified `retry_after` overrides the computed backoff.
    pub fn backoff(&self, attempt: u32, retry_after: Option<u64>) -> Duration {
        if let Some(seconds) = retry_after {
            return Duration::from_secs(seconds);
        }

        let base = self.initial_delay * self.exponential_base.powi(attempt as i32);
        let capped = base.min(self.max_delay);

        let delay = if self.jitter {
            let mut rng = rand::thread_rng();
            capped * rng.gen_range(0.5..1.5)
        } else {
            capped
        };

        Duration::from_secs_f64(delay.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_delay, 1.0);
        assert_eq!(config.exponential_base, 2.0);
        assert!(config.jitter);
        assert!(config.retry_on_transient);
        assert!(config.retry_on_resource);
    }

    #[test]
    fn test_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
        assert!(!config.has_attempts_remaining(1));
    }

    #[test]
    fn test_exponential_backoff_without_jitter() {
        let config = RetryConfig::default().with_jitter(false);
        assert_eq!(config.backoff(0, None), Duration::from_secs(1));
        assert_eq!(config.backoff(1, None), Duration::from_secs(2));
        assert_eq!(config.backoff(2, None), Duration::from_secs(4));
    }

    #[test]
    fn test_max_delay_cap() {
        let config = RetryConfig::default()
            .with_jitter(false)
            .with_max_delay(5.0);
        assert_eq!(config.backoff(10, None), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_after_overrides_backoff() {
        let config = RetryConfig::default().with_jitter(false);
        assert_eq!(config.backoff(0, Some(17)), Duration::from_secs(17));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = RetryConfig::default().with_initial_delay(2.0);
        for _ in 0..100 {
            let delay = config.backoff(0, None).as_secs_f64();
            assert!((1.0..3.0).contains(&delay), "jittered delay {delay} out of band");
        }
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = RetryConfig::default().with_max_attempts(7);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: RetryConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let parsed: RetryConfig = serde_json::from_str(r#"{"max_attempts": 5}"#).unwrap();
        assert_eq!(parsed.max_attempts, 5);
        assert_eq!(parsed.initial_delay, 1.0);
        assert!(parsed.jitter);
    }
}
