// Circuit breakers for failure-prone shared resources
//
// Named breakers guard remote services (chat API, chat CLI). A breaker opens
// after `failure_threshold` consecutive failures, rejects calls until
// `recovery_timeout` elapses, then admits a bounded number of half-open
// probes. One probe success closes the circuit; one probe failure reopens it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::EngineError;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Failure threshold exceeded, calls rejected
    Open,
    /// Testing recovery with a bounded number of probes
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Tunables for a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Seconds to wait before admitting probes
    pub recovery_timeout: u64,
    /// Concurrent probes allowed while half-open
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: 60,
            half_open_requests: 1,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    last_failure_time: Option<DateTime<Utc>>,
    half_open_in_flight: u32,
}

/// Stats snapshot for observability.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    pub failure_threshold: u32,
    pub recovery_timeout: u64,
    pub last_failure: Option<DateTime<Utc>>,
    pub time_until_retry: u64,
}

/// A named circuit breaker. All state transitions happen under the lock.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
                half_open_in_flight: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admit or reject a call. On admission the caller MUST report the
    /// outcome with `on_success` or `on_failure`.
    pub fn acquire(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .last_failure_time
                .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
                .unwrap_or(u64::MAX);
            if elapsed >= self.config.recovery_timeout {
                tracing::info!(breaker = %self.name, "circuit transitioning to half-open");
                inner.state = CircuitState::HalfOpen;
                inner.half_open_in_flight = 0;
            } else {
                return Err(EngineError::CircuitOpen {
                    name: self.name.clone(),
                    retry_in: self.config.recovery_timeout - elapsed,
                });
            }
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.half_open_in_flight >= self.config.half_open_requests {
                return Err(EngineError::CircuitOpen {
                    name: self.name.clone(),
                    retry_in: self.config.recovery_timeout,
                });
            }
            inner.half_open_in_flight += 1;
        }

        Ok(())
    }

    /// Record a successful call. Any probe success closes the circuit.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            tracing::info!(breaker = %self.name, "circuit recovered, closing");
            inner.state = CircuitState::Closed;
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        inner.failure_count = 0;
        inner.success_count += 1;
    }

    /// Record a failed call. A probe failure reopens the circuit.
    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure_time = Some(Utc::now());

        match inner.state {
            CircuitState::HalfOpen => {
                tracing::warn!(breaker = %self.name, "probe failed, reopening circuit");
                inner.state = CircuitState::Open;
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                tracing::warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    "failure threshold reached, opening circuit"
                );
                inner.state = CircuitState::Open;
            }
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Reset to closed with all counters cleared.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure_time = None;
        inner.half_open_in_flight = 0;
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        let time_until_retry = if inner.state == CircuitState::Open {
            inner
                .last_failure_time
                .map(|t| {
                    let elapsed = (Utc::now() - t).num_seconds().max(0) as u64;
                    self.config.recovery_timeout.saturating_sub(elapsed)
                })
                .unwrap_or(0)
        } else {
            0
        };
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout: self.config.recovery_timeout,
            last_failure: inner.last_failure_time,
            time_until_retry,
        }
    }
}

/// Process-scoped registry. Breakers are created lazily, on first use, and
/// keyed by stable caller-chosen names.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a breaker with default config.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_with(name, CircuitBreakerConfig::default)
    }

    /// Get or create a breaker; `config` is only consulted on creation.
    pub fn get_with(
        &self,
        name: &str,
        config: impl FnOnce() -> CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config())))
            .clone()
    }

    /// Reset one breaker by name.
    pub fn reset(&self, name: &str) -> bool {
        match self.breakers.lock().get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        self.breakers
            .lock()
            .values()
            .map(|b| b.stats())
            .collect()
    }

    #[cfg(test)]
    pub fn clear(&self) {
        self.breakers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: 0,
            half_open_requests: 1,
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(
            "svc",
            CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_timeout: 60,
                half_open_requests: 1,
            },
        );

        for _ in 0..2 {
            breaker.acquire().unwrap();
            breaker.on_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.acquire().unwrap();
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = breaker.acquire().unwrap_err();
        assert!(matches!(err, EngineError::CircuitOpen { .. }));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("svc", fast_config());
        breaker.acquire().unwrap();
        breaker.on_failure();
        breaker.acquire().unwrap();
        breaker.on_failure();
        breaker.acquire().unwrap();
        breaker.on_success();

        // counter cleared, three more failures needed to open
        breaker.acquire().unwrap();
        breaker.on_failure();
        breaker.acquire().unwrap();
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_success_closes() {
        let breaker = CircuitBreaker::new("svc", fast_config());
        for _ in 0..3 {
            breaker.acquire().unwrap();
            breaker.on_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // recovery_timeout is zero, so the next acquire is admitted as probe
        breaker.acquire().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.on_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new("svc", fast_config());
        for _ in 0..3 {
            breaker.acquire().unwrap();
            breaker.on_failure();
        }
        breaker.acquire().unwrap();
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_bounds_concurrent_probes() {
        let breaker = CircuitBreaker::new("svc", fast_config());
        for _ in 0..3 {
            breaker.acquire().unwrap();
            breaker.on_failure();
        }
        breaker.acquire().unwrap();
        // second concurrent probe is rejected
        assert!(breaker.acquire().is_err());
    }

    #[test]
    fn test_registry_is_lazy_and_caches() {
        let registry = BreakerRegistry::new();
        assert!(registry.stats().is_empty());

        let first = registry.get("chat-api");
        let second = registry.get("chat-api");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.stats().len(), 1);

        assert!(registry.reset("chat-api"));
        assert!(!registry.reset("missing"));
    }
}
