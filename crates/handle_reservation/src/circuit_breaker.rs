//! Circuit breaker guarding calls to the ownership authority.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before the circuit is opened.
    pub failure_threshold: u32,
    /// Number of successful calls required in half-open state to close the circuit.
    pub half_open_success_threshold: u32,
    /// Cooldown period in seconds before retrying after the circuit is opened.
    pub recovery_timeout_secs: u64,
}

impl CircuitBreakerConfig {
    fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            half_open_success_threshold: 2,
            recovery_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitBreakerState {
    /// Lookups flow normally.
    Closed,
    /// Lookups fail fast until the recovery timeout elapses.
    Open,
    /// Probing whether the authority has recovered.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitBreakerState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

impl Default for BreakerInner {
    fn default() -> Self {
        Self {
            state: CircuitBreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
        }
    }
}

impl BreakerInner {
    fn trip(&mut self) {
        self.state = CircuitBreakerState::Open;
        self.success_count = 0;
        self.opened_at = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(BreakerInner::default())),
        }
    }

    /// Whether a call may proceed; moves an open breaker to half-open once the
    /// recovery timeout has elapsed.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen => true,
            CircuitBreakerState::Open => {
                let recovered = inner
                    .opened_at
                    .is_some_and(|opened| opened.elapsed() >= self.config.recovery_timeout());
                if recovered {
                    inner.state = CircuitBreakerState::HalfOpen;
                    inner.success_count = 0;
                }
                recovered
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitBreakerState::Closed => inner.failure_count = 0,
            CircuitBreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_success_threshold {
                    *inner = BreakerInner::default();
                }
            }
            CircuitBreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        match inner.state {
            CircuitBreakerState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    inner.trip();
                }
            }
            CircuitBreakerState::HalfOpen | CircuitBreakerState::Open => inner.trip(),
        }
    }

    pub fn reset(&self) {
        *self.inner.lock() = BreakerInner::default();
    }

    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state
    }
}
