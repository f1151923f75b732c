//! Three-state circuit breaker: Closed (normal), Open (failing fast) and
//! HalfOpen (probing recovery).

use crate::config::CircuitBreakerConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

/// Counters kept by a breaker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub rejected_count: u64,
    pub consecutive_failures: u64,
    pub half_open_calls: u64,
}

#[derive(Debug)]
struct BreakerInner {
    metrics: CircuitBreakerMetrics,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    state: AtomicU8,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            enabled = config.enabled,
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            timeout_ms = config.timeout_ms,
            "Circuit breaker initialized"
        );

        Self {
            name,
            state: AtomicU8::new(CircuitState::Closed as u8),
            config,
            inner: Mutex::new(BreakerInner {
                metrics: CircuitBreakerMetrics::default(),
                opened_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Run `operation` unless the circuit is open. A disabled breaker passes
    /// every call through without recording anything.
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.config.enabled {
            return operation().await.map_err(CircuitBreakerError::OperationFailed);
        }

        if !self.should_allow_call() {
            self.inner.lock().metrics.rejected_count += 1;
            debug!(component = %self.name, "Call rejected by open circuit");
            return Err(CircuitBreakerError::CircuitOpen {
                component: self.name.clone(),
            });
        }

        let started = Instant::now();
        let result = operation().await;
        let elapsed = started.elapsed();

        match &result {
            Ok(_) => self.record_success(elapsed),
            Err(_) => self.record_failure(elapsed),
        }

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    fn should_allow_call(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = self.inner.lock().opened_at.map(|at| at.elapsed());
                match elapsed {
                    Some(elapsed) if elapsed >= self.config.timeout() => {
                        self.transition_to_half_open();
                        true
                    }
                    Some(_) => false,
                    None => {
                        warn!(component = %self.name, "Circuit open but no timestamp recorded");
                        true
                    }
                }
            }
            CircuitState::HalfOpen => {
                let inner = self.inner.lock();
                inner.metrics.half_open_calls < self.config.success_threshold as u64
            }
        }
    }

    fn record_success(&self, elapsed: Duration) {
        let close = {
            let mut inner = self.inner.lock();
            inner.metrics.total_calls += 1;
            inner.metrics.success_count += 1;
            inner.metrics.consecutive_failures = 0;

            debug!(
                component = %self.name,
                duration_ms = elapsed.as_millis() as u64,
                "Protected operation succeeded"
            );

            if self.state() == CircuitState::HalfOpen {
                inner.metrics.half_open_calls += 1;
                inner.metrics.half_open_calls >= self.config.success_threshold as u64
            } else {
                false
            }
        };

        if close {
            self.transition_to_closed();
        }
    }

    fn record_failure(&self, elapsed: Duration) {
        let open = {
            let mut inner = self.inner.lock();
            inner.metrics.total_calls += 1;
            inner.metrics.failure_count += 1;
            inner.metrics.consecutive_failures += 1;

            warn!(
                component = %self.name,
                duration_ms = elapsed.as_millis() as u64,
                consecutive_failures = inner.metrics.consecutive_failures,
                "Protected operation failed"
            );

            match self.state() {
                CircuitState::Closed => {
                    inner.metrics.consecutive_failures >= self.config.failure_threshold as u64
                }
                CircuitState::HalfOpen => true,
                CircuitState::Open => false,
            }
        };

        if open {
            self.transition_to_open();
        }
    }

    fn transition_to_closed(&self) {
        let mut inner = self.inner.lock();
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        inner.metrics.consecutive_failures = 0;
        inner.metrics.half_open_calls = 0;
        inner.opened_at = None;
        info!(component = %self.name, "Circuit breaker closed (recovered)");
    }

    fn transition_to_open(&self) {
        let mut inner = self.inner.lock();
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        inner.opened_at = Some(Instant::now());
        inner.metrics.half_open_calls = 0;
        error!(
            component = %self.name,
            consecutive_failures = inner.metrics.consecutive_failures,
            failure_threshold = self.config.failure_threshold,
            timeout_ms = self.config.timeout_ms,
            "Circuit breaker opened (failing fast)"
        );
    }

    fn transition_to_half_open(&self) {
        let mut inner = self.inner.lock();
        self.state.store(CircuitState::HalfOpen as u8, Ordering::Release);
        inner.metrics.half_open_calls = 0;
        info!(
            component = %self.name,
            success_threshold = self.config.success_threshold,
            "Circuit breaker half-open (testing recovery)"
        );
    }

    pub fn force_open(&self) {
        warn!(component = %self.name, "Circuit breaker forced open");
        self.transition_to_open();
    }

    pub fn force_closed(&self) {
        warn!(component = %self.name, "Circuit breaker forced closed");
        self.transition_to_closed();
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        self.inner.lock().metrics.clone()
    }
}
