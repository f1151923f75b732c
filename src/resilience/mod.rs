//! # Resilience
//!
//! Circuit breaker isolating the orchestrator from a failing task queue
//! transport. While open, dispatch fails fast with
//! [`DispatchError::CircuitOpen`](crate::error::DispatchError::CircuitOpen)
//! instead of piling retries onto a transport that is down.
//!
//! ```rust
//! use pipeline_core::config::CircuitBreakerConfig;
//! use pipeline_core::resilience::{CircuitBreaker, CircuitState};
//!
//! # tokio_test::block_on(async {
//! let breaker = CircuitBreaker::new("task_queue", CircuitBreakerConfig::default());
//! let result = breaker.call(|| async { Ok::<_, String>("queued") }).await;
//! assert!(result.is_ok());
//! assert_eq!(breaker.state(), CircuitState::Closed);
//! # });
//! ```

pub mod circuit_breaker;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitBreakerMetrics, CircuitState};
