//! # Error Taxonomy
//!
//! Structured error types for the step orchestration core using `thiserror`.
//!
//! Only [`FacilitationError`] ever aborts an invocation before a response is
//! produced. Every other condition is folded into a `StepResponse` (dispatch
//! failures, timeouts) or logged and discarded (duplicate and unknown
//! correlation responses).

use crate::config::ConfigurationError;
use crate::store::StoreError;
use crate::types::{ChildId, CorrelationId, ExecutionMode, StepType};
use thiserror::Error;

/// No execution mode could be resolved for a step invocation.
///
/// Fatal and never retried: there is no well-defined execution mode through
/// which a failure response could be reported.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FacilitationError {
    #[error("No facilitators registered for step type: {step_type}")]
    UnknownStepType { step_type: StepType },

    #[error("No facilitator resolved an execution mode for step type: {step_type}")]
    NoFacilitator { step_type: StepType },

    #[error("Ambiguous facilitation for step type {step_type}: {candidates:?} all matched at priority {priority}")]
    AmbiguousFacilitators {
        step_type: StepType,
        priority: u32,
        candidates: Vec<String>,
    },

    #[error("Step type {step_type} has no executable registered for mode {mode}")]
    UnsupportedMode {
        step_type: StepType,
        mode: ExecutionMode,
    },
}

/// Handing work to a remote worker failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("No eligible worker for namespace {namespace:?} with capabilities {capabilities:?}")]
    NoEligibleWorker {
        namespace: Option<String>,
        capabilities: Vec<String>,
    },

    #[error("Task queue {queue} rejected task: {reason}")]
    QueueRejected { queue: String, reason: String },

    #[error("Task queue {queue} is closed")]
    QueueClosed { queue: String },

    #[error("Circuit breaker is open for component: {component}")]
    CircuitOpen { component: String },

    #[error("Task queue {queue} transport failure: {message}")]
    Transport { queue: String, message: String },

    #[error("Dispatch exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

impl DispatchError {
    pub fn queue_rejected(queue: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::QueueRejected {
            queue: queue.into(),
            reason: reason.into(),
        }
    }

    /// Whether a caller retry policy may attempt the dispatch again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoEligibleWorker { .. }
                | Self::QueueRejected { .. }
                | Self::CircuitOpen { .. }
                | Self::Transport { .. }
        )
    }
}

/// Correlation-level conditions. Logged and discarded, never surfaced as an
/// invocation failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("A pending wait is already registered for correlation id {correlation_id}")]
    DuplicateWait { correlation_id: CorrelationId },

    #[error("Correlation id {correlation_id} was already resolved ({resolution})")]
    DuplicateResponse {
        correlation_id: CorrelationId,
        resolution: String,
    },

    #[error("No pending wait for correlation id {correlation_id}")]
    UnknownCorrelation { correlation_id: CorrelationId },
}

/// Children aggregation conditions. Logged and discarded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregationError {
    #[error("Child {child_id} does not belong to any open aggregate")]
    UnknownChild { child_id: ChildId },

    #[error("Aggregate {aggregate_id} is closed; response from child {child_id} rejected")]
    AggregateClosed {
        aggregate_id: CorrelationId,
        child_id: ChildId,
    },

    #[error("Child {child_id} already reported to aggregate {aggregate_id}")]
    DuplicateChild {
        aggregate_id: CorrelationId,
        child_id: ChildId,
    },
}

/// Error raised by an executable's own logic.
///
/// The orchestrator converts these into a terminal `StepResponse`:
/// `Failed` becomes FAILED, `Unexpected` becomes ERRORED.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepExecutionError {
    #[error("Step failed: {message}")]
    Failed {
        message: String,
        error_code: Option<String>,
    },

    #[error("Unexpected step error: {message}")]
    Unexpected { message: String },
}

impl StepExecutionError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            error_code: None,
        }
    }

    pub fn failed_with_code(message: impl Into<String>, error_code: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            error_code: Some(error_code.into()),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected {
            message: message.into(),
        }
    }
}

/// Crate-wide error
#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error(transparent)]
    Facilitation(#[from] FacilitationError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Unknown invocation: {runtime_id}")]
    UnknownInvocation { runtime_id: uuid::Uuid },

    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

pub type OrchestrationResult<T> = std::result::Result<T, OrchestrationError>;
