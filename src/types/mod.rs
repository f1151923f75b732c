//! # Core Types
//!
//! Shared value types used across facilitation, execution, dispatch, and
//! correlation: execution modes, step responses, and the identifiers that
//! tie asynchronous completions back to their waiting step.

pub mod execution_mode;
pub mod identifiers;
pub mod step_response;

pub use execution_mode::ExecutionMode;
pub use identifiers::{ChildId, CorrelationId, CorrelationIdGenerator, StepType};
pub use step_response::{FailureInfo, FailureKind, ResponseData, StepResponse, StepStatus};

use std::collections::HashMap;

/// Step parameters as authored in the plan (opaque to the core)
pub type StepParameters = serde_json::Value;

/// Named input transputs resolved for a step invocation
pub type StepInputs = HashMap<String, serde_json::Value>;
