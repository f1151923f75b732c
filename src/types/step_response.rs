//! Step responses and the raw payloads that asynchronous work reports back.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Terminal status of a step invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Errored,
}

impl StepStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// FAILED and ERRORED both count as failure for rollups
    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Errored => write!(f, "ERRORED"),
        }
    }
}

/// Classification of a failure carried on a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Raised by the step's own logic
    Application,
    /// No response arrived before the wait deadline
    Timeout,
    /// Work could not be handed to a remote worker
    Dispatch,
    /// The invocation was cancelled while suspended
    Cancelled,
    /// At least one child execution failed
    ChildFailure,
    /// Anything the executable did not anticipate (including panics)
    Unexpected,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Application => "application",
            Self::Timeout => "timeout",
            Self::Dispatch => "dispatch",
            Self::Cancelled => "cancelled",
            Self::ChildFailure => "child_failure",
            Self::Unexpected => "unexpected",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: FailureKind,
    pub message: String,
    pub error_code: Option<String>,
}

impl FailureInfo {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            error_code: None,
        }
    }

    pub fn with_error_code(mut self, error_code: impl Into<String>) -> Self {
        self.error_code = Some(error_code.into());
        self
    }
}

/// The single terminal result of a step invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub status: StepStatus,
    /// Named output artifacts/transputs
    #[serde(default)]
    pub outputs: HashMap<String, serde_json::Value>,
    pub failure: Option<FailureInfo>,
}

impl StepResponse {
    pub fn succeeded() -> Self {
        Self {
            status: StepStatus::Succeeded,
            outputs: HashMap::new(),
            failure: None,
        }
    }

    pub fn succeeded_with(outputs: HashMap<String, serde_json::Value>) -> Self {
        Self {
            status: StepStatus::Succeeded,
            outputs,
            failure: None,
        }
    }

    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            outputs: HashMap::new(),
            failure: Some(FailureInfo::new(kind, message)),
        }
    }

    pub fn errored(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Errored,
            outputs: HashMap::new(),
            failure: Some(FailureInfo::new(kind, message)),
        }
    }

    pub fn with_output(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.outputs.insert(name.into(), value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }
}

/// Raw payload delivered for a correlation id by a remote worker or an
/// asynchronous executable's external system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseData {
    pub status: StepStatus,
    #[serde(default)]
    pub data: serde_json::Value,
    pub failure: Option<FailureInfo>,
}

impl ResponseData {
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            status: StepStatus::Succeeded,
            data,
            failure: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            data: serde_json::Value::Null,
            failure: Some(FailureInfo::new(FailureKind::Application, message)),
        }
    }

    /// Synthetic response produced when a wait expires
    pub fn timed_out(message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Errored,
            data: serde_json::Value::Null,
            failure: Some(FailureInfo::new(FailureKind::Timeout, message)),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Straight mapping used by default response handlers
    pub fn into_step_response(self) -> StepResponse {
        let mut outputs = HashMap::new();
        if !self.data.is_null() {
            outputs.insert("result".to_string(), self.data);
        }
        StepResponse {
            status: self.status,
            outputs,
            failure: self.failure,
        }
    }
}
