use crate::types::{ExecutionMode, StepStatus};
use serde::{Deserialize, Serialize};

/// Events that drive invocation state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum InvocationEvent {
    /// A facilitator resolved the execution mode
    Facilitate(ExecutionMode),
    StartSync,
    /// Suspend on a correlated response; repeated for each TASK_CHAIN link
    AwaitResponse,
    AwaitChildren,
    Complete(StepStatus),
}

impl InvocationEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Facilitate(_) => "facilitate",
            Self::StartSync => "start_sync",
            Self::AwaitResponse => "await_response",
            Self::AwaitChildren => "await_children",
            Self::Complete(_) => "complete",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_))
    }
}
