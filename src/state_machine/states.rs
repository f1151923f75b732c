use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a single step invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    /// Invocation accepted, no execution mode yet
    #[default]
    Created,
    /// Execution mode resolved
    Facilitated,
    RunningSync,
    /// Waiting on a correlated response (ASYNC, TASK, TASK_CHAIN)
    AwaitingResponse,
    /// Waiting on a children aggregate (CHILD, CHILDREN)
    AwaitingChildren,
    /// Terminal; the invocation carries its StepResponse
    Completed,
}

impl InvocationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::AwaitingResponse | Self::AwaitingChildren)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Facilitated => write!(f, "facilitated"),
            Self::RunningSync => write!(f, "running_sync"),
            Self::AwaitingResponse => write!(f, "awaiting_response"),
            Self::AwaitingChildren => write!(f, "awaiting_children"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for InvocationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "facilitated" => Ok(Self::Facilitated),
            "running_sync" => Ok(Self::RunningSync),
            "awaiting_response" => Ok(Self::AwaitingResponse),
            "awaiting_children" => Ok(Self::AwaitingChildren),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid invocation state: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_awaiting_states_suspend() {
        assert!(InvocationState::AwaitingResponse.is_suspended());
        assert!(InvocationState::AwaitingChildren.is_suspended());
        assert!(!InvocationState::RunningSync.is_suspended());
        assert!(!InvocationState::Completed.is_suspended());
        assert!(InvocationState::Completed.is_terminal());
    }

    #[test]
    fn test_state_string_conversion() {
        assert_eq!(InvocationState::AwaitingChildren.to_string(), "awaiting_children");
        assert_eq!(
            "running_sync".parse::<InvocationState>().unwrap(),
            InvocationState::RunningSync
        );
        assert!("in_progress".parse::<InvocationState>().is_err());

        let json = serde_json::to_string(&InvocationState::AwaitingResponse).unwrap();
        assert_eq!(json, "\"awaiting_response\"");
    }
}
