use serde::{Deserialize, Serialize};
use std::fmt;

/// How a single step invocation runs.
///
/// Chosen once by the facilitator and immutable for the invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// Runs to completion on the calling task
    Sync,
    /// Started by the executable; completion arrives through a correlation id
    Async,
    /// Spawns exactly one nested execution
    Child,
    /// Spawns N nested executions and aggregates their responses
    Children,
    /// Work handed to a remote worker through the task dispatcher
    Task,
    /// Sequence of remote tasks dispatched one after another
    TaskChain,
}

impl ExecutionMode {
    pub const ALL: [ExecutionMode; 6] = [
        Self::Sync,
        Self::Async,
        Self::Child,
        Self::Children,
        Self::Task,
        Self::TaskChain,
    ];

    /// Whether the orchestrator suspends the invocation for this mode
    pub fn is_suspending(&self) -> bool {
        !matches!(self, Self::Sync)
    }

    /// Whether completion is delivered as a correlated response payload
    pub fn awaits_response(&self) -> bool {
        matches!(self, Self::Async | Self::Task | Self::TaskChain)
    }

    /// Whether completion is delivered by nested child executions
    pub fn awaits_children(&self) -> bool {
        matches!(self, Self::Child | Self::Children)
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => write!(f, "SYNC"),
            Self::Async => write!(f, "ASYNC"),
            Self::Child => write!(f, "CHILD"),
            Self::Children => write!(f, "CHILDREN"),
            Self::Task => write!(f, "TASK"),
            Self::TaskChain => write!(f, "TASK_CHAIN"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SYNC" => Ok(Self::Sync),
            "ASYNC" => Ok(Self::Async),
            "CHILD" => Ok(Self::Child),
            "CHILDREN" => Ok(Self::Children),
            "TASK" => Ok(Self::Task),
            "TASK_CHAIN" => Ok(Self::TaskChain),
            _ => Err(format!("Invalid execution mode: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_sync_does_not_suspend() {
        for mode in ExecutionMode::ALL {
            assert_eq!(mode.is_suspending(), mode != ExecutionMode::Sync);
        }
    }

    #[test]
    fn test_display_and_parse_agree() {
        for mode in ExecutionMode::ALL {
            let parsed: ExecutionMode = mode.to_string().parse().unwrap();
            assert_eq!(parsed, mode);
        }
        assert!("sideways".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn test_serde_uses_screaming_snake_case() {
        let json = serde_json::to_string(&ExecutionMode::TaskChain).unwrap();
        assert_eq!(json, "\"TASK_CHAIN\"");
    }
}
