use crate::types::{CorrelationId, ExecutionMode, StepStatus, StepType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle events emitted while driving step invocations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    InvocationStarted {
        runtime_id: Uuid,
        step_type: StepType,
        mode: ExecutionMode,
    },
    InvocationSuspended {
        runtime_id: Uuid,
        correlation_id: CorrelationId,
        mode: ExecutionMode,
    },
    InvocationCompleted {
        runtime_id: Uuid,
        status: StepStatus,
    },
    /// A late, duplicate, or unknown response was dropped
    ResponseDiscarded {
        correlation_id: Option<CorrelationId>,
        reason: String,
    },
    WaitExpired {
        runtime_id: Uuid,
        correlation_id: CorrelationId,
    },
    InvocationCancelled {
        runtime_id: Uuid,
    },
}

impl OrchestrationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvocationStarted { .. } => "invocation.started",
            Self::InvocationSuspended { .. } => "invocation.suspended",
            Self::InvocationCompleted { .. } => "invocation.completed",
            Self::ResponseDiscarded { .. } => "response.discarded",
            Self::WaitExpired { .. } => "wait.expired",
            Self::InvocationCancelled { .. } => "invocation.cancelled",
        }
    }

    /// Runtime id of the invocation the event concerns, if any
    pub fn runtime_id(&self) -> Option<Uuid> {
        match self {
            Self::InvocationStarted { runtime_id, .. }
            | Self::InvocationSuspended { runtime_id, .. }
            | Self::InvocationCompleted { runtime_id, .. }
            | Self::WaitExpired { runtime_id, .. }
            | Self::InvocationCancelled { runtime_id } => Some(*runtime_id),
            Self::ResponseDiscarded { .. } => None,
        }
    }
}

/// Event as delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedEvent {
    pub event: OrchestrationEvent,
    pub published_at: DateTime<Utc>,
}
