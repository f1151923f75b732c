//! Pending wait records: what a suspended invocation is waiting for.

use crate::ambiance::Ambiance;
use crate::executable::{ChildResponse, TaskRequest};
use crate::types::{
    ChildId, CorrelationId, ExecutionMode, ResponseData, StepInputs, StepParameters, StepType,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// What kind of completion resolves a wait
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitKind {
    /// A single correlated response (ASYNC and TASK)
    Response,
    /// One link of a TASK_CHAIN
    ChainLink {
        index: usize,
        /// Links still to dispatch after this one
        remaining: Vec<TaskRequest>,
        /// Responses of the links already finished, in order
        completed: Vec<(CorrelationId, ResponseData)>,
    },
    /// A children aggregate (CHILD and CHILDREN) keyed by the wait's id
    Children,
}

/// Registration of a suspended invocation
///
/// Plain serializable record so an external store can persist it across
/// restarts. The executable is referenced by `(step_type, mode)` and looked
/// up in the registry on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWait {
    pub correlation_id: CorrelationId,
    /// Runtime id of the owning invocation
    pub runtime_id: Uuid,
    /// Owning context, including the invocation's own level
    pub ambiance: Ambiance,
    pub step_type: StepType,
    pub mode: ExecutionMode,
    pub parameters: StepParameters,
    #[serde(default)]
    pub inputs: StepInputs,
    pub kind: WaitKind,
    pub registered_at: DateTime<Utc>,
    /// Absolute deadline; `None` waits indefinitely
    pub expires_at: Option<DateTime<Utc>>,
}

impl PendingWait {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        correlation_id: CorrelationId,
        runtime_id: Uuid,
        ambiance: Ambiance,
        step_type: StepType,
        mode: ExecutionMode,
        parameters: StepParameters,
        inputs: StepInputs,
        kind: WaitKind,
    ) -> Self {
        Self {
            correlation_id,
            runtime_id,
            ambiance,
            step_type,
            mode,
            parameters,
            inputs,
            kind,
            registered_at: Utc::now(),
            expires_at: None,
        }
    }

    /// Deadline `timeout` from now
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        // Timeouts too large to represent are treated as no deadline
        self.expires_at = timeout
            .and_then(|timeout| ChronoDuration::from_std(timeout).ok())
            .and_then(|timeout| self.registered_at.checked_add_signed(timeout));
        self
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }

    /// Time left until the deadline, zero when already overdue
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at
            .map(|deadline| (deadline - now).to_std().unwrap_or(Duration::ZERO))
    }
}

/// How a wait was resolved
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Response(ResponseData),
    /// Deadline passed; carries the synthetic timeout payload
    Expired(ResponseData),
    ChildrenCompleted {
        responses: HashMap<ChildId, ChildResponse>,
        /// Children cancelled after a sibling failed (fail-fast aggregates)
        cancelled: Vec<ChildId>,
    },
}

/// A resolved wait handed back to the orchestrator for resumption
#[derive(Debug, Clone)]
pub struct Resumption {
    pub wait: PendingWait,
    pub outcome: WaitOutcome,
}

/// Terminal marker left behind for a resolved correlation id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Responded,
    Expired,
    Cancelled,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Responded => f.write_str("responded"),
            Self::Expired => f.write_str("expired"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}
