//! # Ambiance
//!
//! Immutable, hierarchically nested execution context threaded through every
//! step invocation. A nested invocation never mutates its parent's context:
//! it receives a copy with one more [`Level`] appended.

use crate::types::StepType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One nesting level of an execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Level {
    /// Unique id of this particular run of the node
    pub runtime_id: Uuid,
    /// Plan node id this level executes
    pub setup_id: String,
    /// Human readable identifier of the node
    pub identifier: String,
    /// Group the node belongs to (stage, step, step group, ...)
    pub group: String,
    pub step_type: StepType,
    /// Zero for the first attempt, incremented for every retry invocation
    pub retry_index: u32,
}

impl Level {
    pub fn new(
        setup_id: impl Into<String>,
        identifier: impl Into<String>,
        group: impl Into<String>,
        step_type: impl Into<StepType>,
    ) -> Self {
        Self {
            runtime_id: Uuid::new_v4(),
            setup_id: setup_id.into(),
            identifier: identifier.into(),
            group: group.into(),
            step_type: step_type.into(),
            retry_index: 0,
        }
    }

    /// Level for a step node where setup id and identifier coincide
    pub fn step(identifier: impl Into<String>, step_type: impl Into<StepType>) -> Self {
        let identifier = identifier.into();
        Self::new(identifier.clone(), identifier, "STEP", step_type)
    }

    pub fn with_runtime_id(mut self, runtime_id: Uuid) -> Self {
        self.runtime_id = runtime_id;
        self
    }

    pub fn with_retry_index(mut self, retry_index: u32) -> Self {
        self.retry_index = retry_index;
        self
    }

    /// Level for the next retry invocation of the same node
    pub fn next_attempt(&self) -> Self {
        Self {
            runtime_id: Uuid::new_v4(),
            retry_index: self.retry_index + 1,
            ..self.clone()
        }
    }
}

/// Immutable execution context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ambiance {
    plan_execution_id: Uuid,
    plan_id: String,
    setup_abstractions: BTreeMap<String, String>,
    levels: Vec<Level>,
}

impl Ambiance {
    /// Root context for a top-level execution with an empty level stack
    pub fn new(plan_execution_id: Uuid, plan_id: impl Into<String>) -> Self {
        Self {
            plan_execution_id,
            plan_id: plan_id.into(),
            setup_abstractions: BTreeMap::new(),
            levels: Vec::new(),
        }
    }

    /// Root context carrying setup metadata (account, project, ...)
    pub fn with_setup_abstractions(
        plan_execution_id: Uuid,
        plan_id: impl Into<String>,
        setup_abstractions: BTreeMap<String, String>,
    ) -> Self {
        Self {
            setup_abstractions,
            ..Self::new(plan_execution_id, plan_id)
        }
    }

    /// New context with `level` appended; `self` is left untouched
    pub fn with_level(&self, level: Level) -> Self {
        let mut levels = Vec::with_capacity(self.levels.len() + 1);
        levels.extend(self.levels.iter().cloned());
        levels.push(level);
        Self {
            plan_execution_id: self.plan_execution_id,
            plan_id: self.plan_id.clone(),
            setup_abstractions: self.setup_abstractions.clone(),
            levels,
        }
    }

    /// New context with one extra setup entry; `self` is left untouched
    pub fn with_setup_entry(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.setup_abstractions.insert(key.into(), value.into());
        copy
    }

    pub fn plan_execution_id(&self) -> Uuid {
        self.plan_execution_id
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    pub fn setup_abstractions(&self) -> &BTreeMap<String, String> {
        &self.setup_abstractions
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    pub fn current_runtime_id(&self) -> Option<Uuid> {
        self.current_level().map(|level| level.runtime_id)
    }

    pub fn current_step_type(&self) -> Option<&StepType> {
        self.current_level().map(|level| &level.step_type)
    }

    /// Runtime id of the level enclosing the current one
    pub fn parent_runtime_id(&self) -> Option<Uuid> {
        let len = self.levels.len();
        if len < 2 {
            return None;
        }
        Some(self.levels[len - 2].runtime_id)
    }
}
