//! # Facilitation
//!
//! Pure decision functions choosing the [`ExecutionMode`] of a step
//! invocation, plus the startup-assembled [`FacilitatorRegistry`] that
//! resolves them per step type.
//!
//! A facilitator must be deterministic and side-effect free: the orchestrator
//! may call it more than once for the same invocation and relies on getting
//! the same answer.

pub mod registry;

pub use registry::{FacilitatorRegistration, FacilitatorRegistry, FacilitatorRegistryBuilder};

use crate::ambiance::Ambiance;
use crate::types::{ExecutionMode, StepInputs, StepParameters};

/// Chooses the execution mode for a step invocation.
///
/// Returning `None` means the facilitator does not apply to this invocation.
pub trait Facilitator: Send + Sync {
    /// Name used in logs and ambiguity errors
    fn name(&self) -> &str;

    fn facilitate(
        &self,
        ambiance: &Ambiance,
        parameters: &StepParameters,
        inputs: &StepInputs,
    ) -> Option<ExecutionMode>;
}

/// Always answers with the same mode
#[derive(Debug, Clone)]
pub struct FixedModeFacilitator {
    name: String,
    mode: ExecutionMode,
}

impl FixedModeFacilitator {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            name: format!("fixed_{}", mode.to_string().to_lowercase()),
            mode,
        }
    }
}

impl Facilitator for FixedModeFacilitator {
    fn name(&self) -> &str {
        &self.name
    }

    fn facilitate(&self, _: &Ambiance, _: &StepParameters, _: &StepInputs) -> Option<ExecutionMode> {
        Some(self.mode)
    }
}

/// Decision function type accepted by [`PredicateFacilitator`].
///
/// A plain `fn` pointer rather than a closure so it cannot capture mutable
/// state.
pub type FacilitateFn = fn(&Ambiance, &StepParameters, &StepInputs) -> Option<ExecutionMode>;

/// Conditional facilitator backed by a plain function
#[derive(Debug, Clone)]
pub struct PredicateFacilitator {
    name: String,
    decide: FacilitateFn,
}

impl PredicateFacilitator {
    pub fn new(name: impl Into<String>, decide: FacilitateFn) -> Self {
        Self {
            name: name.into(),
            decide,
        }
    }
}

impl Facilitator for PredicateFacilitator {
    fn name(&self) -> &str {
        &self.name
    }

    fn facilitate(
        &self,
        ambiance: &Ambiance,
        parameters: &StepParameters,
        inputs: &StepInputs,
    ) -> Option<ExecutionMode> {
        (self.decide)(ambiance, parameters, inputs)
    }
}

/// Reads the mode from a string parameter, e.g. `{"execution_mode": "TASK"}`
#[derive(Debug, Clone)]
pub struct ParameterModeFacilitator {
    name: String,
    parameter: String,
}

impl ParameterModeFacilitator {
    pub fn new(parameter: impl Into<String>) -> Self {
        let parameter = parameter.into();
        Self {
            name: format!("parameter_{parameter}"),
            parameter,
        }
    }
}

impl Facilitator for ParameterModeFacilitator {
    fn name(&self) -> &str {
        &self.name
    }

    fn facilitate(
        &self,
        _: &Ambiance,
        parameters: &StepParameters,
        _: &StepInputs,
    ) -> Option<ExecutionMode> {
        parameters
            .get(&self.parameter)
            .and_then(|value| value.as_str())
            .and_then(|value| value.parse().ok())
    }
}
