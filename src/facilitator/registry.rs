//! # Facilitator Registry
//!
//! Explicit step-type → facilitator mapping assembled once at startup.
//!
//! Resolution order:
//! 1. Conditional facilitators are consulted tier by tier in ascending
//!    priority. The first tier where any facilitator answers decides; two
//!    answers in the same tier are ambiguous.
//! 2. If no conditional facilitator answered, exactly one unconditional
//!    facilitator must be registered for the step type.

use super::Facilitator;
use crate::ambiance::Ambiance;
use crate::error::FacilitationError;
use crate::types::{ExecutionMode, StepInputs, StepParameters, StepType};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Priority assigned to unconditional facilitators in errors and listings
pub const UNCONDITIONAL_PRIORITY: u32 = u32::MAX;

#[derive(Clone)]
pub struct FacilitatorRegistration {
    pub priority: u32,
    pub facilitator: Arc<dyn Facilitator>,
}

impl std::fmt::Debug for FacilitatorRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacilitatorRegistration")
            .field("priority", &self.priority)
            .field("facilitator", &self.facilitator.name())
            .finish()
    }
}

#[derive(Default, Clone)]
struct StepTypeEntry {
    /// Priority tier → facilitators, ascending
    conditional: BTreeMap<u32, Vec<Arc<dyn Facilitator>>>,
    unconditional: Vec<Arc<dyn Facilitator>>,
}

/// Builder collecting registrations before the registry is frozen
#[derive(Default)]
pub struct FacilitatorRegistryBuilder {
    entries: HashMap<StepType, StepTypeEntry>,
}

impl FacilitatorRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a conditional facilitator at `priority` (lower runs first)
    pub fn register(
        mut self,
        step_type: impl Into<StepType>,
        priority: u32,
        facilitator: Arc<dyn Facilitator>,
    ) -> Self {
        let step_type = step_type.into();
        debug!(
            step_type = %step_type,
            priority = priority,
            facilitator = facilitator.name(),
            "Registering conditional facilitator"
        );
        self.entries
            .entry(step_type)
            .or_default()
            .conditional
            .entry(priority)
            .or_default()
            .push(facilitator);
        self
    }

    /// Register the fallback facilitator consulted when no conditional one applies
    pub fn register_unconditional(
        mut self,
        step_type: impl Into<StepType>,
        facilitator: Arc<dyn Facilitator>,
    ) -> Self {
        let step_type = step_type.into();
        debug!(
            step_type = %step_type,
            facilitator = facilitator.name(),
            "Registering unconditional facilitator"
        );
        self.entries
            .entry(step_type)
            .or_default()
            .unconditional
            .push(facilitator);
        self
    }

    pub fn build(self) -> FacilitatorRegistry {
        info!(step_types = self.entries.len(), "Facilitator registry built");
        FacilitatorRegistry {
            entries: self.entries,
        }
    }
}

/// Immutable facilitator lookup
#[derive(Clone, Default)]
pub struct FacilitatorRegistry {
    entries: HashMap<StepType, StepTypeEntry>,
}

impl FacilitatorRegistry {
    pub fn builder() -> FacilitatorRegistryBuilder {
        FacilitatorRegistryBuilder::new()
    }

    pub fn contains(&self, step_type: &StepType) -> bool {
        self.entries.contains_key(step_type)
    }

    pub fn step_types(&self) -> Vec<StepType> {
        let mut types: Vec<_> = self.entries.keys().cloned().collect();
        types.sort();
        types
    }

    /// Registrations for a step type in resolution order
    pub fn registrations(&self, step_type: &StepType) -> Vec<FacilitatorRegistration> {
        let Some(entry) = self.entries.get(step_type) else {
            return Vec::new();
        };
        entry
            .conditional
            .iter()
            .flat_map(|(priority, facilitators)| {
                facilitators.iter().map(|f| FacilitatorRegistration {
                    priority: *priority,
                    facilitator: Arc::clone(f),
                })
            })
            .chain(entry.unconditional.iter().map(|f| FacilitatorRegistration {
                priority: UNCONDITIONAL_PRIORITY,
                facilitator: Arc::clone(f),
            }))
            .collect()
    }

    /// Resolve the execution mode for one invocation
    pub fn resolve(
        &self,
        step_type: &StepType,
        ambiance: &Ambiance,
        parameters: &StepParameters,
        inputs: &StepInputs,
    ) -> Result<ExecutionMode, FacilitationError> {
        let entry = self
            .entries
            .get(step_type)
            .ok_or_else(|| FacilitationError::UnknownStepType {
                step_type: step_type.clone(),
            })?;

        for (priority, facilitators) in &entry.conditional {
            let matches: Vec<(&str, ExecutionMode)> = facilitators
                .iter()
                .filter_map(|f| {
                    f.facilitate(ambiance, parameters, inputs)
                        .map(|mode| (f.name(), mode))
                })
                .collect();

            match matches.as_slice() {
                [] => continue,
                [(name, mode)] => {
                    debug!(
                        step_type = %step_type,
                        facilitator = *name,
                        priority = *priority,
                        mode = %mode,
                        "Execution mode facilitated"
                    );
                    return Ok(*mode);
                }
                _ => {
                    return Err(FacilitationError::AmbiguousFacilitators {
                        step_type: step_type.clone(),
                        priority: *priority,
                        candidates: matches.iter().map(|(name, _)| name.to_string()).collect(),
                    })
                }
            }
        }

        match entry.unconditional.as_slice() {
            [] => Err(FacilitationError::NoFacilitator {
                step_type: step_type.clone(),
            }),
            [facilitator] => facilitator
                .facilitate(ambiance, parameters, inputs)
                .ok_or_else(|| FacilitationError::NoFacilitator {
                    step_type: step_type.clone(),
                }),
            many => Err(FacilitationError::AmbiguousFacilitators {
                step_type: step_type.clone(),
                priority: UNCONDITIONAL_PRIORITY,
                candidates: many.iter().map(|f| f.name().to_string()).collect(),
            }),
        }
    }
}

impl std::fmt::Debug for FacilitatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacilitatorRegistry")
            .field("step_types", &self.step_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facilitator::{FixedModeFacilitator, ParameterModeFacilitator, PredicateFacilitator};
    use serde_json::json;
    use uuid::Uuid;

    fn ambiance() -> Ambiance {
        Ambiance::new(Uuid::new_v4(), "plan")
    }

    fn remote_if_flagged(
        _: &Ambiance,
        params: &StepParameters,
        _: &StepInputs,
    ) -> Option<ExecutionMode> {
        params
            .get("remote")
            .and_then(|v| v.as_bool())
            .filter(|remote| *remote)
            .map(|_| ExecutionMode::Task)
    }

    fn always_async(_: &Ambiance, _: &StepParameters, _: &StepInputs) -> Option<ExecutionMode> {
        Some(ExecutionMode::Async)
    }

    #[test]
    fn test_unknown_step_type() {
        let registry = FacilitatorRegistry::builder().build();
        let err = registry
            .resolve(&"shell".into(), &ambiance(), &json!({}), &StepInputs::new())
            .unwrap_err();
        assert!(matches!(err, FacilitationError::UnknownStepType { .. }));
    }

    #[test]
    fn test_conditional_wins_over_unconditional() {
        let registry = FacilitatorRegistry::builder()
            .register(
                "shell",
                10,
                Arc::new(PredicateFacilitator::new("remote", remote_if_flagged)),
            )
            .register_unconditional("shell", Arc::new(FixedModeFacilitator::new(ExecutionMode::Sync)))
            .build();

        let inputs = StepInputs::new();
        let remote = registry
            .resolve(&"shell".into(), &ambiance(), &json!({"remote": true}), &inputs)
            .unwrap();
        let local = registry
            .resolve(&"shell".into(), &ambiance(), &json!({"remote": false}), &inputs)
            .unwrap();

        assert_eq!(remote, ExecutionMode::Task);
        assert_eq!(local, ExecutionMode::Sync);
    }

    #[test]
    fn test_lower_priority_tier_decides_first() {
        let registry = FacilitatorRegistry::builder()
            .register("shell", 20, Arc::new(PredicateFacilitator::new("async", always_async)))
            .register(
                "shell",
                5,
                Arc::new(PredicateFacilitator::new("remote", remote_if_flagged)),
            )
            .build();

        let mode = registry
            .resolve(&"shell".into(), &ambiance(), &json!({"remote": true}), &StepInputs::new())
            .unwrap();
        assert_eq!(mode, ExecutionMode::Task);

        let names: Vec<_> = registry
            .registrations(&"shell".into())
            .iter()
            .map(|r| r.facilitator.name().to_string())
            .collect();
        assert_eq!(names, vec!["remote", "async"]);
    }

    #[test]
    fn test_same_tier_matches_are_ambiguous() {
        let registry = FacilitatorRegistry::builder()
            .register("shell", 1, Arc::new(PredicateFacilitator::new("a", always_async)))
            .register("shell", 1, Arc::new(ParameterModeFacilitator::new("mode")))
            .build();

        let err = registry
            .resolve(&"shell".into(), &ambiance(), &json!({"mode": "SYNC"}), &StepInputs::new())
            .unwrap_err();
        match err {
            FacilitationError::AmbiguousFacilitators {
                priority,
                candidates,
                ..
            } => {
                assert_eq!(priority, 1);
                assert_eq!(candidates.len(), 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_zero_or_many_unconditional_facilitators_is_fatal() {
        let none = FacilitatorRegistry::builder()
            .register(
                "shell",
                1,
                Arc::new(PredicateFacilitator::new("remote", remote_if_flagged)),
            )
            .build();
        let err = none
            .resolve(&"shell".into(), &ambiance(), &json!({}), &StepInputs::new())
            .unwrap_err();
        assert!(matches!(err, FacilitationError::NoFacilitator { .. }));

        let many = FacilitatorRegistry::builder()
            .register_unconditional("shell", Arc::new(FixedModeFacilitator::new(ExecutionMode::Sync)))
            .register_unconditional("shell", Arc::new(FixedModeFacilitator::new(ExecutionMode::Task)))
            .build();
        let err = many
            .resolve(&"shell".into(), &ambiance(), &json!({}), &StepInputs::new())
            .unwrap_err();
        assert!(matches!(
            err,
            FacilitationError::AmbiguousFacilitators {
                priority: UNCONDITIONAL_PRIORITY,
                ..
            }
        ));
    }

    #[test]
    fn test_resolution_is_repeatable() {
        let registry = FacilitatorRegistry::builder()
            .register_unconditional("shell", Arc::new(ParameterModeFacilitator::new("mode")))
            .build();
        let ambiance = ambiance();
        let params = json!({"mode": "children"});
        let inputs = StepInputs::new();

        let first = registry.resolve(&"shell".into(), &ambiance, &params, &inputs);
        let second = registry.resolve(&"shell".into(), &ambiance, &params, &inputs);
        assert_eq!(first, second);
        assert_eq!(first.unwrap(), ExecutionMode::Children);
    }
}
