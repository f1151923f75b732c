//! Step type → mode → executable lookup, assembled at startup.

use super::Executable;
use crate::error::FacilitationError;
use crate::types::{ExecutionMode, StepType};
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct ExecutableRegistry {
    executables: HashMap<StepType, HashMap<ExecutionMode, Executable>>,
}

impl ExecutableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executable` under its own mode, replacing any previous one
    pub fn register(mut self, step_type: impl Into<StepType>, executable: Executable) -> Self {
        let step_type = step_type.into();
        let mode = executable.mode();
        debug!(step_type = %step_type, mode = %mode, "Registering executable");

        let previous = self
            .executables
            .entry(step_type.clone())
            .or_default()
            .insert(mode, executable);
        if previous.is_some() {
            warn!(step_type = %step_type, mode = %mode, "Executable already registered, replacing");
        }
        self
    }

    pub fn get(
        &self,
        step_type: &StepType,
        mode: ExecutionMode,
    ) -> Result<Executable, FacilitationError> {
        self.executables
            .get(step_type)
            .and_then(|modes| modes.get(&mode))
            .cloned()
            .ok_or_else(|| FacilitationError::UnsupportedMode {
                step_type: step_type.clone(),
                mode,
            })
    }

    pub fn supports(&self, step_type: &StepType, mode: ExecutionMode) -> bool {
        self.executables
            .get(step_type)
            .is_some_and(|modes| modes.contains_key(&mode))
    }

    /// Modes registered for a step type, in declaration order of [`ExecutionMode::ALL`]
    pub fn modes(&self, step_type: &StepType) -> Vec<ExecutionMode> {
        ExecutionMode::ALL
            .into_iter()
            .filter(|mode| self.supports(step_type, *mode))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::Ambiance;
    use crate::error::StepExecutionError;
    use crate::executable::{SyncExecutable, TaskExecutable, TaskRequest};
    use crate::types::{StepInputs, StepParameters, StepResponse};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Noop;

    #[async_trait]
    impl SyncExecutable for Noop {
        async fn execute_sync(
            &self,
            _: &Ambiance,
            _: &StepParameters,
            _: &StepInputs,
        ) -> Result<StepResponse, StepExecutionError> {
            Ok(StepResponse::succeeded())
        }
    }

    #[async_trait]
    impl TaskExecutable for Noop {
        async fn obtain_task(
            &self,
            _: &Ambiance,
            parameters: &StepParameters,
            _: &StepInputs,
        ) -> Result<TaskRequest, StepExecutionError> {
            Ok(TaskRequest::new(parameters.clone()))
        }
    }

    #[test]
    fn test_lookup_by_step_type_and_mode() {
        let registry = ExecutableRegistry::new()
            .register("shell", Executable::Sync(Arc::new(Noop)))
            .register("shell", Executable::Task(Arc::new(Noop)));

        let shell = StepType::from("shell");
        assert_eq!(registry.get(&shell, ExecutionMode::Task).unwrap().mode(), ExecutionMode::Task);
        assert_eq!(registry.modes(&shell), vec![ExecutionMode::Sync, ExecutionMode::Task]);

        let err = registry.get(&shell, ExecutionMode::Children).unwrap_err();
        assert_eq!(
            err,
            FacilitationError::UnsupportedMode {
                step_type: shell,
                mode: ExecutionMode::Children,
            }
        );
        assert!(!registry.supports(&"other".into(), ExecutionMode::Sync));
    }
}
