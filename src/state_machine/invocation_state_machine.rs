use super::{
    errors::{StateMachineError, StateMachineResult},
    events::InvocationEvent,
    states::InvocationState,
};
use crate::types::ExecutionMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One applied transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: InvocationState,
    pub to: InvocationState,
    pub event: InvocationEvent,
    pub at: DateTime<Utc>,
}

/// State machine for a single step invocation
///
/// Owned by the invocation record; the orchestrator serializes access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationStateMachine {
    runtime_id: Uuid,
    state: InvocationState,
    mode: Option<ExecutionMode>,
    history: Vec<StateTransition>,
}

impl InvocationStateMachine {
    pub fn new(runtime_id: Uuid) -> Self {
        Self {
            runtime_id,
            state: InvocationState::default(),
            mode: None,
            history: Vec::new(),
        }
    }

    /// Machine for an invocation restored in a suspended state
    pub fn resumed(runtime_id: Uuid, mode: ExecutionMode) -> Self {
        let state = if mode.awaits_children() {
            InvocationState::AwaitingChildren
        } else {
            InvocationState::AwaitingResponse
        };
        Self {
            runtime_id,
            state,
            mode: Some(mode),
            history: Vec::new(),
        }
    }

    pub fn runtime_id(&self) -> Uuid {
        self.runtime_id
    }

    pub fn current_state(&self) -> InvocationState {
        self.state
    }

    pub fn mode(&self) -> Option<ExecutionMode> {
        self.mode
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_suspended(&self) -> bool {
        self.state.is_suspended()
    }

    pub fn transition(&mut self, event: InvocationEvent) -> StateMachineResult<InvocationState> {
        let target = self.determine_target_state(self.state, &event)?;
        self.check_guards(target, &event)?;

        if let InvocationEvent::Facilitate(mode) = event {
            self.mode = Some(mode);
        }
        self.history.push(StateTransition {
            from: self.state,
            to: target,
            event,
            at: Utc::now(),
        });
        tracing::trace!(
            runtime_id = %self.runtime_id,
            from = %self.state,
            to = %target,
            event = event.event_type(),
            "Invocation state transition"
        );
        self.state = target;
        Ok(target)
    }

    /// Target state for an event, without applying it
    pub fn determine_target_state(
        &self,
        current_state: InvocationState,
        event: &InvocationEvent,
    ) -> StateMachineResult<InvocationState> {
        let target = match (current_state, event) {
            (InvocationState::Created, InvocationEvent::Facilitate(_)) => {
                InvocationState::Facilitated
            }

            (InvocationState::Facilitated, InvocationEvent::StartSync) => {
                InvocationState::RunningSync
            }
            (InvocationState::Facilitated, InvocationEvent::AwaitResponse) => {
                InvocationState::AwaitingResponse
            }
            (InvocationState::Facilitated, InvocationEvent::AwaitChildren) => {
                InvocationState::AwaitingChildren
            }

            // Next TASK_CHAIN link
            (InvocationState::AwaitingResponse, InvocationEvent::AwaitResponse) => {
                InvocationState::AwaitingResponse
            }

            // Created → Completed: a launched child cancelled before it ran.
            // Facilitated → Completed covers failures before suspending.
            (
                InvocationState::Created
                | InvocationState::Facilitated
                | InvocationState::RunningSync
                | InvocationState::AwaitingResponse
                | InvocationState::AwaitingChildren,
                InvocationEvent::Complete(_),
            ) => InvocationState::Completed,

            (from_state, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: from_state.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }

    /// The suspending state must agree with the facilitated mode
    fn check_guards(
        &self,
        target: InvocationState,
        event: &InvocationEvent,
    ) -> StateMachineResult<()> {
        let Some(mode) = self.mode else {
            return Ok(());
        };
        let allowed = match target {
            InvocationState::RunningSync => mode == ExecutionMode::Sync,
            InvocationState::AwaitingResponse => mode.awaits_response(),
            InvocationState::AwaitingChildren => mode.awaits_children(),
            _ => true,
        };
        if !allowed {
            return Err(StateMachineError::GuardFailed {
                reason: format!("{} is not valid for mode {mode}", event.event_type()),
            });
        }
        if matches!(
            (self.state, target),
            (
                InvocationState::AwaitingResponse,
                InvocationState::AwaitingResponse
            )
        ) && mode != ExecutionMode::TaskChain
        {
            return Err(StateMachineError::GuardFailed {
                reason: format!("only {} re-suspends, not {mode}", ExecutionMode::TaskChain),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StepStatus;

    #[test]
    fn test_sync_lifecycle() {
        let mut machine = InvocationStateMachine::new(Uuid::new_v4());
        machine
            .transition(InvocationEvent::Facilitate(ExecutionMode::Sync))
            .unwrap();
        machine.transition(InvocationEvent::StartSync).unwrap();
        machine
            .transition(InvocationEvent::Complete(StepStatus::Succeeded))
            .unwrap();

        assert!(machine.is_terminal());
        assert_eq!(machine.mode(), Some(ExecutionMode::Sync));
        assert_eq!(machine.history().len(), 3);
    }

    #[test]
    fn test_completed_rejects_everything() {
        let mut machine = InvocationStateMachine::new(Uuid::new_v4());
        machine
            .transition(InvocationEvent::Facilitate(ExecutionMode::Task))
            .unwrap();
        machine
            .transition(InvocationEvent::Complete(StepStatus::Errored))
            .unwrap();

        let err = machine
            .transition(InvocationEvent::Complete(StepStatus::Succeeded))
            .unwrap_err();
        assert!(matches!(err, StateMachineError::InvalidTransition { .. }));
        assert_eq!(machine.current_state(), InvocationState::Completed);
    }

    #[test]
    fn test_unstarted_invocation_can_be_cancelled() {
        let mut machine = InvocationStateMachine::new(Uuid::new_v4());
        assert_eq!(
            machine
                .transition(InvocationEvent::Complete(StepStatus::Errored))
                .unwrap(),
            InvocationState::Completed
        );
        assert_eq!(machine.mode(), None);
        assert!(machine
            .transition(InvocationEvent::Facilitate(ExecutionMode::Sync))
            .is_err());
    }

    #[test]
    fn test_mode_guards_suspension() {
        let mut machine = InvocationStateMachine::new(Uuid::new_v4());
        machine
            .transition(InvocationEvent::Facilitate(ExecutionMode::Children))
            .unwrap();

        assert!(matches!(
            machine.transition(InvocationEvent::AwaitResponse),
            Err(StateMachineError::GuardFailed { .. })
        ));
        assert_eq!(
            machine.transition(InvocationEvent::AwaitChildren).unwrap(),
            InvocationState::AwaitingChildren
        );
    }

    #[test]
    fn test_only_task_chain_resuspends() {
        let mut chain = InvocationStateMachine::resumed(Uuid::new_v4(), ExecutionMode::TaskChain);
        assert_eq!(
            chain.transition(InvocationEvent::AwaitResponse).unwrap(),
            InvocationState::AwaitingResponse
        );

        let mut task = InvocationStateMachine::resumed(Uuid::new_v4(), ExecutionMode::Task);
        assert!(task.transition(InvocationEvent::AwaitResponse).is_err());
    }
}
