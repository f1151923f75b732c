//! Invocation bookkeeping: lifecycle state, current waits, and the single
//! terminal response of every invocation the orchestrator has seen.

use crate::state_machine::{
    InvocationEvent, InvocationState, InvocationStateMachine, StateMachineResult,
};
use crate::types::{CorrelationId, ExecutionMode, StepResponse, StepType};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

/// Read-only view of an invocation
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationSnapshot {
    pub runtime_id: Uuid,
    pub step_type: StepType,
    pub mode: Option<ExecutionMode>,
    pub state: InvocationState,
    /// Correlation ids the invocation is currently suspended on
    pub waits: Vec<CorrelationId>,
    pub response: Option<StepResponse>,
}

#[derive(Debug)]
struct InvocationRecord {
    step_type: StepType,
    machine: InvocationStateMachine,
    waits: Vec<CorrelationId>,
    response: Option<StepResponse>,
    completed_at: Option<Instant>,
    waiters: Vec<oneshot::Sender<StepResponse>>,
}

impl InvocationRecord {
    fn new(step_type: StepType, machine: InvocationStateMachine) -> Self {
        Self {
            step_type,
            machine,
            waits: Vec::new(),
            response: None,
            completed_at: None,
            waiters: Vec::new(),
        }
    }

    fn snapshot(&self) -> InvocationSnapshot {
        InvocationSnapshot {
            runtime_id: self.machine.runtime_id(),
            step_type: self.step_type.clone(),
            mode: self.machine.mode(),
            state: self.machine.current_state(),
            waits: self.waits.clone(),
            response: self.response.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct InvocationTable {
    records: DashMap<Uuid, InvocationRecord>,
}

impl InvocationTable {
    /// Track an invocation that has been requested but not started, so it
    /// can be cancelled before it runs. `false` when the id is already known.
    pub fn reserve(&self, runtime_id: Uuid, step_type: StepType) -> bool {
        match self.records.entry(runtime_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(InvocationRecord::new(
                    step_type,
                    InvocationStateMachine::new(runtime_id),
                ));
                true
            }
        }
    }

    /// Forget a reservation that never started
    pub fn release(&self, runtime_id: Uuid) -> bool {
        self.records
            .remove_if(&runtime_id, |_, record| {
                record.machine.current_state() == InvocationState::Created
            })
            .is_some()
    }

    /// Track an invocation facilitated into `mode`, taking over its
    /// reservation if there is one.
    ///
    /// Returns the existing snapshot instead when the runtime id already
    /// started, or was completed (cancelled) while reserved.
    pub fn start(
        &self,
        runtime_id: Uuid,
        step_type: StepType,
        mode: ExecutionMode,
    ) -> Result<(), InvocationSnapshot> {
        match self.records.entry(runtime_id) {
            Entry::Occupied(mut existing) => {
                let record = existing.get_mut();
                if record.machine.current_state() != InvocationState::Created {
                    return Err(record.snapshot());
                }
                record
                    .machine
                    .transition(InvocationEvent::Facilitate(mode))
                    .map(|_| ())
                    .map_err(|_| record.snapshot())
            }
            Entry::Vacant(vacant) => {
                let mut machine = InvocationStateMachine::new(runtime_id);
                // Created → Facilitated cannot fail on a fresh machine
                let _ = machine.transition(InvocationEvent::Facilitate(mode));
                vacant.insert(InvocationRecord::new(step_type, machine));
                Ok(())
            }
        }
    }

    /// Re-create a suspended invocation from a restored wait
    pub fn restore(
        &self,
        runtime_id: Uuid,
        step_type: StepType,
        mode: ExecutionMode,
        correlation_id: CorrelationId,
    ) {
        self.records
            .entry(runtime_id)
            .or_insert_with(|| {
                InvocationRecord::new(step_type, InvocationStateMachine::resumed(runtime_id, mode))
            })
            .waits
            .push(correlation_id);
    }

    pub fn transition(
        &self,
        runtime_id: Uuid,
        event: InvocationEvent,
    ) -> Option<StateMachineResult<InvocationState>> {
        self.records
            .get_mut(&runtime_id)
            .map(|mut record| record.machine.transition(event))
    }

    /// Suspend on `waits`, replacing whatever the invocation waited on before
    pub fn suspend(
        &self,
        runtime_id: Uuid,
        event: InvocationEvent,
        waits: Vec<CorrelationId>,
    ) -> Option<StateMachineResult<InvocationState>> {
        self.records.get_mut(&runtime_id).map(|mut record| {
            let state = record.machine.transition(event)?;
            record.waits = waits;
            Ok(state)
        })
    }

    /// Record the terminal response. Only the first call per invocation
    /// succeeds; later ones return `false` and change nothing.
    pub fn complete(&self, runtime_id: Uuid, response: StepResponse) -> bool {
        let Some(mut record) = self.records.get_mut(&runtime_id) else {
            return false;
        };
        if record.machine.is_terminal() {
            return false;
        }
        if record
            .machine
            .transition(InvocationEvent::Complete(response.status))
            .is_err()
        {
            return false;
        }
        record.waits.clear();
        record.completed_at = Some(Instant::now());
        for waiter in record.waiters.drain(..) {
            let _ = waiter.send(response.clone());
        }
        record.response = Some(response);
        true
    }

    /// Receiver for the terminal response; already resolved when complete
    pub fn completion(&self, runtime_id: Uuid) -> Option<oneshot::Receiver<StepResponse>> {
        let mut record = self.records.get_mut(&runtime_id)?;
        let (sender, receiver) = oneshot::channel();
        match &record.response {
            Some(response) => {
                let _ = sender.send(response.clone());
            }
            None => record.waiters.push(sender),
        }
        Some(receiver)
    }

    pub fn snapshot(&self, runtime_id: Uuid) -> Option<InvocationSnapshot> {
        self.records.get(&runtime_id).map(|record| record.snapshot())
    }

    pub fn active_count(&self) -> usize {
        self.records
            .iter()
            .filter(|record| !record.machine.is_terminal())
            .count()
    }

    /// Forget invocations completed longer than `retention` ago
    pub fn prune_completed(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records.retain(|_, record| {
            record
                .completed_at
                .map_or(true, |at| now.saturating_duration_since(at) < retention)
        });
        before.saturating_sub(self.records.len())
    }
}
