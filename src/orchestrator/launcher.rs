//! Child launchers: how CHILD and CHILDREN invocations start their nested
//! executions.

use super::{InvocationOutcome, Orchestrator, StepInvocation};
use crate::ambiance::{Ambiance, Level};
use crate::error::StepExecutionError;
use crate::types::{ChildId, FailureKind, StepInputs, StepParameters, StepResponse};
use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

/// One nested execution requested by a parent invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ChildLaunch {
    pub child_id: ChildId,
    pub parent_runtime_id: Uuid,
    /// Parent context, including the parent's own level
    pub ambiance: Ambiance,
    /// Level the child runs under; its runtime id equals the child id
    pub level: Level,
    pub parameters: StepParameters,
    pub inputs: StepInputs,
}

impl ChildLaunch {
    pub fn into_invocation(self) -> StepInvocation {
        StepInvocation {
            ambiance: self.ambiance,
            level: self.level,
            parameters: self.parameters,
            inputs: self.inputs,
        }
    }
}

/// Starts nested executions and reports their terminal responses through
/// [`Orchestrator::on_child_response`]
#[async_trait]
pub trait ChildLauncher: Send + Sync {
    /// Start the child. Returning an error reports the child as ERRORED.
    async fn launch(
        &self,
        orchestrator: &Orchestrator,
        launch: ChildLaunch,
    ) -> Result<(), StepExecutionError>;

    /// Best-effort request to stop a child whose parent no longer waits
    async fn abandon(&self, orchestrator: &Orchestrator, child_id: ChildId);
}

/// Runs children as nested invocations of the same orchestrator.
///
/// Each child is tracked before its task is spawned, so abandoning it
/// completes it as cancelled even when it has not started running.
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcessChildLauncher;

#[async_trait]
impl ChildLauncher for InProcessChildLauncher {
    async fn launch(
        &self,
        orchestrator: &Orchestrator,
        launch: ChildLaunch,
    ) -> Result<(), StepExecutionError> {
        let child_id = launch.child_id;
        if !orchestrator.reserve(launch.level.runtime_id, launch.level.step_type.clone()) {
            debug!(child_id = %child_id, "Child already known, launching anyway");
        }
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let response = run_child(&orchestrator, launch).await;
            debug!(child_id = %child_id, status = %response.status, "Child execution finished");
            orchestrator.on_child_response(child_id, response).await;
        });
        Ok(())
    }

    async fn abandon(&self, orchestrator: &Orchestrator, child_id: ChildId) {
        if let Err(e) = orchestrator.cancel(child_id.as_uuid()).await {
            debug!(child_id = %child_id, error = %e, "Child not cancelled");
        }
    }
}

async fn run_child(orchestrator: &Orchestrator, launch: ChildLaunch) -> StepResponse {
    match orchestrator.invoke(launch.into_invocation()).await {
        Ok(InvocationOutcome::Completed(response)) => response,
        Ok(InvocationOutcome::Suspended { runtime_id, .. }) => {
            match orchestrator.completion(runtime_id) {
                Some(completion) => completion.await.unwrap_or_else(|_| {
                    StepResponse::errored(
                        FailureKind::Unexpected,
                        "child invocation dropped before completing",
                    )
                }),
                None => StepResponse::errored(
                    FailureKind::Unexpected,
                    format!("child invocation {runtime_id} is not tracked"),
                ),
            }
        }
        Err(e) => {
            warn!(error = %e, "Child facilitation failed");
            StepResponse::errored(FailureKind::Unexpected, e.to_string())
        }
    }
}
