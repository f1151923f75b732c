//! # Orchestrator
//!
//! Drives step invocations end to end: facilitation picks the execution mode,
//! the matching executable runs, suspending modes register with the response
//! correlator, and resolved waits come back through a resumption loop that
//! calls the executable's completion handler.
//!
//! Every invocation produces exactly one terminal [`StepResponse`]. Only
//! facilitation errors abort an invocation before a response exists; every
//! other failure (executable errors and panics, dispatch failures, timeouts,
//! cancellation) resolves into a FAILED or ERRORED response.
//!
//! [`Orchestrator::invoke`] returns as soon as the invocation either completes
//! or suspends. Suspended invocations are resumed on other tasks; callers
//! that want the final response await [`Orchestrator::completion`].

mod invocation;
pub mod launcher;

pub use invocation::InvocationSnapshot;
pub use launcher::{ChildLaunch, ChildLauncher, InProcessChildLauncher};

use crate::ambiance::{Ambiance, Level};
use crate::config::OrchestratorConfig;
use crate::correlator::{
    CorrelationOutcome, PendingWait, Resolution, ResponseCorrelator, Resumption, WaitKind,
    WaitOutcome,
};
use crate::dispatcher::{InMemoryTaskQueue, TaskDispatch, TaskDispatcher, TaskQueue, WorkerPool};
use crate::error::{FacilitationError, OrchestrationError, OrchestrationResult};
use crate::events::{EventPublisher, OrchestrationEvent};
use crate::executable::{
    guarded, AsyncExecutable, ChildSpec, Executable, ExecutableRegistry, TaskRequest,
};
use crate::facilitator::FacilitatorRegistry;
use crate::logging::log_step_operation;
use crate::state_machine::{InvocationEvent, InvocationState};
use crate::store::{InMemoryWaitStore, WaitStore};
use crate::types::{
    ChildId, CorrelationId, ExecutionMode, FailureKind, ResponseData, StepInputs, StepParameters,
    StepResponse, StepType,
};
use invocation::InvocationTable;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A request to run one step
#[derive(Debug, Clone, PartialEq)]
pub struct StepInvocation {
    /// Context of the caller; the orchestrator appends `level`
    pub ambiance: Ambiance,
    pub level: Level,
    pub parameters: StepParameters,
    pub inputs: StepInputs,
}

impl StepInvocation {
    pub fn new(ambiance: Ambiance, level: Level) -> Self {
        Self {
            ambiance,
            level,
            parameters: StepParameters::Null,
            inputs: StepInputs::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: StepParameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    pub fn runtime_id(&self) -> Uuid {
        self.level.runtime_id
    }
}

/// What `invoke` returns to its caller
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    Completed(StepResponse),
    Suspended {
        runtime_id: Uuid,
        state: InvocationState,
    },
}

impl InvocationOutcome {
    pub fn response(&self) -> Option<&StepResponse> {
        match self {
            Self::Completed(response) => Some(response),
            Self::Suspended { .. } => None,
        }
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended { .. })
    }
}

/// Everything a resumed executable needs, rebuilt from its pending wait
#[derive(Debug, Clone)]
struct InvocationContext {
    runtime_id: Uuid,
    ambiance: Ambiance,
    step_type: StepType,
    mode: ExecutionMode,
    parameters: StepParameters,
    inputs: StepInputs,
}

impl InvocationContext {
    fn wait(
        &self,
        correlation_id: CorrelationId,
        kind: WaitKind,
        timeout: Option<Duration>,
    ) -> PendingWait {
        PendingWait::new(
            correlation_id,
            self.runtime_id,
            self.ambiance.clone(),
            self.step_type.clone(),
            self.mode,
            self.parameters.clone(),
            self.inputs.clone(),
            kind,
        )
        .with_timeout(timeout)
    }
}

impl From<&PendingWait> for InvocationContext {
    fn from(wait: &PendingWait) -> Self {
        Self {
            runtime_id: wait.runtime_id,
            ambiance: wait.ambiance.clone(),
            step_type: wait.step_type.clone(),
            mode: wait.mode,
            parameters: wait.parameters.clone(),
            inputs: wait.inputs.clone(),
        }
    }
}

struct OrchestratorInner {
    config: OrchestratorConfig,
    facilitators: FacilitatorRegistry,
    executables: ExecutableRegistry,
    dispatcher: TaskDispatcher,
    correlator: Arc<ResponseCorrelator>,
    launcher: Arc<dyn ChildLauncher>,
    store: Arc<dyn WaitStore>,
    events: EventPublisher,
    invocations: InvocationTable,
}

/// Cheaply cloneable handle to the step orchestrator
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Run one step until it completes or suspends.
    ///
    /// Invoking a runtime id that is already known returns its current
    /// outcome instead of running the step again.
    pub async fn invoke(
        &self,
        invocation: StepInvocation,
    ) -> Result<InvocationOutcome, FacilitationError> {
        let StepInvocation {
            ambiance,
            level,
            parameters,
            inputs,
        } = invocation;
        let runtime_id = level.runtime_id;
        let step_type = level.step_type.clone();
        let ambiance = ambiance.with_level(level);

        // A reserved child has a record but has not started yet
        if let Some(snapshot) = self.inner.invocations.snapshot(runtime_id) {
            if snapshot.state != InvocationState::Created {
                debug!(runtime_id = %runtime_id, "Invocation already known, returning current outcome");
                return Ok(Self::outcome_of(&snapshot));
            }
        }

        let (mode, executable) = match self.facilitate(&step_type, &ambiance, &parameters, &inputs)
        {
            Ok(resolved) => resolved,
            Err(e) => {
                self.inner.invocations.release(runtime_id);
                return Err(e);
            }
        };

        if let Err(existing) = self
            .inner
            .invocations
            .start(runtime_id, step_type.clone(), mode)
        {
            return Ok(Self::outcome_of(&existing));
        }
        self.inner.events.publish(OrchestrationEvent::InvocationStarted {
            runtime_id,
            step_type: step_type.clone(),
            mode,
        });
        log_step_operation(
            "invoke",
            runtime_id,
            step_type.as_str(),
            "facilitated",
            Some(&mode.to_string()),
        );

        let context = InvocationContext {
            runtime_id,
            ambiance,
            step_type,
            mode,
            parameters,
            inputs,
        };
        self.execute(context, executable).await;

        Ok(self.outcome(runtime_id).unwrap_or(InvocationOutcome::Suspended {
            runtime_id,
            state: InvocationState::Facilitated,
        }))
    }

    fn facilitate(
        &self,
        step_type: &StepType,
        ambiance: &Ambiance,
        parameters: &StepParameters,
        inputs: &StepInputs,
    ) -> Result<(ExecutionMode, Executable), FacilitationError> {
        let mode = self
            .inner
            .facilitators
            .resolve(step_type, ambiance, parameters, inputs)?;
        let executable = self.inner.executables.get(step_type, mode)?;
        Ok((mode, executable))
    }

    async fn execute(&self, context: InvocationContext, executable: Executable) {
        let InvocationContext {
            runtime_id,
            ref ambiance,
            ref parameters,
            ref inputs,
            ..
        } = context;

        match executable {
            Executable::Sync(exec) => {
                self.transition(runtime_id, InvocationEvent::StartSync);
                let response = guarded(exec.execute_sync(ambiance, parameters, inputs))
                    .await
                    .unwrap_or_else(StepResponse::from);
                self.finish(runtime_id, response);
            }
            Executable::Async(exec) => {
                match guarded(exec.execute_async(ambiance, parameters, inputs)).await {
                    Ok(started) => {
                        let timeout = started
                            .timeout
                            .unwrap_or(self.inner.config.correlator.default_async_timeout());
                        debug!(
                            runtime_id = %runtime_id,
                            correlation_id = %started.correlation_id,
                            status = ?started.status,
                            "Async work started"
                        );
                        let wait =
                            context.wait(started.correlation_id, WaitKind::Response, Some(timeout));
                        self.suspend_on_response(wait, &exec).await;
                    }
                    Err(e) => {
                        self.finish(runtime_id, e.into());
                    }
                }
            }
            Executable::Task(exec) => {
                match guarded(exec.obtain_task(ambiance, parameters, inputs)).await {
                    Ok(request) => {
                        self.dispatch_task(&context, request, WaitKind::Response)
                            .await
                    }
                    Err(e) => {
                        self.finish(runtime_id, e.into());
                    }
                }
            }
            Executable::TaskChain(exec) => {
                match guarded(exec.obtain_task_chain(ambiance, parameters, inputs)).await {
                    Ok(chain) if chain.is_empty() => {
                        self.finish(runtime_id, StepResponse::succeeded());
                    }
                    Ok(mut chain) => {
                        let first = chain.remove(0);
                        let kind = WaitKind::ChainLink {
                            index: 0,
                            remaining: chain,
                            completed: Vec::new(),
                        };
                        self.dispatch_task(&context, first, kind).await;
                    }
                    Err(e) => {
                        self.finish(runtime_id, e.into());
                    }
                }
            }
            Executable::Child(exec) => {
                match guarded(exec.obtain_child(ambiance, parameters, inputs)).await {
                    Ok(child) => self.spawn_children(&context, vec![child], false).await,
                    Err(e) => {
                        self.finish(runtime_id, e.into());
                    }
                }
            }
            Executable::Children(exec) => {
                match guarded(exec.obtain_children(ambiance, parameters, inputs)).await {
                    Ok(spawn) if spawn.children.is_empty() => {
                        let response = guarded(exec.handle_children_response(
                            ambiance,
                            parameters,
                            &HashMap::new(),
                        ))
                        .await
                        .unwrap_or_else(StepResponse::from);
                        self.finish(runtime_id, response);
                    }
                    Ok(spawn) => {
                        self.spawn_children(
                            &context,
                            spawn.children,
                            spawn.cancel_siblings_on_failure,
                        )
                        .await
                    }
                    Err(e) => {
                        self.finish(runtime_id, e.into());
                    }
                }
            }
        }
    }

    /// Suspend on an ASYNC correlation id chosen by the executable
    async fn suspend_on_response(&self, wait: PendingWait, exec: &Arc<dyn AsyncExecutable>) {
        let runtime_id = wait.runtime_id;
        let correlation_id = wait.correlation_id;
        let mode = wait.mode;
        let (ambiance, parameters) = (wait.ambiance.clone(), wait.parameters.clone());
        if !self.suspend(
            runtime_id,
            InvocationEvent::AwaitResponse,
            vec![correlation_id],
        ) {
            exec.handle_abort(&ambiance, &parameters, correlation_id).await;
            return;
        }
        self.publish_suspended(runtime_id, correlation_id, mode);

        if let Err(e) = self.inner.correlator.register_wait(wait).await {
            error!(runtime_id = %runtime_id, error = %e, "Failed to register pending wait");
            self.finish(
                runtime_id,
                StepResponse::errored(FailureKind::Unexpected, e.to_string()),
            );
            return;
        }
        if self.withdraw_if_finished(runtime_id, correlation_id).await {
            exec.handle_abort(&ambiance, &parameters, correlation_id).await;
        }
    }

    /// Register the wait first, then queue the task, so even an immediate
    /// worker response finds its wait
    async fn dispatch_task(&self, context: &InvocationContext, request: TaskRequest, kind: WaitKind) {
        let runtime_id = context.runtime_id;
        let correlation_id = self.inner.dispatcher.issue_correlation_id();
        let timeout = request
            .timeout()
            .unwrap_or(self.inner.config.correlator.default_task_timeout());

        if !self.suspend(
            runtime_id,
            InvocationEvent::AwaitResponse,
            vec![correlation_id],
        ) {
            return;
        }
        let wait = context.wait(correlation_id, kind, Some(timeout));
        if let Err(e) = self.inner.correlator.register_wait(wait).await {
            error!(runtime_id = %runtime_id, error = %e, "Failed to register task wait");
            self.finish(
                runtime_id,
                StepResponse::errored(FailureKind::Unexpected, e.to_string()),
            );
            return;
        }
        if self.withdraw_if_finished(runtime_id, correlation_id).await {
            return;
        }
        self.publish_suspended(runtime_id, correlation_id, context.mode);

        let dispatch = TaskDispatch {
            ambiance: context.ambiance.clone(),
            step_type: context.step_type.clone(),
            request,
        };
        match self
            .inner
            .dispatcher
            .dispatch_with_id(correlation_id, &dispatch)
            .await
        {
            Ok(_) => {
                // Retries can outlive the deadline or a cancel; nobody
                // releases the task then
                self.withdraw_if_finished(runtime_id, correlation_id).await;
                if matches!(
                    self.inner.correlator.resolution(&correlation_id),
                    Some(Resolution::Expired | Resolution::Cancelled)
                ) {
                    debug!(
                        runtime_id = %runtime_id,
                        correlation_id = %correlation_id,
                        "Wait resolved while dispatching, abandoning task"
                    );
                    self.inner.dispatcher.abandon(correlation_id).await;
                }
            }
            Err(e) => {
                // Losing the cancel means the wait already resolved (expired)
                // and the resumption owns the outcome
                if self.inner.correlator.cancel(correlation_id).await.is_some() {
                    warn!(
                        runtime_id = %runtime_id,
                        correlation_id = %correlation_id,
                        error = %e,
                        "Task dispatch failed"
                    );
                    self.finish(
                        runtime_id,
                        StepResponse::errored(FailureKind::Dispatch, e.to_string()),
                    );
                }
            }
        }
    }

    /// Cancel a freshly registered wait whose invocation completed meanwhile.
    /// `true` when the wait was withdrawn.
    async fn withdraw_if_finished(&self, runtime_id: Uuid, correlation_id: CorrelationId) -> bool {
        let finished = self
            .inner
            .invocations
            .snapshot(runtime_id)
            .is_some_and(|snapshot| snapshot.state.is_terminal());
        if !finished {
            return false;
        }
        debug!(
            runtime_id = %runtime_id,
            correlation_id = %correlation_id,
            "Invocation finished while suspending, withdrawing wait"
        );
        self.inner.correlator.cancel(correlation_id).await.is_some()
    }

    async fn spawn_children(
        &self,
        context: &InvocationContext,
        specs: Vec<ChildSpec>,
        cancel_siblings_on_failure: bool,
    ) {
        let runtime_id = context.runtime_id;
        let aggregate_id = self.inner.dispatcher.issue_correlation_id();
        let launches: Vec<ChildLaunch> = specs
            .into_iter()
            .map(|spec| {
                let level = Level::step(spec.identifier, spec.step_type);
                ChildLaunch {
                    child_id: ChildId::from_uuid(level.runtime_id),
                    parent_runtime_id: runtime_id,
                    ambiance: context.ambiance.clone(),
                    level,
                    parameters: spec.parameters,
                    inputs: spec.inputs,
                }
            })
            .collect();
        let expected = launches
            .iter()
            .map(|launch| (launch.child_id, launch.level.identifier.clone()))
            .collect();

        if !self.suspend(
            runtime_id,
            InvocationEvent::AwaitChildren,
            vec![aggregate_id],
        ) {
            return;
        }
        let wait = context.wait(
            aggregate_id,
            WaitKind::Children,
            self.inner.config.correlator.default_children_timeout(),
        );
        if let Err(e) = self
            .inner
            .correlator
            .register_children(wait, expected, cancel_siblings_on_failure)
            .await
        {
            error!(runtime_id = %runtime_id, error = %e, "Failed to register children aggregate");
            self.finish(
                runtime_id,
                StepResponse::errored(FailureKind::Unexpected, e.to_string()),
            );
            return;
        }
        if self.withdraw_if_finished(runtime_id, aggregate_id).await {
            return;
        }
        self.publish_suspended(runtime_id, aggregate_id, context.mode);
        info!(
            runtime_id = %runtime_id,
            aggregate_id = %aggregate_id,
            children = launches.len(),
            "Launching children"
        );

        for launch in launches {
            let child_id = launch.child_id;
            if let Err(e) = self.inner.launcher.launch(self, launch).await {
                warn!(runtime_id = %runtime_id, child_id = %child_id, error = %e, "Child launch failed");
                self.inner
                    .correlator
                    .on_child_response(
                        child_id,
                        StepResponse::errored(FailureKind::Unexpected, e.to_string()),
                    )
                    .await;
            }
        }
    }

    /// Continue an invocation whose wait was resolved by the correlator
    async fn resume(&self, resumption: Resumption) {
        let Resumption { wait, outcome } = resumption;
        let runtime_id = wait.runtime_id;
        let correlation_id = wait.correlation_id;

        let executable = match self.inner.executables.get(&wait.step_type, wait.mode) {
            Ok(executable) => executable,
            Err(e) => {
                error!(runtime_id = %runtime_id, error = %e, "No executable to resume");
                self.finish(
                    runtime_id,
                    StepResponse::errored(FailureKind::Unexpected, e.to_string()),
                );
                return;
            }
        };
        let context = InvocationContext::from(&wait);
        let (ambiance, parameters) = (&context.ambiance, &context.parameters);

        match (outcome, executable) {
            (WaitOutcome::Expired(data), executable) => {
                match &executable {
                    Executable::Task(_) | Executable::TaskChain(_) => {
                        self.inner.dispatcher.abandon(correlation_id).await
                    }
                    Executable::Async(exec) => {
                        exec.handle_abort(ambiance, parameters, correlation_id)
                            .await
                    }
                    Executable::Child(_) | Executable::Children(_) => {
                        self.abandon_outstanding_children(correlation_id).await
                    }
                    Executable::Sync(_) => {}
                }
                let message = data
                    .failure
                    .map(|failure| failure.message)
                    .unwrap_or_else(|| "wait expired".to_string());
                self.finish(runtime_id, StepResponse::failed(FailureKind::Timeout, message));
            }
            (WaitOutcome::Response(data), Executable::Async(exec)) => {
                let responses = HashMap::from([(correlation_id, data)]);
                let response =
                    guarded(exec.handle_async_response(ambiance, parameters, &responses))
                        .await
                        .unwrap_or_else(StepResponse::from);
                self.finish(runtime_id, response);
            }
            (WaitOutcome::Response(data), Executable::Task(exec)) => {
                self.inner.dispatcher.release(correlation_id).await;
                let responses = HashMap::from([(correlation_id, data)]);
                let response = guarded(exec.handle_task_response(ambiance, parameters, &responses))
                    .await
                    .unwrap_or_else(StepResponse::from);
                self.finish(runtime_id, response);
            }
            (WaitOutcome::Response(data), Executable::TaskChain(exec)) => {
                self.inner.dispatcher.release(correlation_id).await;
                let WaitKind::ChainLink {
                    index,
                    mut remaining,
                    mut completed,
                } = wait.kind
                else {
                    self.finish(
                        runtime_id,
                        StepResponse::errored(
                            FailureKind::Unexpected,
                            "task chain resumed without chain state",
                        ),
                    );
                    return;
                };
                let link_failed = !data.is_success();
                completed.push((correlation_id, data));

                if link_failed || remaining.is_empty() {
                    debug!(
                        runtime_id = %runtime_id,
                        links = completed.len(),
                        link_failed,
                        "Task chain finished"
                    );
                    let response = guarded(exec.handle_task_chain_response(
                        ambiance,
                        parameters,
                        &completed,
                    ))
                    .await
                    .unwrap_or_else(StepResponse::from);
                    self.finish(runtime_id, response);
                } else {
                    let next = remaining.remove(0);
                    let kind = WaitKind::ChainLink {
                        index: index + 1,
                        remaining,
                        completed,
                    };
                    self.dispatch_task(&context, next, kind).await;
                }
            }
            (
                WaitOutcome::ChildrenCompleted {
                    responses,
                    cancelled,
                },
                executable,
            ) => {
                for child_id in cancelled {
                    self.inner.launcher.abandon(self, child_id).await;
                }
                let response = match executable {
                    Executable::Children(exec) => {
                        guarded(exec.handle_children_response(ambiance, parameters, &responses))
                            .await
                            .unwrap_or_else(StepResponse::from)
                    }
                    Executable::Child(exec) => match responses.into_iter().next() {
                        Some((child_id, child)) => guarded(exec.handle_child_response(
                            ambiance, parameters, child_id, child,
                        ))
                        .await
                        .unwrap_or_else(StepResponse::from),
                        None => StepResponse::errored(
                            FailureKind::Unexpected,
                            "child completed without a response",
                        ),
                    },
                    other => StepResponse::errored(
                        FailureKind::Unexpected,
                        format!("children completion delivered to {} executable", other.mode()),
                    ),
                };
                self.finish(runtime_id, response);
            }
            (WaitOutcome::Response(_), other) => {
                self.finish(
                    runtime_id,
                    StepResponse::errored(
                        FailureKind::Unexpected,
                        format!("correlated response delivered to {} executable", other.mode()),
                    ),
                );
            }
        }
    }

    async fn abandon_outstanding_children(&self, aggregate_id: CorrelationId) {
        let outstanding = self
            .inner
            .correlator
            .aggregate_snapshot(&aggregate_id)
            .map(|aggregate| aggregate.outstanding())
            .unwrap_or_default();
        for child_id in outstanding {
            self.inner.launcher.abandon(self, child_id).await;
        }
    }

    /// Deliver a remote task or async completion
    pub async fn on_response(
        &self,
        correlation_id: CorrelationId,
        data: ResponseData,
    ) -> CorrelationOutcome {
        self.inner.correlator.on_response(correlation_id, data).await
    }

    /// Deliver a child's terminal response to its parent's aggregate
    pub async fn on_child_response(
        &self,
        child_id: ChildId,
        response: StepResponse,
    ) -> CorrelationOutcome {
        self.inner
            .correlator
            .on_child_response(child_id, response)
            .await
    }

    /// Cancel an invocation.
    ///
    /// Removes its waits, asks the dispatcher, the async executable, or the
    /// child launcher to drop outstanding work, and completes the invocation
    /// as ERRORED/cancelled. Returns `false` when it had already completed.
    pub async fn cancel(&self, runtime_id: Uuid) -> OrchestrationResult<bool> {
        let snapshot = self
            .inner
            .invocations
            .snapshot(runtime_id)
            .ok_or(OrchestrationError::UnknownInvocation { runtime_id })?;
        if snapshot.state.is_terminal() {
            return Ok(false);
        }

        for correlation_id in snapshot.waits {
            let Some(cancelled) = self.inner.correlator.cancel(correlation_id).await else {
                continue;
            };
            let wait = &cancelled.wait;
            match wait.mode {
                ExecutionMode::Task | ExecutionMode::TaskChain => {
                    self.inner.dispatcher.abandon(correlation_id).await
                }
                ExecutionMode::Async => {
                    if let Ok(Executable::Async(exec)) =
                        self.inner.executables.get(&wait.step_type, wait.mode)
                    {
                        exec.handle_abort(&wait.ambiance, &wait.parameters, correlation_id)
                            .await;
                    }
                }
                ExecutionMode::Child | ExecutionMode::Children => {
                    for child_id in &cancelled.outstanding_children {
                        self.inner.launcher.abandon(self, *child_id).await;
                    }
                }
                ExecutionMode::Sync => {}
            }
        }

        let cancelled = self.finish(
            runtime_id,
            StepResponse::errored(FailureKind::Cancelled, "invocation cancelled"),
        );
        if cancelled {
            info!(runtime_id = %runtime_id, "Invocation cancelled");
            self.inner
                .events
                .publish(OrchestrationEvent::InvocationCancelled { runtime_id });
        }
        Ok(cancelled)
    }

    /// Receiver resolving to the invocation's terminal response
    pub fn completion(&self, runtime_id: Uuid) -> Option<oneshot::Receiver<StepResponse>> {
        self.inner.invocations.completion(runtime_id)
    }

    /// Invoke and wait for the terminal response, however long it takes
    pub async fn run(&self, invocation: StepInvocation) -> Result<StepResponse, FacilitationError> {
        match self.invoke(invocation).await? {
            InvocationOutcome::Completed(response) => Ok(response),
            InvocationOutcome::Suspended { runtime_id, .. } => Ok(match self.completion(runtime_id)
            {
                Some(completion) => completion.await.unwrap_or_else(|_| {
                    StepResponse::errored(FailureKind::Unexpected, "invocation dropped")
                }),
                None => StepResponse::errored(
                    FailureKind::Unexpected,
                    format!("invocation {runtime_id} is not tracked"),
                ),
            }),
        }
    }

    pub fn invocation(&self, runtime_id: Uuid) -> Option<InvocationSnapshot> {
        self.inner.invocations.snapshot(runtime_id)
    }

    pub fn active_invocations(&self) -> usize {
        self.inner.invocations.active_count()
    }

    /// Expire waits past their deadline; see [`ResponseCorrelator::expire_overdue`]
    pub async fn expire_overdue(&self) -> usize {
        self.inner.correlator.expire_overdue().await
    }

    /// Drop tombstones and completed invocations past retention
    pub fn prune(&self) -> usize {
        let retention = self.inner.config.correlator.tombstone_retention();
        self.inner.correlator.prune_tombstones()
            + self.inner.invocations.prune_completed(retention)
    }

    /// Re-register waits and aggregates persisted by the wait store.
    ///
    /// Invocations come back suspended; their completion handlers run when
    /// the response arrives or the (absolute) deadline passes.
    pub async fn restore_from_store(&self) -> OrchestrationResult<usize> {
        let waits = self.inner.store.load_waits().await?;
        let aggregates = self.inner.store.load_aggregates().await?;
        for wait in &waits {
            self.inner.invocations.restore(
                wait.runtime_id,
                wait.step_type.clone(),
                wait.mode,
                wait.correlation_id,
            );
        }
        Ok(self.inner.correlator.restore(waits, aggregates))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventPublisher {
        &self.inner.events
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.inner.dispatcher
    }

    pub fn correlator(&self) -> &Arc<ResponseCorrelator> {
        &self.inner.correlator
    }

    fn transition(&self, runtime_id: Uuid, event: InvocationEvent) {
        if let Some(Err(e)) = self.inner.invocations.transition(runtime_id, event) {
            warn!(runtime_id = %runtime_id, error = %e, "Rejected invocation transition");
        }
    }

    /// `false` when the invocation can no longer suspend, usually because
    /// it was cancelled while its executable ran
    fn suspend(&self, runtime_id: Uuid, event: InvocationEvent, waits: Vec<CorrelationId>) -> bool {
        match self.inner.invocations.suspend(runtime_id, event, waits) {
            Some(Ok(_)) => true,
            Some(Err(e)) => {
                debug!(runtime_id = %runtime_id, error = %e, "Rejected invocation suspension");
                false
            }
            None => {
                warn!(runtime_id = %runtime_id, "Suspending an untracked invocation");
                false
            }
        }
    }

    /// Track a child before it is launched so cancelling the parent can
    /// complete it even if it never got to run
    fn reserve(&self, runtime_id: Uuid, step_type: StepType) -> bool {
        self.inner.invocations.reserve(runtime_id, step_type)
    }

    fn publish_suspended(&self, runtime_id: Uuid, correlation_id: CorrelationId, mode: ExecutionMode) {
        self.inner
            .events
            .publish(OrchestrationEvent::InvocationSuspended {
                runtime_id,
                correlation_id,
                mode,
            });
    }

    /// Record the terminal response; `false` if one was recorded before
    fn finish(&self, runtime_id: Uuid, response: StepResponse) -> bool {
        let status = response.status;
        let details = response.failure.as_ref().map(|failure| failure.message.clone());
        if !self.inner.invocations.complete(runtime_id, response) {
            debug!(runtime_id = %runtime_id, %status, "Invocation already completed, dropping response");
            return false;
        }
        let step_type = self
            .inner
            .invocations
            .snapshot(runtime_id)
            .map(|snapshot| snapshot.step_type.to_string())
            .unwrap_or_default();
        log_step_operation(
            "complete",
            runtime_id,
            &step_type,
            &status.to_string(),
            details.as_deref(),
        );
        self.inner
            .events
            .publish(OrchestrationEvent::InvocationCompleted { runtime_id, status });
        true
    }

    fn outcome(&self, runtime_id: Uuid) -> Option<InvocationOutcome> {
        self.inner
            .invocations
            .snapshot(runtime_id)
            .map(|snapshot| Self::outcome_of(&snapshot))
    }

    fn outcome_of(snapshot: &InvocationSnapshot) -> InvocationOutcome {
        match &snapshot.response {
            Some(response) => InvocationOutcome::Completed(response.clone()),
            None => InvocationOutcome::Suspended {
                runtime_id: snapshot.runtime_id,
                state: snapshot.state,
            },
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("dispatcher", &self.inner.dispatcher)
            .field("correlator", &self.inner.correlator)
            .field("active_invocations", &self.inner.invocations.active_count())
            .finish()
    }
}

/// Hands every resolved wait to its own task
async fn resumption_loop(
    orchestrator: Weak<OrchestratorInner>,
    mut resumptions: mpsc::UnboundedReceiver<Resumption>,
) {
    while let Some(resumption) = resumptions.recv().await {
        let Some(inner) = orchestrator.upgrade() else {
            break;
        };
        let orchestrator = Orchestrator { inner };
        tokio::spawn(async move { orchestrator.resume(resumption).await });
    }
    debug!("Resumption loop stopped");
}

/// Periodically drops tombstones and completed invocations past retention
async fn prune_loop(orchestrator: Weak<OrchestratorInner>, period: Duration) {
    // First tick one period out; `interval` would fire immediately
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        interval.tick().await;
        let Some(inner) = orchestrator.upgrade() else {
            break;
        };
        let pruned = Orchestrator { inner }.prune();
        if pruned > 0 {
            debug!(pruned = pruned, "Pruned resolved waits and invocations");
        }
    }
    debug!("Prune loop stopped");
}

/// Assembles an [`Orchestrator`] from its registries and collaborators
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    facilitators: FacilitatorRegistry,
    executables: ExecutableRegistry,
    task_queue: Option<Arc<dyn TaskQueue>>,
    worker_pool: Option<WorkerPool>,
    store: Option<Arc<dyn WaitStore>>,
    launcher: Option<Arc<dyn ChildLauncher>>,
    events: Option<EventPublisher>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            facilitators: FacilitatorRegistry::default(),
            executables: ExecutableRegistry::default(),
            task_queue: None,
            worker_pool: None,
            store: None,
            launcher: None,
            events: None,
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_facilitators(mut self, facilitators: FacilitatorRegistry) -> Self {
        self.facilitators = facilitators;
        self
    }

    pub fn with_executables(mut self, executables: ExecutableRegistry) -> Self {
        self.executables = executables;
        self
    }

    /// Without a queue, TASK and TASK_CHAIN dispatch fails with a closed queue
    pub fn with_task_queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.task_queue = Some(queue);
        self
    }

    pub fn with_worker_pool(mut self, pool: WorkerPool) -> Self {
        self.worker_pool = Some(pool);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn WaitStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_child_launcher(mut self, launcher: Arc<dyn ChildLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_event_publisher(mut self, events: EventPublisher) -> Self {
        self.events = Some(events);
        self
    }

    /// Validate configuration and start the resumption and prune loops.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> OrchestrationResult<Orchestrator> {
        self.config.validate()?;
        let config = self.config;

        let events = self
            .events
            .unwrap_or_else(|| EventPublisher::new(config.events.channel_capacity));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryWaitStore::new()));
        let queue = self.task_queue.unwrap_or_else(|| {
            let (queue, _closed) = InMemoryTaskQueue::new(config.dispatch.queue_capacity);
            Arc::new(queue)
        });
        let pool = self.worker_pool.unwrap_or_else(|| {
            WorkerPool::new(config.worker_pool.clone(), config.dispatch.load_balancer)
        });
        let dispatcher = TaskDispatcher::new(
            pool,
            queue,
            config.dispatch.clone(),
            config.circuit_breaker.clone(),
        );
        let (correlator, resumptions) =
            ResponseCorrelator::new(config.correlator.clone(), Arc::clone(&store), events.clone());

        let inner = Arc::new(OrchestratorInner {
            facilitators: self.facilitators,
            executables: self.executables,
            dispatcher,
            correlator,
            launcher: self
                .launcher
                .unwrap_or_else(|| Arc::new(InProcessChildLauncher)),
            store,
            events,
            invocations: InvocationTable::default(),
            config,
        });
        tokio::spawn(resumption_loop(Arc::downgrade(&inner), resumptions));
        tokio::spawn(prune_loop(
            Arc::downgrade(&inner),
            inner.config.correlator.prune_interval(),
        ));
        info!("Orchestrator started");

        Ok(Orchestrator { inner })
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StepExecutionError;
    use crate::executable::{
        AsyncExecutable, AsyncExecutableResponse, ChildrenExecutable, ChildrenSpawn,
        SyncExecutable,
    };
    use crate::facilitator::FixedModeFacilitator;
    use crate::types::StepStatus;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo;

    #[async_trait]
    impl SyncExecutable for Echo {
        async fn execute_sync(
            &self,
            _ambiance: &Ambiance,
            parameters: &StepParameters,
            _inputs: &StepInputs,
        ) -> Result<StepResponse, StepExecutionError> {
            if parameters.get("fail").is_some() {
                return Err(StepExecutionError::failed("asked to fail"));
            }
            Ok(StepResponse::succeeded().with_output("echo", parameters.clone()))
        }
    }

    /// Async executable whose external system is the test itself
    #[derive(Default)]
    struct External {
        aborted: AtomicUsize,
    }

    #[async_trait]
    impl AsyncExecutable for External {
        async fn execute_async(
            &self,
            _ambiance: &Ambiance,
            parameters: &StepParameters,
            _inputs: &StepInputs,
        ) -> Result<AsyncExecutableResponse, StepExecutionError> {
            let id = parameters["correlation_id"]
                .as_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .map(CorrelationId::from_uuid)
                .ok_or_else(|| StepExecutionError::unexpected("missing correlation_id"))?;
            Ok(AsyncExecutableResponse::running(id).with_timeout(Duration::from_secs(30)))
        }

        async fn handle_async_response(
            &self,
            _ambiance: &Ambiance,
            _parameters: &StepParameters,
            responses: &HashMap<CorrelationId, ResponseData>,
        ) -> Result<StepResponse, StepExecutionError> {
            let data = responses
                .values()
                .next()
                .cloned()
                .ok_or_else(|| StepExecutionError::unexpected("no response"))?;
            Ok(data.into_step_response())
        }

        async fn handle_abort(
            &self,
            _ambiance: &Ambiance,
            _parameters: &StepParameters,
            _correlation_id: CorrelationId,
        ) {
            self.aborted.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FanOut;

    #[async_trait]
    impl ChildrenExecutable for FanOut {
        async fn obtain_children(
            &self,
            _ambiance: &Ambiance,
            parameters: &StepParameters,
            _inputs: &StepInputs,
        ) -> Result<ChildrenSpawn, StepExecutionError> {
            let count = parameters["count"].as_u64().unwrap_or(0);
            Ok(ChildrenSpawn::new(
                (0..count)
                    .map(|i| {
                        ChildSpec::new(format!("child-{i}"), "echo")
                            .with_parameters(json!({ "index": i }))
                    })
                    .collect(),
            ))
        }
    }

    fn orchestrator(external: Arc<External>) -> Orchestrator {
        orchestrator_with(OrchestratorConfig::default(), external)
    }

    fn orchestrator_with(config: OrchestratorConfig, external: Arc<External>) -> Orchestrator {
        let facilitators = FacilitatorRegistry::builder()
            .register_unconditional("echo", Arc::new(FixedModeFacilitator::new(ExecutionMode::Sync)))
            .register_unconditional(
                "external",
                Arc::new(FixedModeFacilitator::new(ExecutionMode::Async)),
            )
            .register_unconditional(
                "fan_out",
                Arc::new(FixedModeFacilitator::new(ExecutionMode::Children)),
            )
            .build();
        let executables = ExecutableRegistry::new()
            .register("echo", Executable::Sync(Arc::new(Echo)))
            .register("external", Executable::Async(external))
            .register("fan_out", Executable::Children(Arc::new(FanOut)));

        Orchestrator::builder()
            .with_config(config)
            .with_facilitators(facilitators)
            .with_executables(executables)
            .build()
            .unwrap()
    }

    fn root() -> Ambiance {
        Ambiance::new(Uuid::new_v4(), "plan")
    }

    #[tokio::test]
    async fn test_sync_step_completes_inline() {
        let orchestrator = orchestrator(Arc::default());
        let invocation = StepInvocation::new(root(), Level::step("say", "echo"))
            .with_parameters(json!({"msg": "hi"}));

        let outcome = orchestrator.invoke(invocation).await.unwrap();
        let response = outcome.response().unwrap();
        assert!(response.is_success());
        assert_eq!(response.outputs["echo"], json!({"msg": "hi"}));
    }

    #[tokio::test]
    async fn test_executable_error_becomes_failed_response() {
        let orchestrator = orchestrator(Arc::default());
        let invocation = StepInvocation::new(root(), Level::step("say", "echo"))
            .with_parameters(json!({"fail": true}));

        let outcome = orchestrator.invoke(invocation).await.unwrap();
        assert_eq!(outcome.response().unwrap().status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_step_type_is_fatal() {
        let orchestrator = orchestrator(Arc::default());
        let err = orchestrator
            .invoke(StepInvocation::new(root(), Level::step("x", "nope")))
            .await
            .unwrap_err();
        assert!(matches!(err, FacilitationError::UnknownStepType { .. }));
    }

    #[tokio::test]
    async fn test_async_step_resumes_on_response() {
        let orchestrator = orchestrator(Arc::default());
        let correlation_id = CorrelationId::new();
        let invocation = StepInvocation::new(root(), Level::step("call", "external"))
            .with_parameters(json!({"correlation_id": correlation_id.to_string()}));
        let runtime_id = invocation.runtime_id();

        let outcome = orchestrator.invoke(invocation).await.unwrap();
        assert_eq!(
            outcome,
            InvocationOutcome::Suspended {
                runtime_id,
                state: InvocationState::AwaitingResponse
            }
        );

        let completion = orchestrator.completion(runtime_id).unwrap();
        assert!(orchestrator
            .on_response(correlation_id, ResponseData::success(json!("done")))
            .await
            .is_delivered());
        let response = completion.await.unwrap();
        assert_eq!(response.outputs["result"], json!("done"));

        assert!(orchestrator
            .on_response(correlation_id, ResponseData::success(json!("again")))
            .await
            .is_discarded());
    }

    #[tokio::test]
    async fn test_cancel_is_terminal_and_notifies_executable() {
        let external = Arc::new(External::default());
        let orchestrator = orchestrator(Arc::clone(&external));
        let correlation_id = CorrelationId::new();
        let invocation = StepInvocation::new(root(), Level::step("call", "external"))
            .with_parameters(json!({"correlation_id": correlation_id.to_string()}));
        let runtime_id = invocation.runtime_id();
        orchestrator.invoke(invocation).await.unwrap();

        assert!(orchestrator.cancel(runtime_id).await.unwrap());
        assert!(!orchestrator.cancel(runtime_id).await.unwrap());
        assert_eq!(external.aborted.load(Ordering::SeqCst), 1);

        let late = orchestrator
            .on_response(correlation_id, ResponseData::success(json!("late")))
            .await;
        assert!(late.is_discarded());

        let response = orchestrator.completion(runtime_id).unwrap().await.unwrap();
        assert_eq!(response.status, StepStatus::Errored);
        assert_eq!(response.failure_kind(), Some(FailureKind::Cancelled));
    }

    #[tokio::test]
    async fn test_children_run_in_process_and_roll_up() {
        let orchestrator = orchestrator(Arc::default());
        let response = orchestrator
            .run(
                StepInvocation::new(root(), Level::step("fan", "fan_out"))
                    .with_parameters(json!({"count": 3})),
            )
            .await
            .unwrap();

        assert!(response.is_success());
        assert_eq!(response.outputs.len(), 3);
        assert_eq!(orchestrator.active_invocations(), 0);
    }

    #[tokio::test]
    async fn test_zero_children_completes_immediately() {
        let orchestrator = orchestrator(Arc::default());
        let outcome = orchestrator
            .invoke(
                StepInvocation::new(root(), Level::step("fan", "fan_out"))
                    .with_parameters(json!({"count": 0})),
            )
            .await
            .unwrap();
        assert!(outcome.response().unwrap().is_success());
    }

    #[tokio::test]
    async fn test_reinvoking_known_runtime_id_does_not_rerun() {
        let orchestrator = orchestrator(Arc::default());
        let invocation = StepInvocation::new(root(), Level::step("say", "echo"));
        let first = orchestrator.invoke(invocation.clone()).await.unwrap();
        let second = orchestrator
            .invoke(invocation.with_parameters(json!({"fail": true})))
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_async_start_error_completes_without_suspending() {
        let orchestrator = orchestrator(Arc::default());
        let outcome = orchestrator
            .invoke(StepInvocation::new(root(), Level::step("call", "external")))
            .await
            .unwrap();

        let response = outcome.response().unwrap();
        assert_eq!(response.status, StepStatus::Errored);
        assert_eq!(response.failure_kind(), Some(FailureKind::Unexpected));
        assert_eq!(orchestrator.correlator().pending_count(), 0);
        assert_eq!(orchestrator.active_invocations(), 0);
    }

    #[tokio::test]
    async fn test_reserved_invocation_cancelled_before_it_runs() {
        let orchestrator = orchestrator(Arc::default());
        let level = Level::step("say", "echo");
        let runtime_id = level.runtime_id;
        assert!(orchestrator.reserve(runtime_id, level.step_type.clone()));
        assert_eq!(orchestrator.active_invocations(), 1);

        assert!(orchestrator.cancel(runtime_id).await.unwrap());
        let outcome = orchestrator
            .invoke(StepInvocation::new(root(), level))
            .await
            .unwrap();
        let response = outcome.response().unwrap();
        assert_eq!(response.failure_kind(), Some(FailureKind::Cancelled));
        assert!(response.outputs.is_empty());
        assert_eq!(orchestrator.active_invocations(), 0);
    }

    #[tokio::test]
    async fn test_failed_facilitation_forgets_reservation() {
        let orchestrator = orchestrator(Arc::default());
        let level = Level::step("x", "nope");
        let runtime_id = level.runtime_id;
        orchestrator.reserve(runtime_id, level.step_type.clone());

        assert!(orchestrator
            .invoke(StepInvocation::new(root(), level))
            .await
            .is_err());
        assert!(orchestrator.invocation(runtime_id).is_none());
        assert_eq!(orchestrator.active_invocations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_invocations_pruned_in_background() {
        let mut config = OrchestratorConfig::default();
        config.correlator.tombstone_retention_ms = 500;
        config.correlator.prune_interval_ms = 1_000;
        let external = Arc::new(External::default());
        let orchestrator = orchestrator_with(config, external);

        let correlation_id = CorrelationId::new();
        let invocation = StepInvocation::new(root(), Level::step("call", "external"))
            .with_parameters(json!({"correlation_id": correlation_id.to_string()}));
        let runtime_id = invocation.runtime_id();
        orchestrator.invoke(invocation).await.unwrap();
        orchestrator
            .on_response(correlation_id, ResponseData::success(json!("done")))
            .await;
        orchestrator.completion(runtime_id).unwrap().await.unwrap();
        assert!(orchestrator.correlator().resolution(&correlation_id).is_some());

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(orchestrator.invocation(runtime_id).is_none());
        assert!(orchestrator.correlator().resolution(&correlation_id).is_none());
    }
}
