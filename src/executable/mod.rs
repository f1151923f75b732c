//! # Executables
//!
//! Step-invocation contracts, one per execution mode. A step type registers
//! one implementation per mode it supports, wrapped in the [`Executable`]
//! tagged union so the orchestrator can dispatch exhaustively on the mode
//! the facilitator chose.
//!
//! ## Usage
//!
//! ```rust
//! use async_trait::async_trait;
//! use pipeline_core::ambiance::Ambiance;
//! use pipeline_core::error::StepExecutionError;
//! use pipeline_core::executable::{Executable, ExecutableRegistry, SyncExecutable};
//! use pipeline_core::types::{StepInputs, StepParameters, StepResponse};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl SyncExecutable for Echo {
//!     async fn execute_sync(
//!         &self,
//!         _ambiance: &Ambiance,
//!         parameters: &StepParameters,
//!         _inputs: &StepInputs,
//!     ) -> Result<StepResponse, StepExecutionError> {
//!         Ok(StepResponse::succeeded().with_output("echo", parameters.clone()))
//!     }
//! }
//!
//! let registry = ExecutableRegistry::new().register("echo", Executable::Sync(Arc::new(Echo)));
//! assert!(registry.supports(&"echo".into(), pipeline_core::types::ExecutionMode::Sync));
//! ```

pub mod registry;

pub use registry::ExecutableRegistry;

use crate::ambiance::Ambiance;
use crate::dispatcher::TargetSelectionCriteria;
use crate::error::StepExecutionError;
use crate::types::{
    ChildId, CorrelationId, ExecutionMode, FailureInfo, FailureKind, ResponseData, StepInputs,
    StepParameters, StepResponse, StepStatus, StepType,
};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

/// Runs to completion on the invoking task
#[async_trait]
pub trait SyncExecutable: Send + Sync {
    async fn execute_sync(
        &self,
        ambiance: &Ambiance,
        parameters: &StepParameters,
        inputs: &StepInputs,
    ) -> Result<StepResponse, StepExecutionError>;
}

/// Status reported when asynchronous work has been started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AsyncInitialStatus {
    Queued,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncExecutableResponse {
    /// Id the external system will report completion under
    pub correlation_id: CorrelationId,
    pub status: AsyncInitialStatus,
    /// Overrides `correlator.default_async_timeout_ms` when set
    pub timeout: Option<Duration>,
}

impl AsyncExecutableResponse {
    pub fn running(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            status: AsyncInitialStatus::Running,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Starts work whose completion is reported later through the correlator
#[async_trait]
pub trait AsyncExecutable: Send + Sync {
    async fn execute_async(
        &self,
        ambiance: &Ambiance,
        parameters: &StepParameters,
        inputs: &StepInputs,
    ) -> Result<AsyncExecutableResponse, StepExecutionError>;

    async fn handle_async_response(
        &self,
        ambiance: &Ambiance,
        parameters: &StepParameters,
        responses: &HashMap<CorrelationId, ResponseData>,
    ) -> Result<StepResponse, StepExecutionError>;

    /// Best-effort notification that the invocation was cancelled
    async fn handle_abort(
        &self,
        _ambiance: &Ambiance,
        _parameters: &StepParameters,
        _correlation_id: CorrelationId,
    ) {
    }
}

/// One nested execution to spawn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSpec {
    /// Plan node identifier of the child
    pub identifier: String,
    pub step_type: StepType,
    #[serde(default)]
    pub parameters: StepParameters,
    #[serde(default)]
    pub inputs: StepInputs,
}

impl ChildSpec {
    pub fn new(identifier: impl Into<String>, step_type: impl Into<StepType>) -> Self {
        Self {
            identifier: identifier.into(),
            step_type: step_type.into(),
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
}

/// Terminal response of one child, keyed by [`ChildId`] in aggregates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildResponse {
    pub identifier: String,
    pub response: StepResponse,
}

/// Spawns exactly one nested execution
#[async_trait]
pub trait ChildExecutable: Send + Sync {
    async fn obtain_child(
        &self,
        ambiance: &Ambiance,
        parameters: &StepParameters,
        inputs: &StepInputs,
    ) -> Result<ChildSpec, StepExecutionError>;

    /// Maps the child's response; passes it through unchanged by default
    async fn handle_child_response(
        &self,
        _ambiance: &Ambiance,
        _parameters: &StepParameters,
        _child_id: ChildId,
        response: ChildResponse,
    ) -> Result<StepResponse, StepExecutionError> {
        Ok(response.response)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChildrenSpawn {
    pub children: Vec<ChildSpec>,
    /// Cancel outstanding siblings as soon as one child fails
    pub cancel_siblings_on_failure: bool,
}

impl ChildrenSpawn {
    pub fn new(children: Vec<ChildSpec>) -> Self {
        Self {
            children,
            cancel_siblings_on_failure: false,
        }
    }

    pub fn fail_fast(mut self) -> Self {
        self.cancel_siblings_on_failure = true;
        self
    }
}

/// Fans out N nested executions and aggregates their responses
#[async_trait]
pub trait ChildrenExecutable: Send + Sync {
    async fn obtain_children(
        &self,
        ambiance: &Ambiance,
        parameters: &StepParameters,
        inputs: &StepInputs,
    ) -> Result<ChildrenSpawn, StepExecutionError>;

    /// Invoked once, after every expected child has reported
    async fn handle_children_response(
        &self,
        _ambiance: &Ambiance,
        _parameters: &StepParameters,
        responses: &HashMap<ChildId, ChildResponse>,
    ) -> Result<StepResponse, StepExecutionError> {
        Ok(rollup_children(responses))
    }
}

/// Default children rollup: FAILED when any child is FAILED or ERRORED,
/// otherwise SUCCEEDED. Each child's outputs land under its identifier.
pub fn rollup_children(responses: &HashMap<ChildId, ChildResponse>) -> StepResponse {
    let mut failed: Vec<&str> = responses
        .values()
        .filter(|child| child.response.status.is_failure())
        .map(|child| child.identifier.as_str())
        .collect();
    failed.sort_unstable();

    let outputs = responses
        .values()
        .map(|child| {
            (
                child.identifier.clone(),
                serde_json::to_value(&child.response.outputs).unwrap_or_default(),
            )
        })
        .collect();

    if failed.is_empty() {
        StepResponse::succeeded_with(outputs)
    } else {
        StepResponse {
            status: StepStatus::Failed,
            outputs,
            failure: Some(FailureInfo::new(
                FailureKind::ChildFailure,
                format!("{} of {} children failed: {}", failed.len(), responses.len(), failed.join(", ")),
            )),
        }
    }
}

/// Work description handed to the task dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Opaque payload delivered to the remote worker
    pub payload: serde_json::Value,
    #[serde(default)]
    pub criteria: TargetSelectionCriteria,
    /// Overrides `correlator.default_task_timeout_ms` when set
    pub timeout_ms: Option<u64>,
}

impl TaskRequest {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            criteria: TargetSelectionCriteria::default(),
            timeout_ms: None,
        }
    }

    pub fn with_criteria(mut self, criteria: TargetSelectionCriteria) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Remote work dispatched through the task dispatcher
#[async_trait]
pub trait TaskExecutable: Send + Sync {
    async fn obtain_task(
        &self,
        ambiance: &Ambiance,
        parameters: &StepParameters,
        inputs: &StepInputs,
    ) -> Result<TaskRequest, StepExecutionError>;

    async fn handle_task_response(
        &self,
        _ambiance: &Ambiance,
        _parameters: &StepParameters,
        responses: &HashMap<CorrelationId, ResponseData>,
    ) -> Result<StepResponse, StepExecutionError> {
        match responses.values().next() {
            Some(data) if responses.len() == 1 => Ok(data.clone().into_step_response()),
            _ => Err(StepExecutionError::unexpected(format!(
                "expected exactly one task response, got {}",
                responses.len()
            ))),
        }
    }
}

/// Sequence of remote tasks, each dispatched after the previous one succeeded
#[async_trait]
pub trait TaskChainExecutable: Send + Sync {
    async fn obtain_task_chain(
        &self,
        ambiance: &Ambiance,
        parameters: &StepParameters,
        inputs: &StepInputs,
    ) -> Result<Vec<TaskRequest>, StepExecutionError>;

    /// `responses` holds the links that ran, in dispatch order. The last one
    /// is a failure when the chain stopped early.
    async fn handle_task_chain_response(
        &self,
        _ambiance: &Ambiance,
        _parameters: &StepParameters,
        responses: &[(CorrelationId, ResponseData)],
    ) -> Result<StepResponse, StepExecutionError> {
        match responses.last() {
            None => Ok(StepResponse::succeeded()),
            Some((_, last)) if !last.is_success() => Ok(last.clone().into_step_response()),
            Some(_) => {
                let results = responses
                    .iter()
                    .map(|(_, data)| data.data.clone())
                    .collect::<Vec<_>>();
                Ok(StepResponse::succeeded().with_output("results", serde_json::Value::Array(results)))
            }
        }
    }
}

/// Executable for one step type in one execution mode
#[derive(Clone)]
pub enum Executable {
    Sync(Arc<dyn SyncExecutable>),
    Async(Arc<dyn AsyncExecutable>),
    Child(Arc<dyn ChildExecutable>),
    Children(Arc<dyn ChildrenExecutable>),
    Task(Arc<dyn TaskExecutable>),
    TaskChain(Arc<dyn TaskChainExecutable>),
}

impl Executable {
    pub fn mode(&self) -> ExecutionMode {
        match self {
            Self::Sync(_) => ExecutionMode::Sync,
            Self::Async(_) => ExecutionMode::Async,
            Self::Child(_) => ExecutionMode::Child,
            Self::Children(_) => ExecutionMode::Children,
            Self::Task(_) => ExecutionMode::Task,
            Self::TaskChain(_) => ExecutionMode::TaskChain,
        }
    }
}

impl std::fmt::Debug for Executable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Executable::{}", self.mode())
    }
}

impl From<StepExecutionError> for StepResponse {
    fn from(error: StepExecutionError) -> Self {
        match error {
            StepExecutionError::Failed {
                message,
                error_code,
            } => {
                let mut failure = FailureInfo::new(FailureKind::Application, message);
                failure.error_code = error_code;
                StepResponse {
                    status: StepStatus::Failed,
                    outputs: HashMap::new(),
                    failure: Some(failure),
                }
            }
            StepExecutionError::Unexpected { message } => {
                StepResponse::errored(FailureKind::Unexpected, message)
            }
        }
    }
}

/// Polls an executable future, turning a panic into
/// [`StepExecutionError::Unexpected`].
pub(crate) async fn guarded<T, F>(future: F) -> Result<T, StepExecutionError>
where
    F: Future<Output = Result<T, StepExecutionError>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(StepExecutionError::unexpected(format!(
            "executable panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn child(identifier: &str, response: StepResponse) -> (ChildId, ChildResponse) {
        (
            ChildId::new(),
            ChildResponse {
                identifier: identifier.to_string(),
                response,
            },
        )
    }

    #[test]
    fn test_rollup_succeeds_when_all_children_succeed() {
        let responses: HashMap<_, _> = [
            child("a", StepResponse::succeeded().with_output("n", json!(1))),
            child("b", StepResponse::succeeded()),
        ]
        .into_iter()
        .collect();

        let rolled = rollup_children(&responses);
        assert!(rolled.is_success());
        assert_eq!(rolled.outputs["a"], json!({"n": 1}));
        assert_eq!(rolled.outputs["b"], json!({}));
    }

    #[test]
    fn test_rollup_fails_when_any_child_errored() {
        let responses: HashMap<_, _> = [
            child("a", StepResponse::succeeded()),
            child("b", StepResponse::errored(FailureKind::Timeout, "late")),
            child("c", StepResponse::failed(FailureKind::Application, "bad")),
        ]
        .into_iter()
        .collect();

        let rolled = rollup_children(&responses);
        assert_eq!(rolled.status, StepStatus::Failed);
        let failure = rolled.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::ChildFailure);
        assert_eq!(failure.message, "2 of 3 children failed: b, c");
    }

    #[test]
    fn test_step_execution_error_conversion() {
        let failed: StepResponse = StepExecutionError::failed_with_code("denied", "E403").into();
        assert_eq!(failed.status, StepStatus::Failed);
        assert_eq!(failed.failure.unwrap().error_code.as_deref(), Some("E403"));

        let errored: StepResponse = StepExecutionError::unexpected("boom").into();
        assert_eq!(errored.status, StepStatus::Errored);
        assert_eq!(errored.failure_kind(), Some(FailureKind::Unexpected));
    }

    #[tokio::test]
    async fn test_guarded_catches_panics() {
        let result = guarded(async {
            let parsed: Option<u32> = None;
            if parsed.is_none() {
                panic!("kaboom");
            }
            Ok::<_, StepExecutionError>(())
        })
        .await;
        match result {
            Err(StepExecutionError::Unexpected { message }) => assert!(message.contains("kaboom")),
            other => panic!("unexpected result: {other:?}"),
        }

        let ok = guarded(async { Ok::<_, StepExecutionError>(7) }).await;
        assert_eq!(ok, Ok(7));
    }

    #[test]
    fn test_task_request_timeout_roundtrip() {
        let request = TaskRequest::new(json!({"cmd": "ls"})).with_timeout(Duration::from_secs(5));
        assert_eq!(request.timeout_ms, Some(5000));
        assert_eq!(request.timeout(), Some(Duration::from_secs(5)));
    }
}
