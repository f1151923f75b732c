//! Shared fixtures: a small step library covering every execution mode and a
//! fake remote worker draining the in-memory task queue.

#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashSet;
use parking_lot::Mutex;
use pipeline_core::ambiance::{Ambiance, Level};
use pipeline_core::config::OrchestratorConfig;
use pipeline_core::dispatcher::{InMemoryTaskQueue, QueuedTask, WorkerCapabilities, WorkerPool};
use pipeline_core::error::StepExecutionError;
use pipeline_core::executable::{
    ChildExecutable, ChildSpec, ChildrenExecutable, ChildrenSpawn, Executable,
    ExecutableRegistry, SyncExecutable, TaskChainExecutable, TaskExecutable, TaskRequest,
};
use pipeline_core::facilitator::{FacilitatorRegistry, FixedModeFacilitator};
use pipeline_core::orchestrator::{Orchestrator, StepInvocation};
use pipeline_core::store::InMemoryWaitStore;
use pipeline_core::types::{
    CorrelationId, ExecutionMode, ResponseData, StepInputs, StepParameters, StepResponse,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Ambiance seen by every `echo` execution, in execution order
pub type AmbianceLog = Arc<Mutex<Vec<Ambiance>>>;

/// SYNC: echoes its parameters, fails when `{"fail": true}`
pub struct Echo {
    pub log: AmbianceLog,
}

#[async_trait]
impl SyncExecutable for Echo {
    async fn execute_sync(
        &self,
        ambiance: &Ambiance,
        parameters: &StepParameters,
        _inputs: &StepInputs,
    ) -> Result<StepResponse, StepExecutionError> {
        self.log.lock().push(ambiance.clone());
        if parameters["fail"].as_bool().unwrap_or(false) {
            return Err(StepExecutionError::failed_with_code("echo refused", "E_ECHO"));
        }
        if parameters["panic"].as_bool().unwrap_or(false) {
            panic!("echo exploded");
        }
        Ok(StepResponse::succeeded().with_output("echo", parameters.clone()))
    }
}

/// TASK: the payload is the parameters; `timeout_ms` overrides the default
pub struct Build;

#[async_trait]
impl TaskExecutable for Build {
    async fn obtain_task(
        &self,
        _ambiance: &Ambiance,
        parameters: &StepParameters,
        _inputs: &StepInputs,
    ) -> Result<TaskRequest, StepExecutionError> {
        let request = TaskRequest::new(parameters.clone());
        Ok(match parameters["timeout_ms"].as_u64() {
            Some(ms) => request.with_timeout(Duration::from_millis(ms)),
            None => request,
        })
    }
}

/// TASK_CHAIN: one link per entry of `links`
pub struct Release;

#[async_trait]
impl TaskChainExecutable for Release {
    async fn obtain_task_chain(
        &self,
        _ambiance: &Ambiance,
        parameters: &StepParameters,
        _inputs: &StepInputs,
    ) -> Result<Vec<TaskRequest>, StepExecutionError> {
        Ok(parameters["links"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(TaskRequest::new)
            .collect())
    }
}

/// CHILDREN: one `echo` child per entry of `children`
pub struct FanOut;

#[async_trait]
impl ChildrenExecutable for FanOut {
    async fn obtain_children(
        &self,
        _ambiance: &Ambiance,
        parameters: &StepParameters,
        _inputs: &StepInputs,
    ) -> Result<ChildrenSpawn, StepExecutionError> {
        let children = parameters["children"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(i, params)| {
                let step_type = params["step_type"].as_str().unwrap_or("echo").to_string();
                ChildSpec::new(format!("child-{i}"), step_type).with_parameters(params)
            })
            .collect();
        let spawn = ChildrenSpawn::new(children);
        Ok(if parameters["fail_fast"].as_bool().unwrap_or(false) {
            spawn.fail_fast()
        } else {
            spawn
        })
    }
}

/// CHILD: wraps a single nested step described by `child`
pub struct Wrap;

#[async_trait]
impl ChildExecutable for Wrap {
    async fn obtain_child(
        &self,
        _ambiance: &Ambiance,
        parameters: &StepParameters,
        _inputs: &StepInputs,
    ) -> Result<ChildSpec, StepExecutionError> {
        let child = parameters["child"].clone();
        let step_type = child["step_type"].as_str().unwrap_or("echo").to_string();
        Ok(ChildSpec::new("wrapped", step_type).with_parameters(child))
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub log: AmbianceLog,
    pub store: Arc<InMemoryWaitStore>,
    pub abandoned: Arc<DashSet<CorrelationId>>,
    pub tasks: Option<mpsc::Receiver<QueuedTask>>,
}

pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.dispatch.base_delay_ms = 1;
    config.dispatch.max_delay_ms = 5;
    config.correlator.default_task_timeout_ms = 10_000;
    config
}

pub fn registries(log: &AmbianceLog) -> (FacilitatorRegistry, ExecutableRegistry) {
    let fixed = |mode| Arc::new(FixedModeFacilitator::new(mode));
    let facilitators = FacilitatorRegistry::builder()
        .register_unconditional("echo", fixed(ExecutionMode::Sync))
        .register_unconditional("build", fixed(ExecutionMode::Task))
        .register_unconditional("release", fixed(ExecutionMode::TaskChain))
        .register_unconditional("fan_out", fixed(ExecutionMode::Children))
        .register_unconditional("wrap", fixed(ExecutionMode::Child))
        .build();
    let executables = ExecutableRegistry::new()
        .register(
            "echo",
            Executable::Sync(Arc::new(Echo {
                log: Arc::clone(log),
            })),
        )
        .register("build", Executable::Task(Arc::new(Build)))
        .register("release", Executable::TaskChain(Arc::new(Release)))
        .register("fan_out", Executable::Children(Arc::new(FanOut)))
        .register("wrap", Executable::Child(Arc::new(Wrap)));
    (facilitators, executables)
}

/// Orchestrator with `workers` registered remote workers and the task queue
/// receiver left for the test to drain
pub async fn harness_with(
    config: OrchestratorConfig,
    workers: usize,
    store: Arc<InMemoryWaitStore>,
) -> Harness {
    let log = AmbianceLog::default();
    let (facilitators, executables) = registries(&log);
    let (queue, tasks) = InMemoryTaskQueue::new(config.dispatch.queue_capacity);
    let abandoned = queue.abandoned_ids();
    let pool = WorkerPool::new(config.worker_pool.clone(), config.dispatch.load_balancer);
    for i in 0..workers {
        pool.register_worker(WorkerCapabilities::new(format!("worker-{i}"), 8))
            .await
            .unwrap();
    }

    let orchestrator = Orchestrator::builder()
        .with_config(config)
        .with_facilitators(facilitators)
        .with_executables(executables)
        .with_task_queue(Arc::new(queue))
        .with_worker_pool(pool)
        .with_store(store.clone())
        .build()
        .unwrap();

    Harness {
        orchestrator,
        log,
        store,
        abandoned,
        tasks: Some(tasks),
    }
}

pub async fn harness(workers: usize) -> Harness {
    harness_with(test_config(), workers, Arc::new(InMemoryWaitStore::new())).await
}

/// How the fake worker answers a queued task; `None` never answers
pub type WorkerPolicy = fn(&QueuedTask) -> Option<ResponseData>;

pub fn succeed_with_payload(task: &QueuedTask) -> Option<ResponseData> {
    Some(ResponseData::success(task.payload.clone()))
}

/// Fails any task whose payload carries `"fail": true`
pub fn fail_flagged(task: &QueuedTask) -> Option<ResponseData> {
    if task.payload["fail"].as_bool().unwrap_or(false) {
        Some(ResponseData::failure("remote step failed"))
    } else {
        succeed_with_payload(task)
    }
}

pub fn never_respond(_: &QueuedTask) -> Option<ResponseData> {
    None
}

impl Harness {
    /// Start a fake remote worker; returns every task it received
    pub fn spawn_worker(&mut self, policy: WorkerPolicy) -> Arc<Mutex<Vec<QueuedTask>>> {
        let received = Arc::new(Mutex::new(Vec::new()));
        let Some(mut tasks) = self.tasks.take() else {
            panic!("worker already started");
        };
        let orchestrator = self.orchestrator.clone();
        let seen = Arc::clone(&received);
        tokio::spawn(async move {
            while let Some(task) = tasks.recv().await {
                seen.lock().push(task.clone());
                if let Some(response) = policy(&task) {
                    orchestrator.on_response(task.correlation_id, response).await;
                }
            }
        });
        received
    }
}

pub fn root() -> Ambiance {
    Ambiance::new(Uuid::new_v4(), "test-plan")
}

pub fn step(identifier: &str, step_type: &str, parameters: serde_json::Value) -> StepInvocation {
    StepInvocation::new(root(), Level::step(identifier, step_type)).with_parameters(parameters)
}

pub fn echo_children(n: usize) -> serde_json::Value {
    json!({ "children": (0..n).map(|i| json!({ "n": i })).collect::<Vec<_>>() })
}
