//! Runs a small plan through the orchestrator: a sync step, a task served by
//! an in-process fake worker, and a fan-out of children.

use anyhow::Context;
use async_trait::async_trait;
use pipeline_core::ambiance::{Ambiance, Level};
use pipeline_core::config::ConfigManager;
use pipeline_core::dispatcher::{InMemoryTaskQueue, WorkerCapabilities, WorkerPool};
use pipeline_core::error::StepExecutionError;
use pipeline_core::executable::{
    ChildSpec, ChildrenExecutable, ChildrenSpawn, Executable, ExecutableRegistry, SyncExecutable,
    TaskExecutable, TaskRequest,
};
use pipeline_core::facilitator::{FacilitatorRegistry, FixedModeFacilitator};
use pipeline_core::logging::init_structured_logging_with;
use pipeline_core::orchestrator::{Orchestrator, StepInvocation};
use pipeline_core::types::{
    ExecutionMode, ResponseData, StepInputs, StepParameters, StepResponse,
};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

struct Checksum;

#[async_trait]
impl SyncExecutable for Checksum {
    async fn execute_sync(
        &self,
        _ambiance: &Ambiance,
        parameters: &StepParameters,
        _inputs: &StepInputs,
    ) -> Result<StepResponse, StepExecutionError> {
        let text = parameters["text"]
            .as_str()
            .ok_or_else(|| StepExecutionError::failed("parameter `text` is required"))?;
        let sum: u64 = text.bytes().map(u64::from).sum();
        Ok(StepResponse::succeeded().with_output("checksum", json!(sum)))
    }
}

struct RemoteBuild;

#[async_trait]
impl TaskExecutable for RemoteBuild {
    async fn obtain_task(
        &self,
        _ambiance: &Ambiance,
        parameters: &StepParameters,
        _inputs: &StepInputs,
    ) -> Result<TaskRequest, StepExecutionError> {
        Ok(TaskRequest::new(json!({ "target": parameters["target"] })))
    }
}

struct Regions;

#[async_trait]
impl ChildrenExecutable for Regions {
    async fn obtain_children(
        &self,
        _ambiance: &Ambiance,
        parameters: &StepParameters,
        _inputs: &StepInputs,
    ) -> Result<ChildrenSpawn, StepExecutionError> {
        let regions = parameters["regions"].as_array().cloned().unwrap_or_default();
        Ok(ChildrenSpawn::new(
            regions
                .iter()
                .filter_map(|region| region.as_str())
                .map(|region| {
                    ChildSpec::new(format!("checksum-{region}"), "checksum")
                        .with_parameters(json!({ "text": region }))
                })
                .collect(),
        ))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let manager = ConfigManager::load().context("loading configuration")?;
    init_structured_logging_with(&manager.config().logging);
    info!(environment = manager.environment(), "Starting pipeline demo");

    let config = manager.config().clone();
    let (queue, mut tasks) = InMemoryTaskQueue::new(config.dispatch.queue_capacity);
    let pool = WorkerPool::new(config.worker_pool.clone(), config.dispatch.load_balancer);
    pool.register_worker(WorkerCapabilities::new("demo-worker", 4))
        .await
        .context("registering demo worker")?;

    let sync = Arc::new(FixedModeFacilitator::new(ExecutionMode::Sync));
    let facilitators = FacilitatorRegistry::builder()
        .register_unconditional("checksum", sync)
        .register_unconditional("build", Arc::new(FixedModeFacilitator::new(ExecutionMode::Task)))
        .register_unconditional(
            "regions",
            Arc::new(FixedModeFacilitator::new(ExecutionMode::Children)),
        )
        .build();
    let executables = ExecutableRegistry::new()
        .register("checksum", Executable::Sync(Arc::new(Checksum)))
        .register("build", Executable::Task(Arc::new(RemoteBuild)))
        .register("regions", Executable::Children(Arc::new(Regions)));

    let orchestrator = Orchestrator::builder()
        .with_config(config)
        .with_facilitators(facilitators)
        .with_executables(executables)
        .with_task_queue(Arc::new(queue))
        .with_worker_pool(pool)
        .build()?;

    // Fake remote worker: answers every queued task
    let worker = orchestrator.clone();
    tokio::spawn(async move {
        while let Some(task) = tasks.recv().await {
            let result = json!({ "artifact": format!("{}.tar.gz", task.payload["target"].as_str().unwrap_or("unknown")) });
            worker
                .on_response(task.correlation_id, ResponseData::success(result))
                .await;
        }
    });

    let plan = Ambiance::new(uuid::Uuid::new_v4(), "demo-plan");
    let steps = [
        StepInvocation::new(plan.clone(), Level::step("checksum", "checksum"))
            .with_parameters(json!({ "text": "pipeline" })),
        StepInvocation::new(plan.clone(), Level::step("build", "build"))
            .with_parameters(json!({ "target": "service" })),
        StepInvocation::new(plan.clone(), Level::step("regions", "regions"))
            .with_parameters(json!({ "regions": ["us-east", "eu-west"] })),
    ];

    for step in steps {
        let identifier = step.level.identifier.clone();
        let response = orchestrator.run(step).await?;
        println!(
            "{identifier}: {} {}",
            response.status,
            serde_json::to_string(&response.outputs)?
        );
    }

    Ok(())
}
