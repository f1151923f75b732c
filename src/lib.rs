#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Pipeline Step Core
//!
//! Step execution orchestration for pipeline plans: decides how each step
//! runs, threads an immutable execution context through nested invocations,
//! and correlates asynchronous completions back to the waiting step.
//!
//! ## Architecture
//!
//! - **Facilitation** picks one [`ExecutionMode`](types::ExecutionMode) per
//!   invocation from an explicit, startup-assembled registry.
//! - **Executables** implement one contract per mode (sync, async, child,
//!   children, task, task chain) behind the [`Executable`](executable::Executable)
//!   tagged union.
//! - **Task dispatch** hands remote work to a worker through a queue
//!   transport, selecting the worker from a heartbeat-tracked pool.
//! - **Response correlation** matches inbound completions to pending waits
//!   exactly once, merges children responses order-independently, and expires
//!   waits whose deadline passes.
//! - **The orchestrator** composes all of the above and guarantees one
//!   terminal [`StepResponse`](types::StepResponse) per invocation.
//!
//! ## Module Organization
//!
//! - [`ambiance`] - Immutable execution context
//! - [`types`] - Execution modes, responses, identifiers
//! - [`facilitator`] - Execution mode resolution
//! - [`executable`] - Per-mode step contracts and their registry
//! - [`dispatcher`] - Remote task dispatch and worker selection
//! - [`correlator`] - Pending waits, children aggregates, expiry
//! - [`orchestrator`] - Driving loop, child launching, cancellation
//! - [`state_machine`] - Per-invocation lifecycle
//! - [`store`] - Persistence boundary for suspended invocations
//! - [`events`] - Lifecycle event broadcasting
//! - [`resilience`] - Circuit breaker for the task transport
//! - [`config`] - Layered configuration
//! - [`logging`] - Structured logging setup
//! - [`error`] - Error taxonomy
//!
//! ## Quick Start
//!
//! ```rust
//! use async_trait::async_trait;
//! use pipeline_core::ambiance::{Ambiance, Level};
//! use pipeline_core::error::StepExecutionError;
//! use pipeline_core::executable::{Executable, ExecutableRegistry, SyncExecutable};
//! use pipeline_core::facilitator::{FacilitatorRegistry, FixedModeFacilitator};
//! use pipeline_core::orchestrator::{Orchestrator, StepInvocation};
//! use pipeline_core::types::{ExecutionMode, StepInputs, StepParameters, StepResponse};
//! use std::sync::Arc;
//!
//! struct Greet;
//!
//! #[async_trait]
//! impl SyncExecutable for Greet {
//!     async fn execute_sync(
//!         &self,
//!         _ambiance: &Ambiance,
//!         _parameters: &StepParameters,
//!         _inputs: &StepInputs,
//!     ) -> Result<StepResponse, StepExecutionError> {
//!         Ok(StepResponse::succeeded().with_output("greeting", "hello".into()))
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let orchestrator = Orchestrator::builder()
//!     .with_facilitators(
//!         FacilitatorRegistry::builder()
//!             .register_unconditional("greet", Arc::new(FixedModeFacilitator::new(ExecutionMode::Sync)))
//!             .build(),
//!     )
//!     .with_executables(ExecutableRegistry::new().register("greet", Executable::Sync(Arc::new(Greet))))
//!     .build()
//!     .unwrap();
//!
//! let plan = Ambiance::new(uuid::Uuid::new_v4(), "hello-plan");
//! let response = orchestrator
//!     .run(StepInvocation::new(plan, Level::step("say_hello", "greet")))
//!     .await
//!     .unwrap();
//! assert!(response.is_success());
//! # });
//! ```

pub mod ambiance;
pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod executable;
pub mod facilitator;
pub mod logging;
pub mod orchestrator;
pub mod resilience;
pub mod state_machine;
pub mod store;
pub mod types;

pub use ambiance::{Ambiance, Level};
pub use config::{ConfigManager, OrchestratorConfig};
pub use correlator::{CorrelationOutcome, ResponseCorrelator};
pub use dispatcher::{TaskDispatcher, TaskQueue, WorkerPool};
pub use error::{
    AggregationError, CorrelationError, DispatchError, FacilitationError, OrchestrationError,
    OrchestrationResult, StepExecutionError,
};
pub use events::{EventPublisher, OrchestrationEvent};
pub use executable::{Executable, ExecutableRegistry};
pub use facilitator::{Facilitator, FacilitatorRegistry};
pub use orchestrator::{InvocationOutcome, Orchestrator, OrchestratorBuilder, StepInvocation};
pub use store::{InMemoryWaitStore, WaitStore};
pub use types::{
    ChildId, CorrelationId, ExecutionMode, ResponseData, StepInputs, StepParameters,
    StepResponse, StepStatus, StepType,
};
