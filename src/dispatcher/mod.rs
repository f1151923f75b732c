//! # Task Dispatcher
//!
//! Hands remote work to a worker through the [`TaskQueue`] transport and
//! issues the correlation id its completion will be reported under.
//!
//! Dispatch is fire-and-forget: it returns once the task is queued. Retryable
//! failures (no eligible worker, queue full, transport errors, open circuit)
//! are retried with capped exponential backoff under the same correlation id.

pub mod queue;
pub mod worker_pool;

pub use queue::{InMemoryTaskQueue, QueuedTask, TaskQueue};
pub use worker_pool::{
    LoadBalancer, TargetSelectionCriteria, WorkerCapabilities, WorkerPool, WorkerPoolError,
    WorkerPoolStats, WorkerState,
};

use crate::ambiance::Ambiance;
use crate::config::{CircuitBreakerConfig, DispatchConfig};
use crate::error::DispatchError;
use crate::executable::TaskRequest;
use crate::resilience::{CircuitBreaker, CircuitBreakerError};
use crate::types::{CorrelationId, CorrelationIdGenerator, StepType};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything needed to queue one task
#[derive(Debug, Clone)]
pub struct TaskDispatch {
    pub ambiance: Ambiance,
    pub step_type: StepType,
    pub request: TaskRequest,
}

pub struct TaskDispatcher {
    pool: WorkerPool,
    queue: Arc<dyn TaskQueue>,
    breaker: CircuitBreaker,
    config: DispatchConfig,
    generator: CorrelationIdGenerator,
    /// Correlation id → worker currently holding the task
    assignments: DashMap<CorrelationId, String>,
}

impl TaskDispatcher {
    pub fn new(
        pool: WorkerPool,
        queue: Arc<dyn TaskQueue>,
        config: DispatchConfig,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        let breaker = CircuitBreaker::new(format!("task_queue:{}", queue.name()), breaker_config);
        Self {
            pool,
            queue,
            breaker,
            config,
            generator: CorrelationIdGenerator::new(),
            assignments: DashMap::new(),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Process-unique correlation id
    pub fn issue_correlation_id(&self) -> CorrelationId {
        self.generator.next_id()
    }

    /// Issue an id and queue the task under it
    pub async fn dispatch(&self, dispatch: TaskDispatch) -> Result<CorrelationId, DispatchError> {
        let correlation_id = self.issue_correlation_id();
        self.dispatch_with_id(correlation_id, &dispatch).await?;
        Ok(correlation_id)
    }

    /// Queue a task under an id issued earlier, so the caller can register
    /// its wait before any response can possibly arrive
    pub async fn dispatch_with_id(
        &self,
        correlation_id: CorrelationId,
        dispatch: &TaskDispatch,
    ) -> Result<(), DispatchError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.try_dispatch(correlation_id, dispatch, attempt).await {
                Ok(worker_id) => {
                    info!(
                        correlation_id = %correlation_id,
                        step_type = %dispatch.step_type,
                        worker_id = %worker_id,
                        attempt = attempt,
                        "Task dispatched"
                    );
                    return Ok(());
                }
                Err(err) if err.is_retryable() => {
                    warn!(
                        correlation_id = %correlation_id,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error = %err,
                        "Dispatch attempt failed"
                    );
                    last_error = Some(err);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.backoff_delay(attempt)).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Err(DispatchError::Exhausted {
            attempts: max_attempts,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    async fn try_dispatch(
        &self,
        correlation_id: CorrelationId,
        dispatch: &TaskDispatch,
        attempt: u32,
    ) -> Result<String, DispatchError> {
        let criteria = &dispatch.request.criteria;
        let worker_id = self.pool.select_worker(criteria).await.ok_or_else(|| {
            DispatchError::NoEligibleWorker {
                namespace: criteria.namespace.clone(),
                capabilities: criteria.required_capabilities.clone(),
            }
        })?;

        // Selection and load accounting are separate lock scopes; a worker
        // unregistered in between is treated as ineligible
        if self.pool.increment_load(&worker_id).await.is_err() {
            return Err(DispatchError::NoEligibleWorker {
                namespace: criteria.namespace.clone(),
                capabilities: criteria.required_capabilities.clone(),
            });
        }

        let task = QueuedTask {
            correlation_id,
            worker_id: worker_id.clone(),
            ambiance: dispatch.ambiance.clone(),
            step_type: dispatch.step_type.clone(),
            payload: dispatch.request.payload.clone(),
            enqueued_at: Utc::now(),
            attempt,
        };

        // Recorded before enqueueing: a fast worker may answer, and the
        // release must find the assignment
        self.assignments.insert(correlation_id, worker_id.clone());
        let queue = Arc::clone(&self.queue);
        let result = self
            .breaker
            .call(|| async move { queue.enqueue(task).await })
            .await;

        match result {
            Ok(()) => Ok(worker_id),
            Err(err) => {
                self.assignments.remove(&correlation_id);
                if let Err(err) = self.pool.decrement_load(&worker_id).await {
                    debug!(correlation_id = %correlation_id, error = %err, "Load release skipped");
                }
                Err(match err {
                    CircuitBreakerError::CircuitOpen { component } => {
                        DispatchError::CircuitOpen { component }
                    }
                    CircuitBreakerError::OperationFailed(err) => err,
                })
            }
        }
    }

    /// The correlation resolved; free the worker slot
    pub async fn release(&self, correlation_id: CorrelationId) {
        if let Some((_, worker_id)) = self.assignments.remove(&correlation_id) {
            if let Err(err) = self.pool.decrement_load(&worker_id).await {
                debug!(correlation_id = %correlation_id, error = %err, "Load release skipped");
            }
        }
    }

    /// Best-effort: tell the transport to drop the task, then free the slot
    pub async fn abandon(&self, correlation_id: CorrelationId) {
        let Some((_, worker_id)) = self.assignments.remove(&correlation_id) else {
            return;
        };
        self.queue.abandon(correlation_id, &worker_id).await;
        if let Err(err) = self.pool.decrement_load(&worker_id).await {
            debug!(correlation_id = %correlation_id, error = %err, "Load release skipped");
        }
        info!(correlation_id = %correlation_id, worker_id = %worker_id, "Task abandoned");
    }

    /// Worker currently assigned to a correlation id
    pub fn assigned_worker(&self, correlation_id: &CorrelationId) -> Option<String> {
        self.assignments.get(correlation_id).map(|w| w.value().clone())
    }

    pub fn in_flight(&self) -> usize {
        self.assignments.len()
    }
}

impl std::fmt::Debug for TaskDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDispatcher")
            .field("queue", &self.queue.name())
            .field("in_flight", &self.assignments.len())
            .finish()
    }
}
