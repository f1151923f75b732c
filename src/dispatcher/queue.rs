//! Task queue transport boundary.
//!
//! The real transport (message broker, RPC, ...) lives outside this crate.
//! [`InMemoryTaskQueue`] is a bounded channel implementation for tests and
//! single-process deployments.

use crate::ambiance::Ambiance;
use crate::error::DispatchError;
use crate::types::{CorrelationId, StepType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// A unit of remote work as it is handed to the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub correlation_id: CorrelationId,
    pub worker_id: String,
    pub ambiance: Ambiance,
    pub step_type: StepType,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    /// 1 for the first attempt
    pub attempt: u32,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Returns once the task is durably queued
    async fn enqueue(&self, task: QueuedTask) -> Result<(), DispatchError>;

    /// Best-effort request to drop outstanding work
    async fn abandon(&self, correlation_id: CorrelationId, worker_id: &str);

    fn name(&self) -> &str;
}

pub struct InMemoryTaskQueue {
    sender: mpsc::Sender<QueuedTask>,
    capacity: usize,
    abandoned: Arc<DashSet<CorrelationId>>,
}

impl InMemoryTaskQueue {
    pub const NAME: &'static str = "in_memory";

    /// Queue plus the receiving end a worker (or test) drains
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<QueuedTask>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                sender,
                capacity,
                abandoned: Arc::new(DashSet::new()),
            },
            receiver,
        )
    }

    pub fn is_abandoned(&self, correlation_id: &CorrelationId) -> bool {
        self.abandoned.contains(correlation_id)
    }

    /// Shared view of abandoned ids for consumers of the receiver
    pub fn abandoned_ids(&self) -> Arc<DashSet<CorrelationId>> {
        Arc::clone(&self.abandoned)
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: QueuedTask) -> Result<(), DispatchError> {
        let correlation_id = task.correlation_id;
        self.sender.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::queue_rejected(
                Self::NAME,
                format!("queue full (capacity {})", self.capacity),
            ),
            mpsc::error::TrySendError::Closed(_) => DispatchError::QueueClosed {
                queue: Self::NAME.to_string(),
            },
        })?;
        debug!(correlation_id = %correlation_id, "Task enqueued");
        Ok(())
    }

    async fn abandon(&self, correlation_id: CorrelationId, worker_id: &str) {
        debug!(correlation_id = %correlation_id, worker_id = worker_id, "Task abandoned");
        self.abandoned.insert(correlation_id);
    }

    fn name(&self) -> &str {
        Self::NAME
    }
}
