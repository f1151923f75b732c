//! # Wait Store
//!
//! Persistence boundary for suspended invocations. The correlator writes
//! pending waits and children aggregates through a [`WaitStore`] so that an
//! external store can restore them after a process restart.
//!
//! [`InMemoryWaitStore`] keeps records as JSON values, which also verifies
//! that every record survives serialization.

use crate::correlator::{ChildrenAggregate, PendingWait};
use crate::types::CorrelationId;
use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Failed to serialize {record} record: {message}")]
    Serialization { record: String, message: String },

    #[error("Wait store backend error: {message}")]
    Backend { message: String },
}

impl StoreError {
    pub fn serialization(record: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Serialization {
            record: record.into(),
            message: error.to_string(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait WaitStore: Send + Sync {
    async fn save_wait(&self, wait: &PendingWait) -> Result<(), StoreError>;

    async fn remove_wait(&self, correlation_id: CorrelationId) -> Result<(), StoreError>;

    async fn save_aggregate(&self, aggregate: &ChildrenAggregate) -> Result<(), StoreError>;

    async fn remove_aggregate(&self, aggregate_id: CorrelationId) -> Result<(), StoreError>;

    async fn load_waits(&self) -> Result<Vec<PendingWait>, StoreError>;

    async fn load_aggregates(&self) -> Result<Vec<ChildrenAggregate>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryWaitStore {
    waits: DashMap<CorrelationId, serde_json::Value>,
    aggregates: DashMap<CorrelationId, serde_json::Value>,
}

impl InMemoryWaitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait_count(&self) -> usize {
        self.waits.len()
    }

    pub fn aggregate_count(&self) -> usize {
        self.aggregates.len()
    }

    pub fn contains_wait(&self, correlation_id: &CorrelationId) -> bool {
        self.waits.contains_key(correlation_id)
    }
}

#[async_trait]
impl WaitStore for InMemoryWaitStore {
    async fn save_wait(&self, wait: &PendingWait) -> Result<(), StoreError> {
        let value =
            serde_json::to_value(wait).map_err(|e| StoreError::serialization("pending_wait", e))?;
        self.waits.insert(wait.correlation_id, value);
        Ok(())
    }

    async fn remove_wait(&self, correlation_id: CorrelationId) -> Result<(), StoreError> {
        self.waits.remove(&correlation_id);
        Ok(())
    }

    async fn save_aggregate(&self, aggregate: &ChildrenAggregate) -> Result<(), StoreError> {
        let value = serde_json::to_value(aggregate)
            .map_err(|e| StoreError::serialization("children_aggregate", e))?;
        self.aggregates.insert(aggregate.aggregate_id, value);
        Ok(())
    }

    async fn remove_aggregate(&self, aggregate_id: CorrelationId) -> Result<(), StoreError> {
        self.aggregates.remove(&aggregate_id);
        Ok(())
    }

    async fn load_waits(&self) -> Result<Vec<PendingWait>, StoreError> {
        self.waits
            .iter()
            .map(|entry| {
                serde_json::from_value(entry.value().clone())
                    .map_err(|e| StoreError::serialization("pending_wait", e))
            })
            .collect()
    }

    async fn load_aggregates(&self) -> Result<Vec<ChildrenAggregate>, StoreError> {
        self.aggregates
            .iter()
            .map(|entry| {
                serde_json::from_value(entry.value().clone())
                    .map_err(|e| StoreError::serialization("children_aggregate", e))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::{Ambiance, Level};
    use crate::correlator::WaitKind;
    use crate::types::{ChildId, ExecutionMode, StepInputs, StepResponse};
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_waits_roundtrip_through_store() {
        let store = InMemoryWaitStore::new();
        let level = Level::step("deploy", "k8s");
        let wait = PendingWait::new(
            CorrelationId::new(),
            level.runtime_id,
            Ambiance::new(Uuid::new_v4(), "plan").with_level(level),
            "k8s".into(),
            ExecutionMode::Task,
            serde_json::json!({"replicas": 3}),
            StepInputs::new(),
            WaitKind::Response,
        )
        .with_timeout(Some(Duration::from_secs(60)));

        store.save_wait(&wait).await.unwrap();
        assert_eq!(store.load_waits().await.unwrap(), vec![wait.clone()]);

        store.remove_wait(wait.correlation_id).await.unwrap();
        assert!(store.load_waits().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_aggregates_roundtrip_through_store() {
        let store = InMemoryWaitStore::new();
        let child = ChildId::new();
        let mut aggregate = ChildrenAggregate::new(
            CorrelationId::new(),
            Uuid::new_v4(),
            [(child, "lint".to_string()), (ChildId::new(), "test".to_string())],
            false,
        );
        aggregate.record(child, StepResponse::succeeded()).unwrap();

        store.save_aggregate(&aggregate).await.unwrap();
        let loaded = store.load_aggregates().await.unwrap();
        assert_eq!(loaded, vec![aggregate.clone()]);
        assert_eq!(loaded[0].received_count(), 1);

        store.remove_aggregate(aggregate.aggregate_id).await.unwrap();
        assert_eq!(store.aggregate_count(), 0);
    }
}
