//! Worker pool for target selection
//!
//! Tracks connected remote workers, their capabilities, current load, and
//! heartbeat health, and picks the worker a task is routed to.

use crate::config::WorkerPoolConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What a remote worker announces when it connects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    pub worker_id: String,
    /// Namespaces the worker serves; empty means any namespace
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// Free-form capability tags, e.g. `docker`, `gpu`
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub max_concurrent_tasks: usize,
}

impl WorkerCapabilities {
    pub fn new(worker_id: impl Into<String>, max_concurrent_tasks: usize) -> Self {
        Self {
            worker_id: worker_id.into(),
            namespaces: Vec::new(),
            capabilities: Vec::new(),
            max_concurrent_tasks,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespaces.push(namespace.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }
}

/// Constraints a task places on the worker it is routed to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSelectionCriteria {
    pub namespace: Option<String>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Used when eligible, otherwise the load balancer decides
    pub preferred_worker: Option<String>,
}

impl TargetSelectionCriteria {
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }

    pub fn with_preferred_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.preferred_worker = Some(worker_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancer {
    /// Lowest current load
    LeastLoad,
    /// Most free slots
    CapacityBased,
    /// First eligible worker by id
    FirstAvailable,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum WorkerPoolError {
    #[error("Worker not found: {worker_id}")]
    WorkerNotFound { worker_id: String },

    #[error("Invalid worker capabilities: {reason}")]
    InvalidCapabilities { reason: String },

    #[error("Worker pool is full ({max_workers} workers)")]
    PoolFull { max_workers: usize },
}

#[derive(Debug, Clone)]
pub struct WorkerState {
    pub capabilities: WorkerCapabilities,
    pub current_load: usize,
    pub last_heartbeat: Instant,
    pub registered_at: DateTime<Utc>,
    pub total_dispatched: u64,
}

impl WorkerState {
    pub fn is_healthy(&self, config: &WorkerPoolConfig) -> bool {
        self.last_heartbeat.elapsed() <= config.heartbeat_timeout()
    }

    pub fn available_capacity(&self) -> usize {
        self.capabilities
            .max_concurrent_tasks
            .saturating_sub(self.current_load)
    }

    fn matches(&self, criteria: &TargetSelectionCriteria) -> bool {
        let namespace_ok = match &criteria.namespace {
            Some(ns) => {
                self.capabilities.namespaces.is_empty() || self.capabilities.namespaces.contains(ns)
            }
            None => true,
        };
        let capabilities_ok = criteria
            .required_capabilities
            .iter()
            .all(|required| self.capabilities.capabilities.contains(required));

        namespace_ok && capabilities_ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolStats {
    pub total_workers: usize,
    pub healthy_workers: usize,
    pub total_capacity: usize,
    pub current_load: usize,
    pub available_capacity: usize,
    pub total_dispatched: u64,
    pub namespace_distribution: HashMap<String, usize>,
}

#[derive(Clone)]
pub struct WorkerPool {
    workers: Arc<RwLock<HashMap<String, WorkerState>>>,
    config: WorkerPoolConfig,
    load_balancer: LoadBalancer,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, load_balancer: LoadBalancer) -> Self {
        Self {
            workers: Arc::new(RwLock::new(HashMap::new())),
            config,
            load_balancer,
        }
    }

    pub fn load_balancer(&self) -> LoadBalancer {
        self.load_balancer
    }

    /// Register (or re-register) a worker; counts as a heartbeat
    pub async fn register_worker(
        &self,
        capabilities: WorkerCapabilities,
    ) -> Result<(), WorkerPoolError> {
        if capabilities.worker_id.is_empty() {
            return Err(WorkerPoolError::InvalidCapabilities {
                reason: "Worker ID cannot be empty".to_string(),
            });
        }
        if capabilities.max_concurrent_tasks == 0 {
            return Err(WorkerPoolError::InvalidCapabilities {
                reason: "Max concurrent tasks must be greater than 0".to_string(),
            });
        }

        let mut workers = self.workers.write().await;
        let worker_id = capabilities.worker_id.clone();

        if let Some(existing) = workers.get_mut(&worker_id) {
            warn!(worker_id = %worker_id, "Worker already registered, updating capabilities");
            existing.capabilities = capabilities;
            existing.last_heartbeat = Instant::now();
            return Ok(());
        }

        if workers.len() >= self.config.max_workers {
            return Err(WorkerPoolError::PoolFull {
                max_workers: self.config.max_workers,
            });
        }

        info!(
            worker_id = %worker_id,
            max_concurrent_tasks = capabilities.max_concurrent_tasks,
            namespaces = ?capabilities.namespaces,
            "Worker registered"
        );
        workers.insert(
            worker_id,
            WorkerState {
                capabilities,
                current_load: 0,
                last_heartbeat: Instant::now(),
                registered_at: Utc::now(),
                total_dispatched: 0,
            },
        );
        Ok(())
    }

    pub async fn unregister_worker(&self, worker_id: &str) -> Result<WorkerState, WorkerPoolError> {
        let removed = self.workers.write().await.remove(worker_id);
        match removed {
            Some(state) => {
                info!(
                    worker_id = worker_id,
                    in_flight = state.current_load,
                    "Worker unregistered"
                );
                Ok(state)
            }
            None => Err(WorkerPoolError::WorkerNotFound {
                worker_id: worker_id.to_string(),
            }),
        }
    }

    pub async fn heartbeat(&self, worker_id: &str) -> Result<(), WorkerPoolError> {
        let mut workers = self.workers.write().await;
        match workers.get_mut(worker_id) {
            Some(worker) => {
                worker.last_heartbeat = Instant::now();
                debug!(worker_id = worker_id, load = worker.current_load, "Heartbeat");
                Ok(())
            }
            None => Err(WorkerPoolError::WorkerNotFound {
                worker_id: worker_id.to_string(),
            }),
        }
    }

    /// Pick a healthy worker with spare capacity matching `criteria`
    pub async fn select_worker(&self, criteria: &TargetSelectionCriteria) -> Option<String> {
        let workers = self.workers.read().await;

        let mut eligible: Vec<(&String, &WorkerState)> = workers
            .iter()
            .filter(|(_, worker)| {
                worker.matches(criteria)
                    && worker.available_capacity() > 0
                    && worker.is_healthy(&self.config)
            })
            .collect();

        if eligible.is_empty() {
            debug!(
                namespace = ?criteria.namespace,
                capabilities = ?criteria.required_capabilities,
                "No eligible worker"
            );
            return None;
        }

        if let Some(preferred) = &criteria.preferred_worker {
            if eligible.iter().any(|(id, _)| *id == preferred) {
                return Some(preferred.clone());
            }
        }

        // Stable order so ties resolve the same way every time
        eligible.sort_by(|(a, _), (b, _)| a.cmp(b));

        let selected = match self.load_balancer {
            LoadBalancer::FirstAvailable => eligible.first(),
            LoadBalancer::LeastLoad => eligible.iter().min_by_key(|(_, w)| w.current_load),
            LoadBalancer::CapacityBased => eligible
                .iter()
                .rev()
                .max_by_key(|(_, w)| w.available_capacity()),
        }
        .map(|(id, _)| (*id).clone());

        if let Some(worker_id) = &selected {
            debug!(worker_id = %worker_id, strategy = ?self.load_balancer, "Worker selected");
        }
        selected
    }

    pub async fn increment_load(&self, worker_id: &str) -> Result<(), WorkerPoolError> {
        let mut workers = self.workers.write().await;
        match workers.get_mut(worker_id) {
            Some(worker) => {
                worker.current_load += 1;
                worker.total_dispatched += 1;
                Ok(())
            }
            None => Err(WorkerPoolError::WorkerNotFound {
                worker_id: worker_id.to_string(),
            }),
        }
    }

    pub async fn decrement_load(&self, worker_id: &str) -> Result<(), WorkerPoolError> {
        let mut workers = self.workers.write().await;
        match workers.get_mut(worker_id) {
            Some(worker) => {
                worker.current_load = worker.current_load.saturating_sub(1);
                Ok(())
            }
            None => Err(WorkerPoolError::WorkerNotFound {
                worker_id: worker_id.to_string(),
            }),
        }
    }

    pub async fn get_worker(&self, worker_id: &str) -> Option<WorkerState> {
        self.workers.read().await.get(worker_id).cloned()
    }

    /// Drop workers whose heartbeat went stale; returns how many were removed
    pub async fn cleanup_unhealthy_workers(&self) -> usize {
        let mut workers = self.workers.write().await;
        let stale: Vec<String> = workers
            .iter()
            .filter(|(_, worker)| !worker.is_healthy(&self.config))
            .map(|(id, _)| id.clone())
            .collect();

        for worker_id in &stale {
            workers.remove(worker_id);
            warn!(worker_id = %worker_id, "Removed unhealthy worker");
        }
        stale.len()
    }

    pub async fn stats(&self) -> WorkerPoolStats {
        let workers = self.workers.read().await;

        let total_capacity = workers
            .values()
            .map(|w| w.capabilities.max_concurrent_tasks)
            .sum();
        let current_load = workers.values().map(|w| w.current_load).sum();

        let mut namespace_distribution = HashMap::new();
        for worker in workers.values() {
            for namespace in &worker.capabilities.namespaces {
                *namespace_distribution.entry(namespace.clone()).or_insert(0) += 1;
            }
        }

        WorkerPoolStats {
            total_workers: workers.len(),
            healthy_workers: workers
                .values()
                .filter(|w| w.is_healthy(&self.config))
                .count(),
            total_capacity,
            current_load,
            available_capacity: total_capacity.saturating_sub(current_load),
            total_dispatched: workers.values().map(|w| w.total_dispatched).sum(),
            namespace_distribution,
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(WorkerPoolConfig::default(), LoadBalancer::LeastLoad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool(load_balancer: LoadBalancer) -> WorkerPool {
        WorkerPool::new(WorkerPoolConfig::default(), load_balancer)
    }

    #[tokio::test]
    async fn test_rejects_invalid_capabilities() {
        let pool = pool(LoadBalancer::LeastLoad);
        let err = pool
            .register_worker(WorkerCapabilities::new("w1", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerPoolError::InvalidCapabilities { .. }));
    }

    #[tokio::test]
    async fn test_selection_filters_namespace_and_capabilities() {
        let pool = pool(LoadBalancer::FirstAvailable);
        pool.register_worker(WorkerCapabilities::new("a", 2).with_namespace("billing"))
            .await
            .unwrap();
        pool.register_worker(
            WorkerCapabilities::new("b", 2)
                .with_namespace("deploy")
                .with_capability("docker"),
        )
        .await
        .unwrap();

        let deploy = TargetSelectionCriteria::namespace("deploy").with_capability("docker");
        assert_eq!(pool.select_worker(&deploy).await.as_deref(), Some("b"));

        let gpu = TargetSelectionCriteria::namespace("deploy").with_capability("gpu");
        assert_eq!(pool.select_worker(&gpu).await, None);
    }

    #[tokio::test]
    async fn test_least_load_and_capacity_strategies() {
        let least = pool(LoadBalancer::LeastLoad);
        least.register_worker(WorkerCapabilities::new("a", 10)).await.unwrap();
        least.register_worker(WorkerCapabilities::new("b", 2)).await.unwrap();
        least.increment_load("a").await.unwrap();
        assert_eq!(
            least.select_worker(&TargetSelectionCriteria::default()).await.as_deref(),
            Some("b")
        );

        let capacity = pool(LoadBalancer::CapacityBased);
        capacity.register_worker(WorkerCapabilities::new("a", 10)).await.unwrap();
        capacity.register_worker(WorkerCapabilities::new("b", 2)).await.unwrap();
        capacity.increment_load("a").await.unwrap();
        assert_eq!(
            capacity.select_worker(&TargetSelectionCriteria::default()).await.as_deref(),
            Some("a")
        );
    }

    #[tokio::test]
    async fn test_full_workers_are_ineligible() {
        let pool = pool(LoadBalancer::LeastLoad);
        pool.register_worker(WorkerCapabilities::new("a", 1)).await.unwrap();
        pool.increment_load("a").await.unwrap();
        assert_eq!(pool.select_worker(&TargetSelectionCriteria::default()).await, None);

        pool.decrement_load("a").await.unwrap();
        assert!(pool.select_worker(&TargetSelectionCriteria::default()).await.is_some());
    }

    #[tokio::test]
    async fn test_preferred_worker_wins_when_eligible() {
        let pool = pool(LoadBalancer::FirstAvailable);
        pool.register_worker(WorkerCapabilities::new("a", 1)).await.unwrap();
        pool.register_worker(WorkerCapabilities::new("z", 1)).await.unwrap();

        let criteria = TargetSelectionCriteria::default().with_preferred_worker("z");
        assert_eq!(pool.select_worker(&criteria).await.as_deref(), Some("z"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_workers_are_ineligible_and_swept() {
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                max_workers: 10,
                heartbeat_timeout_ms: 1_000,
            },
            LoadBalancer::LeastLoad,
        );
        pool.register_worker(WorkerCapabilities::new("a", 1)).await.unwrap();
        pool.register_worker(WorkerCapabilities::new("b", 1)).await.unwrap();

        tokio::time::advance(Duration::from_millis(800)).await;
        pool.heartbeat("b").await.unwrap();
        tokio::time::advance(Duration::from_millis(400)).await;

        assert_eq!(
            pool.select_worker(&TargetSelectionCriteria::default()).await.as_deref(),
            Some("b")
        );
        assert_eq!(pool.cleanup_unhealthy_workers().await, 1);
        assert_eq!(pool.stats().await.total_workers, 1);
    }
}
