use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Registry key naming a kind of step (e.g. `k8s_rolling_deploy`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepType(String);

impl StepType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepType {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for StepType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Token matching one unit of asynchronous work to its eventual response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Random correlation id. Prefer [`CorrelationIdGenerator`] for ids
    /// that must be unique for the lifetime of the process.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Identifier of one spawned child execution (the child's runtime id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChildId(Uuid);

impl ChildId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ChildId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Issues correlation ids that never repeat within one process.
///
/// The high 64 bits are a random per-generator nonce, the low 64 bits a
/// monotonically increasing counter.
#[derive(Debug)]
pub struct CorrelationIdGenerator {
    nonce: u64,
    counter: AtomicU64,
}

impl CorrelationIdGenerator {
    pub fn new() -> Self {
        let (nonce, _) = Uuid::new_v4().as_u64_pair();
        Self {
            nonce,
            counter: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> CorrelationId {
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed);
        CorrelationId(Uuid::from_u64_pair(self.nonce, sequence))
    }

    /// Number of ids issued so far
    pub fn issued(&self) -> u64 {
        self.counter.load(Ordering::Relaxed) - 1
    }
}

impl Default for CorrelationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
