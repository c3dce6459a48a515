//! Render jobs, memory budgets and correlation ids

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use uuid::Uuid;

/// Memory budget applied when a job does not specify one, in MiB
pub const DEFAULT_MAX_MEMORY_MB: u64 = 250;

const MIB: u64 = 1024 * 1024;

/// Maximum resident memory a worker may report after a job before it is recycled
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryBudget(u64);

impl MemoryBudget {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn from_mib(mib: u64) -> Self {
        Self(mib.saturating_mul(MIB))
    }

    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    pub const fn as_mib(&self) -> u64 {
        self.0 / MIB
    }

    /// A worker reporting `usage_bytes` has exceeded this budget once it
    /// reaches it; hitting the threshold exactly already counts.
    pub const fn is_exceeded_by(&self, usage_bytes: u64) -> bool {
        usage_bytes >= self.0
    }
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self::from_mib(DEFAULT_MAX_MEMORY_MB)
    }
}

impl fmt::Display for MemoryBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}MiB", self.as_mib())
    }
}

/// A unit of render work: an opaque payload plus the memory budget the
/// executing worker must respect. Jobs carry no identity; the pool assigns
/// a [`CorrelationId`] when the job is dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderJob {
    payload: JsonValue,
    budget: MemoryBudget,
}

impl RenderJob {
    /// Create a job with the default memory budget
    pub fn new(payload: JsonValue) -> Self {
        Self {
            payload,
            budget: MemoryBudget::default(),
        }
    }

    /// Override the memory budget, in MiB
    pub fn with_max_memory_mb(mut self, max_memory_mb: u64) -> Self {
        self.budget = MemoryBudget::from_mib(max_memory_mb);
        self
    }

    pub fn with_budget(mut self, budget: MemoryBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn budget(&self) -> MemoryBudget {
        self.budget
    }

    pub fn into_parts(self) -> (JsonValue, MemoryBudget) {
        (self.payload, self.budget)
    }
}

/// Identifier matching an asynchronous worker reply to its waiting caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a fresh random (version 4) id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
