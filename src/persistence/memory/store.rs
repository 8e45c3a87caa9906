//! Process-lifetime entity store backing the in-memory persistence service.
//!
//! Concurrent key-to-entity maps with monotonic id generators seeded at 1.
//! The store's lifetime is the whole process: construct one `Arc<MemoryStore>`
//! at startup and inject it into every backend instance, so the data survives
//! a component restart within the same process.

use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;

use crate::models::{
    JobExecution, JobInstance, RemotablePartition, RemotablePartitionKey, StepThreadExecution,
    StepThreadInstance, StepThreadInstanceKey,
};

/// Shared entity maps and id generators for the in-memory backend.
pub struct MemoryStore {
    pub(crate) job_instances: DashMap<i64, JobInstance>,
    pub(crate) job_executions: DashMap<i64, JobExecution>,
    pub(crate) step_executions: DashMap<i64, StepThreadExecution>,
    pub(crate) step_instances: DashMap<StepThreadInstanceKey, StepThreadInstance>,
    pub(crate) remotable_partitions: DashMap<RemotablePartitionKey, RemotablePartition>,
    next_instance_id: AtomicI64,
    next_execution_id: AtomicI64,
    next_step_execution_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            job_instances: DashMap::new(),
            job_executions: DashMap::new(),
            step_executions: DashMap::new(),
            step_instances: DashMap::new(),
            remotable_partitions: DashMap::new(),
            next_instance_id: AtomicI64::new(1),
            next_execution_id: AtomicI64::new(1),
            next_step_execution_id: AtomicI64::new(1),
        }
    }

    pub(crate) fn next_instance_id(&self) -> i64 {
        self.next_instance_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn next_execution_id(&self) -> i64 {
        self.next_execution_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn next_step_execution_id(&self) -> i64 {
        self.next_step_execution_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generators_seeded_at_one() {
        let store = MemoryStore::new();
        assert_eq!(store.next_instance_id(), 1);
        assert_eq!(store.next_instance_id(), 2);
        assert_eq!(store.next_execution_id(), 1);
        assert_eq!(store.next_step_execution_id(), 1);
    }
}
