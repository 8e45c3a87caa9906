//! # Step Thread Instance Model
//!
//! Durable per-step identity surviving restarts of that step.
//!
//! Keyed by `{job_instance_id, step_name, partition_number}`; the top-level
//! thread uses the sentinel partition number. The instance carries the state
//! that must outlive any single run attempt: the checkpoint blob, the restart
//! count, and the pointer to the latest execution. The latest-execution
//! pointer is the only mutable link; history is reached by execution id, never
//! traversed backward through instances.

use serde::{Deserialize, Serialize};

use super::keys::StepThreadInstanceKey;

/// Durable identity of one step thread (top-level or one partition).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepThreadInstance {
    pub key: StepThreadInstanceKey,
    /// Number of times the top-level step has been started; bumped on restart.
    pub start_count: i32,
    /// Opaque serialized reader/writer checkpoint.
    pub checkpoint_data: Option<Vec<u8>>,
    /// The most recently created execution for this key.
    pub latest_execution_id: i64,
    /// Whether the top-level step runs partitioned (top-level rows only).
    pub partitioned: bool,
    /// Partition count of the current plan (top-level rows only).
    pub partition_plan_size: Option<i32>,
}

impl StepThreadInstance {
    /// First-execution construction for a top-level thread: start count 1.
    pub fn new_top_level(
        key: StepThreadInstanceKey,
        latest_execution_id: i64,
        partitioned: bool,
    ) -> Self {
        debug_assert!(key.is_top_level());
        Self {
            key,
            start_count: 1,
            checkpoint_data: None,
            latest_execution_id,
            partitioned,
            partition_plan_size: None,
        }
    }

    /// First-execution construction for a partition thread.
    pub fn new_partition(key: StepThreadInstanceKey, latest_execution_id: i64) -> Self {
        debug_assert!(!key.is_top_level());
        Self {
            key,
            start_count: 1,
            checkpoint_data: None,
            latest_execution_id,
            partitioned: false,
            partition_plan_size: None,
        }
    }

    pub fn is_top_level(&self) -> bool {
        self.key.is_top_level()
    }

    pub fn increment_start_count(&mut self) {
        self.start_count += 1;
    }

    pub fn delete_checkpoint_data(&mut self) {
        self.checkpoint_data = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_top_level_starts_at_one() {
        let instance = StepThreadInstance::new_top_level(
            StepThreadInstanceKey::top_level(1, "extract"),
            100,
            true,
        );
        assert_eq!(instance.start_count, 1);
        assert!(instance.is_top_level());
        assert!(instance.partitioned);
        assert!(instance.checkpoint_data.is_none());
    }

    #[test]
    fn test_restart_bookkeeping() {
        let mut instance = StepThreadInstance::new_top_level(
            StepThreadInstanceKey::top_level(1, "extract"),
            100,
            false,
        );
        instance.checkpoint_data = Some(vec![1, 2, 3]);
        instance.increment_start_count();
        assert_eq!(instance.start_count, 2);
        instance.delete_checkpoint_data();
        assert!(instance.checkpoint_data.is_none());
    }
}
