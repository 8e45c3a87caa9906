//! Composite keys for step thread instances and remotable partitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Partition number marking the top-level thread of a step (as opposed to a
/// numbered partition thread).
pub const TOP_LEVEL_PARTITION_NUMBER: i32 = -1;

/// Durable identity of one step thread: the top-level thread or one numbered
/// partition of a step, within a job instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepThreadInstanceKey {
    pub job_instance_id: i64,
    pub step_name: String,
    pub partition_number: i32,
}

impl StepThreadInstanceKey {
    /// Key for the top-level thread of a step.
    pub fn top_level(job_instance_id: i64, step_name: impl Into<String>) -> Self {
        Self {
            job_instance_id,
            step_name: step_name.into(),
            partition_number: TOP_LEVEL_PARTITION_NUMBER,
        }
    }

    /// Key for one numbered partition thread of a step.
    pub fn partition(
        job_instance_id: i64,
        step_name: impl Into<String>,
        partition_number: i32,
    ) -> Self {
        Self {
            job_instance_id,
            step_name: step_name.into(),
            partition_number,
        }
    }

    pub fn is_top_level(&self) -> bool {
        self.partition_number == TOP_LEVEL_PARTITION_NUMBER
    }
}

impl fmt::Display for StepThreadInstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{instance={}, step={}, partition={}}}",
            self.job_instance_id, self.step_name, self.partition_number
        )
    }
}

/// Identity of a cross-process partition dispatch record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemotablePartitionKey {
    pub job_execution_id: i64,
    pub step_name: String,
    pub partition_number: i32,
}

impl RemotablePartitionKey {
    pub fn new(
        job_execution_id: i64,
        step_name: impl Into<String>,
        partition_number: i32,
    ) -> Self {
        Self {
            job_execution_id,
            step_name: step_name.into(),
            partition_number,
        }
    }
}

impl fmt::Display for RemotablePartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{execution={}, step={}, partition={}}}",
            self.job_execution_id, self.step_name, self.partition_number
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_level_key() {
        let key = StepThreadInstanceKey::top_level(5, "load");
        assert!(key.is_top_level());
        assert_eq!(key.partition_number, TOP_LEVEL_PARTITION_NUMBER);
    }

    #[test]
    fn test_partition_key_is_not_top_level() {
        let key = StepThreadInstanceKey::partition(5, "load", 0);
        assert!(!key.is_top_level());
    }
}
