//! Assembled step execution views.
//!
//! An aggregate pairs a top-level step execution with its partition-level
//! executions ordered by partition number, and — when the backing schema has
//! partition support — each partition's remotable dispatch record.

use serde::{Deserialize, Serialize};

use super::remotable_partition::RemotablePartition;
use super::step_thread_execution::StepThreadExecution;

/// One partition execution joined with its dispatch record, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionStepAggregate {
    pub execution: StepThreadExecution,
    /// Absent when the schema lacks partition support, or when the partition
    /// was dispatched by a down-level node that never created the record.
    pub remotable_partition: Option<RemotablePartition>,
}

/// The top-level step execution plus its partition executions in ascending
/// partition-number order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepThreadExecutionAggregate {
    pub top_level: StepThreadExecution,
    pub partitions: Vec<PartitionStepAggregate>,
}

impl StepThreadExecutionAggregate {
    /// The partition-level executions without their dispatch records.
    pub fn partition_executions(&self) -> Vec<&StepThreadExecution> {
        self.partitions.iter().map(|p| &p.execution).collect()
    }
}
