//! # Step Thread Execution Model
//!
//! One run attempt of a step thread, created fresh on every (re)start.
//!
//! Two kinds share the struct: the top-level execution (owns the aggregated
//! metrics across its partitions) and partition-level executions (each points
//! at its owning top-level execution within the same job execution and step
//! name). Restart constructors copy persistent user data forward from the
//! previous attempt but always begin at STARTING with zero metrics.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::keys::TOP_LEVEL_PARTITION_NUMBER;
use super::metrics::StepMetrics;
use super::status::BatchStatus;

/// One run attempt of a step thread (top-level or partition-level).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepThreadExecution {
    pub step_execution_id: i64,
    pub job_execution_id: i64,
    pub job_instance_id: i64,
    pub step_name: String,
    pub partition_number: i32,
    pub batch_status: BatchStatus,
    pub exit_status: Option<String>,
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
    /// Opaque user data carried across restarts of this thread.
    pub persistent_user_data: Option<Vec<u8>>,
    pub metrics: StepMetrics,
    pub is_top_level: bool,
    /// Owning top-level execution, set on partition-level rows only.
    pub top_level_execution_id: Option<i64>,
}

impl StepThreadExecution {
    /// A fresh top-level execution: STARTING, zero metrics.
    pub fn new_top_level(
        step_execution_id: i64,
        job_execution_id: i64,
        job_instance_id: i64,
        step_name: impl Into<String>,
    ) -> Self {
        Self {
            step_execution_id,
            job_execution_id,
            job_instance_id,
            step_name: step_name.into(),
            partition_number: TOP_LEVEL_PARTITION_NUMBER,
            batch_status: BatchStatus::Starting,
            exit_status: None,
            start_time: None,
            end_time: None,
            persistent_user_data: None,
            metrics: StepMetrics::zero(),
            is_top_level: true,
            top_level_execution_id: None,
        }
    }

    /// A fresh partition-level execution linked to its owning top-level
    /// execution.
    pub fn new_partition(
        step_execution_id: i64,
        job_execution_id: i64,
        job_instance_id: i64,
        step_name: impl Into<String>,
        partition_number: i32,
        top_level_execution_id: i64,
    ) -> Self {
        Self {
            step_execution_id,
            job_execution_id,
            job_instance_id,
            step_name: step_name.into(),
            partition_number,
            batch_status: BatchStatus::Starting,
            exit_status: None,
            start_time: None,
            end_time: None,
            persistent_user_data: None,
            metrics: StepMetrics::zero(),
            is_top_level: false,
            top_level_execution_id: Some(top_level_execution_id),
        }
    }

    /// Carry persistent user data forward from the previous attempt.
    /// Status and metrics stay at their fresh-start values.
    pub fn with_user_data_from(mut self, previous: &StepThreadExecution) -> Self {
        self.persistent_user_data = previous.persistent_user_data.clone();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_top_level_defaults() {
        let exec = StepThreadExecution::new_top_level(1, 10, 5, "extract");
        assert_eq!(exec.batch_status, BatchStatus::Starting);
        assert_eq!(exec.partition_number, TOP_LEVEL_PARTITION_NUMBER);
        assert_eq!(exec.metrics, StepMetrics::zero());
        assert!(exec.is_top_level);
        assert!(exec.top_level_execution_id.is_none());
    }

    #[test]
    fn test_new_partition_links_owner() {
        let exec = StepThreadExecution::new_partition(2, 10, 5, "extract", 0, 1);
        assert!(!exec.is_top_level);
        assert_eq!(exec.top_level_execution_id, Some(1));
        assert_eq!(exec.partition_number, 0);
    }

    #[test]
    fn test_restart_copies_user_data_but_not_metrics() {
        let mut previous = StepThreadExecution::new_top_level(1, 10, 5, "extract");
        previous.persistent_user_data = Some(vec![9, 9]);
        previous.metrics.read_count = 55;
        previous.batch_status = BatchStatus::Failed;

        let fresh =
            StepThreadExecution::new_top_level(2, 11, 5, "extract").with_user_data_from(&previous);
        assert_eq!(fresh.persistent_user_data, Some(vec![9, 9]));
        assert_eq!(fresh.metrics.read_count, 0);
        assert_eq!(fresh.batch_status, BatchStatus::Starting);
    }
}
