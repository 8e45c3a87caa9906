//! # Job Execution Model
//!
//! One run attempt of a job instance: the first run or a restart.
//!
//! Each execution records its 0-based sequence number within the owning
//! instance, assigned exactly once at creation and equal to the prior count of
//! executions. The dispatch location (`server_id`, `rest_url`) is stamped by
//! the node that picks the execution up; it stays empty until then, which is
//! what the stop-before-dispatch race check keys on.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::status::BatchStatus;

/// One run attempt of a job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub execution_id: i64,
    pub instance_id: i64,
    /// 0-based index of this execution within its instance.
    pub execution_num_for_instance: i32,
    pub batch_status: BatchStatus,
    pub exit_status: Option<String>,
    pub create_time: NaiveDateTime,
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
    pub last_updated_time: NaiveDateTime,
    /// Key-value submission parameters (schema v2 capability).
    pub job_parameters: Option<serde_json::Value>,
    /// Identity of the server running this execution; empty until dispatch.
    pub server_id: String,
    /// Batch REST url of the server running this execution; empty until dispatch.
    pub rest_url: String,
    pub log_dir_path: Option<String>,
}

impl JobExecution {
    /// Build the entity a new (re)start attempt begins as: STARTING, sequence
    /// number equal to the instance's prior execution count, dispatch location
    /// unassigned.
    pub fn starting(
        execution_id: i64,
        instance_id: i64,
        execution_num_for_instance: i32,
        job_parameters: Option<serde_json::Value>,
        create_time: NaiveDateTime,
    ) -> Self {
        Self {
            execution_id,
            instance_id,
            execution_num_for_instance,
            batch_status: BatchStatus::Starting,
            exit_status: None,
            create_time,
            start_time: None,
            end_time: None,
            last_updated_time: create_time,
            job_parameters,
            server_id: String::new(),
            rest_url: String::new(),
            log_dir_path: None,
        }
    }

    /// True while no server has stamped its identity onto this execution.
    pub fn server_not_assigned(&self) -> bool {
        self.server_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_starting_execution_defaults() {
        let now = Utc::now().naive_utc();
        let exec = JobExecution::starting(10, 1, 0, Some(serde_json::json!({"x": "1"})), now);
        assert_eq!(exec.batch_status, BatchStatus::Starting);
        assert_eq!(exec.execution_num_for_instance, 0);
        assert!(exec.server_not_assigned());
        assert!(exec.start_time.is_none());
        assert!(exec.end_time.is_none());
    }
}
