//! # Job Instance Model
//!
//! The durable identity of one submitted job, surviving across restarts.
//!
//! A job instance is created exactly once per submission and never recreated;
//! restarts attach new [`JobExecution`](crate::models::JobExecution)s to the
//! same instance. The instance carries the dispatch-path state
//! ([`InstanceState`]) alongside a mirror of the current execution's batch
//! status, plus the job definition document that a restart may replace.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::status::{BatchStatus, InstanceState};

/// One submitted job. Identity is immutable once assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInstance {
    pub instance_id: i64,
    pub job_name: String,
    pub job_xml_name: Option<String>,
    /// The job definition document; replaced on restart when the submitter
    /// provides an updated one.
    pub job_xml: Option<String>,
    /// Set once at submission.
    pub submitter: Option<String>,
    pub create_time: NaiveDateTime,
    pub last_updated_time: NaiveDateTime,
    /// Count of executions created so far; also the sequence number the next
    /// execution will be assigned.
    pub num_executions: i32,
    pub instance_state: InstanceState,
    pub batch_status: BatchStatus,
    pub exit_status: Option<String>,
    /// Step id to restart from, when a failed run requested one.
    pub restart_on: Option<String>,
    /// Operator group associations (schema v3 capability).
    pub group_names: BTreeSet<String>,
}

/// Fields for creating a new job instance (identity assigned by the store).
#[derive(Debug, Clone)]
pub struct NewJobInstance {
    pub job_name: String,
    pub job_xml_name: Option<String>,
    pub job_xml: Option<String>,
    pub submitter: Option<String>,
    pub create_time: NaiveDateTime,
}

impl JobInstance {
    /// Build the entity a freshly submitted job starts as: SUBMITTED state,
    /// STARTING status, zero executions.
    pub fn submitted(instance_id: i64, new: NewJobInstance) -> Self {
        Self {
            instance_id,
            job_name: new.job_name,
            job_xml_name: new.job_xml_name,
            job_xml: new.job_xml,
            submitter: new.submitter,
            create_time: new.create_time,
            last_updated_time: new.create_time,
            num_executions: 0,
            instance_state: InstanceState::Submitted,
            batch_status: BatchStatus::Starting,
            exit_status: None,
            restart_on: None,
            group_names: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_submitted_instance_initial_state() {
        let now = Utc::now().naive_utc();
        let instance = JobInstance::submitted(
            1,
            NewJobInstance {
                job_name: "payroll".to_string(),
                job_xml_name: Some("payroll-job".to_string()),
                job_xml: None,
                submitter: Some("alice".to_string()),
                create_time: now,
            },
        );
        assert_eq!(instance.instance_state, InstanceState::Submitted);
        assert_eq!(instance.batch_status, BatchStatus::Starting);
        assert_eq!(instance.num_executions, 0);
        assert_eq!(instance.last_updated_time, now);
        assert!(instance.group_names.is_empty());
    }
}
