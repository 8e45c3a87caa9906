//! Row shapes fetched from the job store, and their conversions into entity
//! values. Status columns travel as upper-case strings and are parsed here;
//! a value the enums cannot parse means the row was corrupted outside this
//! process and is surfaced as an illegal state.

use chrono::NaiveDateTime;
use sqlx::FromRow;

use crate::error::{BatchError, Result};
use crate::models::{
    JobExecution, JobInstance, RemotablePartition, RemotablePartitionKey, StepMetrics,
    StepThreadExecution, StepThreadInstance, StepThreadInstanceKey,
};

fn parse_status<T: std::str::FromStr<Err = String>>(raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|e: String| BatchError::illegal_state(format!("Invalid value in database: {e}")))
}

#[derive(FromRow)]
pub(crate) struct JobInstanceRow {
    pub instance_id: i64,
    pub job_name: String,
    pub job_xml_name: Option<String>,
    pub job_xml: Option<String>,
    pub submitter: Option<String>,
    pub create_time: NaiveDateTime,
    pub last_updated_time: NaiveDateTime,
    pub num_executions: i32,
    pub instance_state: String,
    pub batch_status: String,
    pub exit_status: Option<String>,
    pub restart_on: Option<String>,
    pub group_names: Option<Vec<String>>,
}

impl TryFrom<JobInstanceRow> for JobInstance {
    type Error = BatchError;

    fn try_from(row: JobInstanceRow) -> Result<Self> {
        Ok(JobInstance {
            instance_id: row.instance_id,
            job_name: row.job_name,
            job_xml_name: row.job_xml_name,
            job_xml: row.job_xml,
            submitter: row.submitter,
            create_time: row.create_time,
            last_updated_time: row.last_updated_time,
            num_executions: row.num_executions,
            instance_state: parse_status(&row.instance_state)?,
            batch_status: parse_status(&row.batch_status)?,
            exit_status: row.exit_status,
            restart_on: row.restart_on,
            group_names: row.group_names.unwrap_or_default().into_iter().collect(),
        })
    }
}

/// Select list for job instance reads. Columns the detected schema version
/// lacks are synthesized so the row shape stays fixed.
pub(crate) fn instance_columns(
    prefix: &str,
    supports_update_time: bool,
    supports_group_names: bool,
) -> String {
    let last_updated = if supports_update_time {
        format!("{prefix}last_updated_time")
    } else {
        format!("{prefix}create_time AS last_updated_time")
    };
    let group_names = if supports_group_names {
        format!("{prefix}group_names")
    } else {
        "NULL::text[] AS group_names".to_string()
    };
    format!(
        "{prefix}instance_id, {prefix}job_name, {prefix}job_xml_name, {prefix}job_xml, \
         {prefix}submitter, {prefix}create_time, {last_updated}, {prefix}num_executions, \
         {prefix}instance_state, {prefix}batch_status, {prefix}exit_status, \
         {prefix}restart_on, {group_names}"
    )
}

#[derive(FromRow)]
pub(crate) struct JobExecutionRow {
    pub execution_id: i64,
    pub instance_id: i64,
    pub execution_num_for_instance: i32,
    pub batch_status: String,
    pub exit_status: Option<String>,
    pub create_time: NaiveDateTime,
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
    pub last_updated_time: NaiveDateTime,
    pub job_parameters: Option<serde_json::Value>,
    pub server_id: String,
    pub rest_url: String,
    pub log_dir_path: Option<String>,
}

impl TryFrom<JobExecutionRow> for JobExecution {
    type Error = BatchError;

    fn try_from(row: JobExecutionRow) -> Result<Self> {
        Ok(JobExecution {
            execution_id: row.execution_id,
            instance_id: row.instance_id,
            execution_num_for_instance: row.execution_num_for_instance,
            batch_status: parse_status(&row.batch_status)?,
            exit_status: row.exit_status,
            create_time: row.create_time,
            start_time: row.start_time,
            end_time: row.end_time,
            last_updated_time: row.last_updated_time,
            job_parameters: row.job_parameters,
            server_id: row.server_id,
            rest_url: row.rest_url,
            log_dir_path: row.log_dir_path,
        })
    }
}

/// Select list for job execution reads.
pub(crate) fn execution_columns(prefix: &str, supports_job_parameters: bool) -> String {
    let job_parameters = if supports_job_parameters {
        format!("{prefix}job_parameters")
    } else {
        "NULL::jsonb AS job_parameters".to_string()
    };
    format!(
        "{prefix}execution_id, {prefix}instance_id, {prefix}execution_num_for_instance, \
         {prefix}batch_status, {prefix}exit_status, {prefix}create_time, {prefix}start_time, \
         {prefix}end_time, {prefix}last_updated_time, {job_parameters}, {prefix}server_id, \
         {prefix}rest_url, {prefix}log_dir_path"
    )
}

#[derive(FromRow)]
pub(crate) struct StepThreadExecutionRow {
    pub step_execution_id: i64,
    pub job_execution_id: i64,
    pub job_instance_id: i64,
    pub step_name: String,
    pub partition_number: i32,
    pub batch_status: String,
    pub exit_status: Option<String>,
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
    pub persistent_user_data: Option<Vec<u8>>,
    pub read_count: i64,
    pub write_count: i64,
    pub commit_count: i64,
    pub rollback_count: i64,
    pub read_skip_count: i64,
    pub write_skip_count: i64,
    pub is_top_level: bool,
    pub top_level_execution_id: Option<i64>,
}

impl TryFrom<StepThreadExecutionRow> for StepThreadExecution {
    type Error = BatchError;

    fn try_from(row: StepThreadExecutionRow) -> Result<Self> {
        Ok(StepThreadExecution {
            step_execution_id: row.step_execution_id,
            job_execution_id: row.job_execution_id,
            job_instance_id: row.job_instance_id,
            step_name: row.step_name,
            partition_number: row.partition_number,
            batch_status: parse_status(&row.batch_status)?,
            exit_status: row.exit_status,
            start_time: row.start_time,
            end_time: row.end_time,
            persistent_user_data: row.persistent_user_data,
            metrics: StepMetrics {
                read_count: row.read_count,
                write_count: row.write_count,
                commit_count: row.commit_count,
                rollback_count: row.rollback_count,
                read_skip_count: row.read_skip_count,
                write_skip_count: row.write_skip_count,
            },
            is_top_level: row.is_top_level,
            top_level_execution_id: row.top_level_execution_id,
        })
    }
}

pub(crate) const STEP_EXECUTION_COLUMNS: &str = "step_execution_id, job_execution_id, \
    job_instance_id, step_name, partition_number, batch_status, exit_status, start_time, \
    end_time, persistent_user_data, read_count, write_count, commit_count, rollback_count, \
    read_skip_count, write_skip_count, is_top_level, top_level_execution_id";

pub(crate) fn step_execution_columns(prefix: &str) -> String {
    STEP_EXECUTION_COLUMNS
        .split(", ")
        .map(|col| format!("{prefix}{}", col.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(FromRow)]
pub(crate) struct StepThreadInstanceRow {
    pub job_instance_id: i64,
    pub step_name: String,
    pub partition_number: i32,
    pub start_count: i32,
    pub checkpoint_data: Option<Vec<u8>>,
    pub latest_execution_id: i64,
    pub partitioned: bool,
    pub partition_plan_size: Option<i32>,
}

impl From<StepThreadInstanceRow> for StepThreadInstance {
    fn from(row: StepThreadInstanceRow) -> Self {
        StepThreadInstance {
            key: StepThreadInstanceKey {
                job_instance_id: row.job_instance_id,
                step_name: row.step_name,
                partition_number: row.partition_number,
            },
            start_count: row.start_count,
            checkpoint_data: row.checkpoint_data,
            latest_execution_id: row.latest_execution_id,
            partitioned: row.partitioned,
            partition_plan_size: row.partition_plan_size,
        }
    }
}

pub(crate) const STEP_INSTANCE_COLUMNS: &str = "job_instance_id, step_name, partition_number, \
    start_count, checkpoint_data, latest_execution_id, partitioned, partition_plan_size";

#[derive(FromRow)]
pub(crate) struct RemotablePartitionRow {
    pub job_execution_id: i64,
    pub step_name: String,
    pub partition_number: i32,
    pub internal_state: String,
    pub server_id: String,
    pub rest_url: String,
    pub log_dir_path: Option<String>,
    pub last_updated: NaiveDateTime,
    pub step_execution_id: Option<i64>,
}

impl TryFrom<RemotablePartitionRow> for RemotablePartition {
    type Error = BatchError;

    fn try_from(row: RemotablePartitionRow) -> Result<Self> {
        Ok(RemotablePartition {
            key: RemotablePartitionKey {
                job_execution_id: row.job_execution_id,
                step_name: row.step_name,
                partition_number: row.partition_number,
            },
            internal_state: parse_status(&row.internal_state)?,
            server_id: row.server_id,
            rest_url: row.rest_url,
            log_dir_path: row.log_dir_path,
            last_updated: row.last_updated,
            step_execution_id: row.step_execution_id,
        })
    }
}

pub(crate) fn partition_columns(prefix: &str) -> String {
    [
        "job_execution_id",
        "step_name",
        "partition_number",
        "internal_state",
        "server_id",
        "rest_url",
        "log_dir_path",
        "last_updated",
        "step_execution_id",
    ]
    .iter()
    .map(|col| format!("{prefix}{col}"))
    .collect::<Vec<_>>()
    .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_columns_synthesize_missing_capabilities() {
        let full = instance_columns("", true, true);
        assert!(full.contains("last_updated_time,"));
        assert!(full.ends_with("group_names"));

        let downlevel = instance_columns("", false, false);
        assert!(downlevel.contains("create_time AS last_updated_time"));
        assert!(downlevel.contains("NULL::text[] AS group_names"));
    }

    #[test]
    fn test_execution_columns_synthesize_job_parameters() {
        let downlevel = execution_columns("e.", false);
        assert!(downlevel.contains("NULL::jsonb AS job_parameters"));
        assert!(downlevel.contains("e.execution_id"));
    }

    #[test]
    fn test_step_execution_columns_prefixed() {
        let cols = step_execution_columns("s.");
        assert!(cols.starts_with("s.step_execution_id"));
        assert!(cols.contains("s.write_skip_count"));
    }

    #[test]
    fn test_invalid_status_surfaces_illegal_state() {
        let row = JobExecutionRow {
            execution_id: 1,
            instance_id: 1,
            execution_num_for_instance: 0,
            batch_status: "NOT_A_STATUS".to_string(),
            exit_status: None,
            create_time: chrono::Utc::now().naive_utc(),
            start_time: None,
            end_time: None,
            last_updated_time: chrono::Utc::now().naive_utc(),
            job_parameters: None,
            server_id: String::new(),
            rest_url: String::new(),
            log_dir_path: None,
        };
        let err = JobExecution::try_from(row).unwrap_err();
        assert!(matches!(err, BatchError::IllegalState(_)));
    }
}
