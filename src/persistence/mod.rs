//! # Persistence Backend Abstraction
//!
//! One capability contract, two interchangeable implementations: the durable
//! relational backend ([`sql::SqlPersistence`]) and the process-local
//! in-memory backend ([`memory::MemoryPersistence`]). Which one serves a
//! process is a configuration-time choice; both must satisfy the same
//! property tests.
//!
//! Every mutating operation consults the transition validator before applying
//! the entity change, then returns the updated entity value. The durable
//! backend additionally wraps each operation in a transaction and runs
//! startup recovery before serving requests.

pub mod memory;
pub mod recovery;
pub mod sql;

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::error::Result;
use crate::models::{
    BatchStatus, InstanceState, JobExecution, JobInstance, NewJobInstance, RemotablePartition,
    RemotablePartitionKey, RemotablePartitionState, RuntimeStepSnapshot,
    StepThreadExecutionAggregate, StepThreadExecution, StepThreadInstance, StepThreadInstanceKey,
};

/// Detected entity schema versions, fixed for the process lifetime after the
/// first detection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaVersions {
    pub instance: u32,
    pub execution: u32,
    pub partition: u32,
}

impl SchemaVersions {
    /// Most current versions of every entity.
    pub const MAX: SchemaVersions = SchemaVersions {
        instance: 3,
        execution: 3,
        partition: 2,
    };

    /// Whether the remotable-partition table exists.
    pub fn supports_remotable_partitions(&self) -> bool {
        self.partition >= 2
    }

    /// Whether job parameters are persisted with each execution.
    pub fn supports_job_parameters(&self) -> bool {
        self.execution >= 2
    }

    /// Whether the instance row carries an update timestamp.
    pub fn supports_update_time(&self) -> bool {
        self.instance >= 2
    }

    /// Whether the instance row carries group associations.
    pub fn supports_group_names(&self) -> bool {
        self.instance >= 3
    }
}

/// The persistence contract consumed by the step engine and dispatch layer.
#[async_trait]
pub trait PersistenceService: Send + Sync {
    //
    // Job instance operations
    //

    /// Create the durable identity for a newly submitted job.
    async fn create_job_instance(&self, new: NewJobInstance) -> Result<JobInstance>;

    /// Fails with `NoSuchJobInstance` for an unknown id.
    async fn get_job_instance(&self, instance_id: i64) -> Result<JobInstance>;

    /// Resolve the owning instance of a job execution.
    async fn get_job_instance_from_execution_id(&self, execution_id: i64) -> Result<JobInstance>;

    /// Instances for one job name, newest first, windowed by `start`/`count`.
    async fn get_job_instances(
        &self,
        job_name: &str,
        start: usize,
        count: usize,
    ) -> Result<Vec<JobInstance>>;

    /// As [`get_job_instances`](Self::get_job_instances), restricted to one submitter.
    async fn get_job_instances_for_submitter(
        &self,
        job_name: &str,
        submitter: &str,
        start: usize,
        count: usize,
    ) -> Result<Vec<JobInstance>>;

    /// All instances, newest first, paged.
    async fn get_job_instances_page(&self, page: usize, page_size: usize)
        -> Result<Vec<JobInstance>>;

    async fn job_instance_count(&self, job_name: &str) -> Result<i64>;

    async fn job_instance_count_for_submitter(
        &self,
        job_name: &str,
        submitter: &str,
    ) -> Result<i64>;

    /// Distinct job names known to the store.
    async fn job_names_set(&self) -> Result<BTreeSet<String>>;

    async fn job_names_set_for_submitter(&self, submitter: &str) -> Result<BTreeSet<String>>;

    /// Validated instance-state change.
    async fn update_job_instance_state(
        &self,
        instance_id: i64,
        state: InstanceState,
        last_updated: NaiveDateTime,
    ) -> Result<JobInstance>;

    /// Validated instance-state change that also mirrors a batch status.
    async fn update_job_instance_state_and_status(
        &self,
        instance_id: i64,
        state: InstanceState,
        status: BatchStatus,
        last_updated: NaiveDateTime,
    ) -> Result<JobInstance>;

    /// Move a STOPPED/FAILED instance back to SUBMITTED/STARTING for a
    /// restart. Fails with `InstanceNotRestartable` when the instance is
    /// still in a non-final state.
    async fn update_job_instance_on_restart(
        &self,
        instance_id: i64,
        last_updated: NaiveDateTime,
    ) -> Result<JobInstance>;

    /// SUBMITTED -> JMS_QUEUED, conditionally; a miss is a silent no-op.
    async fn update_job_instance_on_queued(&self, instance_id: i64) -> Result<JobInstance>;

    /// JMS_QUEUED -> JMS_CONSUMED, conditionally; a miss fails with
    /// `JobInstanceNotQueued` (a benign consumed-state race).
    async fn update_job_instance_on_consumed(&self, instance_id: i64) -> Result<JobInstance>;

    /// Set or clear the restart-on step. Validator exemption: not a status write.
    async fn update_job_instance_restart_on(
        &self,
        instance_id: i64,
        restart_on: Option<&str>,
    ) -> Result<JobInstance>;

    /// Replace the job name and definition document on restart.
    /// Validator exemption: not a status write.
    async fn update_job_instance_job_name_and_jsl(
        &self,
        instance_id: i64,
        job_name: &str,
        job_xml: &str,
    ) -> Result<JobInstance>;

    /// Replace the operator group associations (schema v3).
    async fn update_job_instance_group_names(
        &self,
        instance_id: i64,
        group_names: &BTreeSet<String>,
    ) -> Result<JobInstance>;

    /// Remove an instance and everything owned by it. Returns false if the
    /// purge could not be performed.
    async fn purge_job_instance(&self, instance_id: i64) -> Result<bool>;

    //
    // Job execution operations
    //

    /// Create the next run attempt for an instance. The execution's sequence
    /// number is assigned here, equal to the instance's prior count.
    async fn create_job_execution(
        &self,
        instance_id: i64,
        job_parameters: Option<serde_json::Value>,
        create_time: NaiveDateTime,
    ) -> Result<JobExecution>;

    /// Fails with `NoSuchJobExecution` for an unknown id.
    async fn get_job_execution(&self, execution_id: i64) -> Result<JobExecution>;

    /// Executions of an instance, most recent first (by sequence number, not id).
    async fn get_job_executions(&self, instance_id: i64) -> Result<Vec<JobExecution>>;

    /// The execution with the highest sequence number for the instance.
    async fn get_most_recent_job_execution(&self, instance_id: i64) -> Result<JobExecution>;

    /// Lookup by instance id and execution sequence number.
    async fn get_job_execution_from_job_exec_num(
        &self,
        instance_id: i64,
        exec_num: i32,
    ) -> Result<JobExecution>;

    /// Ids of executions of running instances of the named job.
    async fn get_job_executions_running(&self, job_name: &str) -> Result<Vec<i64>>;

    /// STARTED transition: stamps start time, moves the instance to DISPATCHED.
    async fn update_job_execution_and_instance_on_started(
        &self,
        execution_id: i64,
        started_time: NaiveDateTime,
    ) -> Result<JobExecution>;

    /// Validated status change mirrored onto the owning instance.
    async fn update_job_execution_and_instance_on_status_change(
        &self,
        execution_id: i64,
        status: BatchStatus,
        update_time: NaiveDateTime,
    ) -> Result<JobExecution>;

    /// Stop an execution that no server has claimed yet. Fails with
    /// `ExecutionAssignedToServer` when dispatch won the race.
    async fn update_job_execution_and_instance_on_stop_before_server_assigned(
        &self,
        execution_id: i64,
        update_time: NaiveDateTime,
    ) -> Result<JobExecution>;

    /// Final status, exit status, and end time; the owning instance follows
    /// into the matching final state.
    async fn update_job_execution_and_instance_on_end(
        &self,
        execution_id: i64,
        final_status: BatchStatus,
        exit_status: Option<&str>,
        end_time: NaiveDateTime,
    ) -> Result<JobExecution>;

    /// Stamp this server's identity onto an execution still in STARTING.
    /// Fails with `JobStopped` when the execution already left STARTING.
    async fn update_job_execution_server_and_rest_url_for_starting_job(
        &self,
        execution_id: i64,
    ) -> Result<JobExecution>;

    /// Validator exemption: not a status write.
    async fn update_job_execution_log_dir(
        &self,
        execution_id: i64,
        log_dir_path: &str,
    ) -> Result<JobExecution>;

    //
    // Step thread operations
    //

    /// First execution of a top-level step: creates the thread instance and
    /// execution together.
    async fn create_top_level_step_execution_and_new_instance(
        &self,
        job_execution_id: i64,
        key: &StepThreadInstanceKey,
        is_partitioned: bool,
    ) -> Result<StepThreadExecution>;

    /// First execution of one partition thread. Requires exactly one existing
    /// top-level execution for the same job execution and step name; zero or
    /// several is a fatal inconsistency.
    async fn create_partition_step_execution_and_new_instance(
        &self,
        job_execution_id: i64,
        key: &StepThreadInstanceKey,
        is_remote_dispatch: bool,
    ) -> Result<StepThreadExecution>;

    /// Restart of a top-level step: new execution carrying the previous
    /// attempt's persistent user data, start count bumped.
    async fn create_top_level_step_execution_on_restart(
        &self,
        job_execution_id: i64,
        key: &StepThreadInstanceKey,
    ) -> Result<StepThreadExecution>;

    /// Restart of a partition thread: new execution carrying user data.
    async fn create_partition_step_execution_on_restart(
        &self,
        job_execution_id: i64,
        key: &StepThreadInstanceKey,
        is_remote_dispatch: bool,
    ) -> Result<StepThreadExecution>;

    /// Restart discarding history: no user data carried, checkpoint dropped,
    /// start count still bumped.
    async fn create_top_level_step_execution_on_restart_and_clean(
        &self,
        job_execution_id: i64,
        key: &StepThreadInstanceKey,
    ) -> Result<StepThreadExecution>;

    /// Fails with `UnknownStepExecution` for an unknown id.
    async fn get_step_thread_execution(&self, step_execution_id: i64)
        -> Result<StepThreadExecution>;

    /// Absence is an expected outcome (first run of a step), not an error.
    async fn get_step_thread_instance(
        &self,
        key: &StepThreadInstanceKey,
    ) -> Result<Option<StepThreadInstance>>;

    /// Partition numbers under a top-level key whose latest execution
    /// completed, ascending.
    async fn get_completed_partition_numbers(
        &self,
        top_level_key: &StepThreadInstanceKey,
    ) -> Result<Vec<i32>>;

    /// Persist reader/writer checkpoint data for a thread instance.
    /// Validator exemption: not a status write.
    async fn update_step_thread_instance_checkpoint(
        &self,
        key: &StepThreadInstanceKey,
        checkpoint_data: Option<Vec<u8>>,
    ) -> Result<StepThreadInstance>;

    /// Record the partition count of the current plan on the top-level
    /// thread instance.
    async fn update_partition_plan_size(
        &self,
        top_level_key: &StepThreadInstanceKey,
        plan_size: i32,
    ) -> Result<StepThreadInstance>;

    /// Delete the partition-level thread instances under a top-level key.
    /// Their executions are owned by the job execution and are never
    /// cascade-deleted here.
    async fn delete_partition_step_thread_instances(
        &self,
        top_level_key: &StepThreadInstanceKey,
    ) -> Result<()>;

    /// Persist a step engine snapshot verbatim: status, exit status,
    /// timestamps, user data, and the six metric counters.
    async fn update_step_execution(
        &self,
        snapshot: &RuntimeStepSnapshot,
    ) -> Result<StepThreadExecution>;

    /// As [`update_step_execution`](Self::update_step_execution) for a
    /// top-level execution, then recompute its aggregate metrics: own
    /// counters plus every sibling partition execution's.
    async fn update_top_level_step_execution_with_partition_aggregate(
        &self,
        snapshot: &RuntimeStepSnapshot,
    ) -> Result<StepThreadExecution>;

    /// Top-level executions of a job execution, start-time ascending.
    async fn get_top_level_step_executions(
        &self,
        job_execution_id: i64,
    ) -> Result<Vec<StepThreadExecution>>;

    //
    // Remotable partition operations
    //

    /// Publish a partition for cross-process dispatch. Returns None (never
    /// fails) when the backing schema lacks partition support.
    async fn create_remotable_partition(
        &self,
        key: RemotablePartitionKey,
    ) -> Result<Option<RemotablePartition>>;

    /// Returns None when unsupported by the schema or when the record is
    /// absent (dispatched by a down-level node).
    async fn update_remotable_partition_log_dir(
        &self,
        key: &RemotablePartitionKey,
        log_dir_path: &str,
    ) -> Result<Option<RemotablePartition>>;

    /// Returns None when unsupported or absent.
    async fn get_remotable_partition_internal_state(
        &self,
        key: &RemotablePartitionKey,
    ) -> Result<Option<RemotablePartitionState>>;

    /// Partition numbers recovered under a top-level step execution; empty
    /// when the schema lacks partition support.
    async fn get_recovered_partition_numbers(
        &self,
        top_level_step_execution_id: i64,
    ) -> Result<Vec<i32>>;

    /// All dispatch records under a job execution; None when unsupported.
    async fn get_remotable_partitions_for_job_execution(
        &self,
        job_execution_id: i64,
    ) -> Result<Option<Vec<RemotablePartition>>>;

    //
    // Aggregate views
    //

    /// Aggregate rooted at a top-level step execution id.
    async fn get_step_execution_aggregate(
        &self,
        top_level_step_execution_id: i64,
    ) -> Result<StepThreadExecutionAggregate>;

    /// Aggregate for one step of one job execution.
    async fn get_step_execution_aggregate_from_job_execution(
        &self,
        job_execution_id: i64,
        step_name: &str,
    ) -> Result<StepThreadExecutionAggregate>;

    /// Aggregate addressed by instance id and execution sequence number.
    async fn get_step_execution_aggregate_from_job_exec_num(
        &self,
        instance_id: i64,
        exec_num: i32,
        step_name: &str,
    ) -> Result<StepThreadExecutionAggregate>;

    //
    // Versioning introspection
    //

    /// Detected schema versions; read-only after first detection.
    fn schema_versions(&self) -> SchemaVersions;
}

/// Recovery-time queries and forced transitions, used only by the startup
/// recovery coordinator. Both backends implement it so the recovery contract
/// can be exercised without a live database.
#[async_trait]
pub trait RecoveryStore: Send + Sync {
    /// Executions still in a running-like status attributed to `server_id`.
    async fn get_job_executions_running_on_server(
        &self,
        server_id: &str,
    ) -> Result<Vec<JobExecution>>;

    /// Step thread executions of one job execution still in a running-like
    /// status, ascending by step execution id.
    async fn get_step_thread_executions_running(
        &self,
        job_execution_id: i64,
    ) -> Result<Vec<StepThreadExecution>>;

    /// Force a step thread execution to a final status during recovery
    /// (validated transition).
    async fn update_step_execution_on_recovery(
        &self,
        step_execution_id: i64,
        status: BatchStatus,
        exit_status: Option<&str>,
        end_time: NaiveDateTime,
    ) -> Result<StepThreadExecution>;

    /// Force a job execution and its owning instance to a final status during
    /// recovery. Same semantics as the on-end update, reachable before the
    /// persistence unit is published.
    async fn finalize_job_execution_on_recovery(
        &self,
        execution_id: i64,
        status: BatchStatus,
        exit_status: Option<&str>,
        end_time: NaiveDateTime,
    ) -> Result<JobExecution>;

    /// Partitions still in a running-like state attributed to `server_id`;
    /// empty when the schema lacks partition support.
    async fn get_remotable_partitions_running_on_server(
        &self,
        server_id: &str,
    ) -> Result<Vec<RemotablePartition>>;

    /// Mark a partition RECOVERED with a fresh last-updated stamp.
    async fn update_remotable_partition_on_recovery(
        &self,
        key: &RemotablePartitionKey,
        now: NaiveDateTime,
    ) -> Result<RemotablePartition>;
}
