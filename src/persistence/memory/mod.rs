//! # In-Memory Persistence Backend
//!
//! Direct, process-local implementation of the persistence contract:
//! concurrent maps keyed by id (or composite key), atomic id generators, no
//! transactions. Mutations are visible immediately and callers are assumed to
//! be the single writer per entity in practice.
//!
//! The backing [`MemoryStore`] outlives any one backend instance, which is
//! what gives this backend its within-process durability for dev and test
//! use.

pub mod store;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use tracing::debug;

use crate::error::{BatchError, Result};
use crate::location::BatchLocation;
use crate::models::{
    BatchStatus, InstanceState, JobExecution, JobInstance, NewJobInstance, RemotablePartition,
    RemotablePartitionKey, RemotablePartitionState, RuntimeStepSnapshot,
    StepThreadExecutionAggregate, StepThreadExecution, StepThreadInstance, StepThreadInstanceKey,
    PartitionStepAggregate,
};
use crate::state_machine::{verify_state_transition, verify_status_transition};

use super::{PersistenceService, RecoveryStore, SchemaVersions};

pub use store::MemoryStore;

/// In-memory implementation of [`PersistenceService`].
pub struct MemoryPersistence {
    store: Arc<MemoryStore>,
    location: Arc<dyn BatchLocation>,
}

impl MemoryPersistence {
    pub fn new(store: Arc<MemoryStore>, location: Arc<dyn BatchLocation>) -> Self {
        Self { store, location }
    }

    fn instance_snapshot(&self, instance_id: i64) -> Result<JobInstance> {
        self.store
            .job_instances
            .get(&instance_id)
            .map(|entry| entry.value().clone())
            .ok_or(BatchError::NoSuchJobInstance(instance_id))
    }

    fn execution_snapshot(&self, execution_id: i64) -> Result<JobExecution> {
        self.store
            .job_executions
            .get(&execution_id)
            .map(|entry| entry.value().clone())
            .ok_or(BatchError::NoSuchJobExecution(execution_id))
    }

    /// Sorted newest-first snapshot of instances matching `filter`.
    fn sorted_instances(&self, filter: impl Fn(&JobInstance) -> bool) -> Vec<JobInstance> {
        let mut instances: Vec<JobInstance> = self
            .store
            .job_instances
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        instances.sort_by(|a, b| {
            b.create_time
                .cmp(&a.create_time)
                .then(b.instance_id.cmp(&a.instance_id))
        });
        instances
    }

    /// The unique top-level execution for a job execution and step name.
    /// Zero or more than one is a fatal inconsistency.
    fn unique_top_level_execution(
        &self,
        job_execution_id: i64,
        step_name: &str,
    ) -> Result<StepThreadExecution> {
        let mut matches: Vec<StepThreadExecution> = self
            .store
            .step_executions
            .iter()
            .filter(|entry| {
                let exec = entry.value();
                exec.job_execution_id == job_execution_id
                    && exec.step_name == step_name
                    && exec.is_top_level
            })
            .map(|entry| entry.value().clone())
            .collect();
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(BatchError::illegal_state(format!(
                "No top-level step execution found for job execution {job_execution_id}, step {step_name}"
            ))),
            n => Err(BatchError::illegal_state(format!(
                "Found {n} top-level step executions for job execution {job_execution_id}, step {step_name}"
            ))),
        }
    }

    /// Stamp a queued dispatch record as consumed by this server, when one
    /// exists. A missing record means the dispatcher runs a down-level
    /// schema; that is tolerated.
    fn consume_remotable_partition(
        &self,
        job_execution_id: i64,
        key: &StepThreadInstanceKey,
        step_execution_id: i64,
    ) {
        let partition_key =
            RemotablePartitionKey::new(job_execution_id, key.step_name.clone(), key.partition_number);
        if let Some(mut entry) = self.store.remotable_partitions.get_mut(&partition_key) {
            entry.value_mut().consume(
                self.location.server_id(),
                self.location.rest_url(),
                step_execution_id,
                Utc::now().naive_utc(),
            );
        }
    }

    fn apply_snapshot(
        exec: &mut StepThreadExecution,
        snapshot: &RuntimeStepSnapshot,
    ) -> Result<()> {
        verify_status_transition(exec.step_execution_id, exec.batch_status, snapshot.batch_status)?;
        exec.batch_status = snapshot.batch_status;
        exec.exit_status = snapshot.exit_status.clone();
        exec.start_time = snapshot.start_time;
        exec.end_time = snapshot.end_time;
        exec.persistent_user_data = snapshot.persistent_user_data.clone();
        exec.metrics = snapshot.metrics();
        Ok(())
    }

    fn partition_executions_of(&self, top_level_execution_id: i64) -> Vec<StepThreadExecution> {
        let mut partitions: Vec<StepThreadExecution> = self
            .store
            .step_executions
            .iter()
            .filter(|entry| entry.value().top_level_execution_id == Some(top_level_execution_id))
            .map(|entry| entry.value().clone())
            .collect();
        partitions.sort_by_key(|exec| exec.partition_number);
        partitions
    }

    fn aggregate_for(&self, top_level: StepThreadExecution) -> StepThreadExecutionAggregate {
        let partitions = self
            .partition_executions_of(top_level.step_execution_id)
            .into_iter()
            .map(|execution| {
                let partition_key = RemotablePartitionKey::new(
                    execution.job_execution_id,
                    execution.step_name.clone(),
                    execution.partition_number,
                );
                let remotable_partition = self
                    .store
                    .remotable_partitions
                    .get(&partition_key)
                    .map(|entry| entry.value().clone());
                PartitionStepAggregate {
                    execution,
                    remotable_partition,
                }
            })
            .collect();
        StepThreadExecutionAggregate {
            top_level,
            partitions,
        }
    }
}

#[async_trait]
impl PersistenceService for MemoryPersistence {
    async fn create_job_instance(&self, new: NewJobInstance) -> Result<JobInstance> {
        let instance_id = self.store.next_instance_id();
        let instance = JobInstance::submitted(instance_id, new);
        self.store.job_instances.insert(instance_id, instance.clone());
        debug!(instance_id, job_name = %instance.job_name, "created job instance");
        Ok(instance)
    }

    async fn get_job_instance(&self, instance_id: i64) -> Result<JobInstance> {
        self.instance_snapshot(instance_id)
    }

    async fn get_job_instance_from_execution_id(&self, execution_id: i64) -> Result<JobInstance> {
        let execution = self.execution_snapshot(execution_id)?;
        self.instance_snapshot(execution.instance_id)
    }

    async fn get_job_instances(
        &self,
        job_name: &str,
        start: usize,
        count: usize,
    ) -> Result<Vec<JobInstance>> {
        Ok(self
            .sorted_instances(|instance| instance.job_name == job_name)
            .into_iter()
            .skip(start)
            .take(count)
            .collect())
    }

    async fn get_job_instances_for_submitter(
        &self,
        job_name: &str,
        submitter: &str,
        start: usize,
        count: usize,
    ) -> Result<Vec<JobInstance>> {
        Ok(self
            .sorted_instances(|instance| {
                instance.job_name == job_name && instance.submitter.as_deref() == Some(submitter)
            })
            .into_iter()
            .skip(start)
            .take(count)
            .collect())
    }

    async fn get_job_instances_page(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<JobInstance>> {
        Ok(self
            .sorted_instances(|_| true)
            .into_iter()
            .skip(page.saturating_mul(page_size))
            .take(page_size)
            .collect())
    }

    async fn job_instance_count(&self, job_name: &str) -> Result<i64> {
        Ok(self
            .store
            .job_instances
            .iter()
            .filter(|entry| entry.value().job_name == job_name)
            .count() as i64)
    }

    async fn job_instance_count_for_submitter(
        &self,
        job_name: &str,
        submitter: &str,
    ) -> Result<i64> {
        Ok(self
            .store
            .job_instances
            .iter()
            .filter(|entry| {
                let instance = entry.value();
                instance.job_name == job_name && instance.submitter.as_deref() == Some(submitter)
            })
            .count() as i64)
    }

    async fn job_names_set(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .store
            .job_instances
            .iter()
            .map(|entry| entry.value().job_name.clone())
            .collect())
    }

    async fn job_names_set_for_submitter(&self, submitter: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .store
            .job_instances
            .iter()
            .filter(|entry| entry.value().submitter.as_deref() == Some(submitter))
            .map(|entry| entry.value().job_name.clone())
            .collect())
    }

    async fn update_job_instance_state(
        &self,
        instance_id: i64,
        state: InstanceState,
        last_updated: NaiveDateTime,
    ) -> Result<JobInstance> {
        let mut entry = self
            .store
            .job_instances
            .get_mut(&instance_id)
            .ok_or(BatchError::NoSuchJobInstance(instance_id))?;
        let instance = entry.value_mut();
        verify_state_transition(instance_id, instance.instance_state, state)?;
        instance.instance_state = state;
        instance.last_updated_time = last_updated;
        Ok(instance.clone())
    }

    async fn update_job_instance_state_and_status(
        &self,
        instance_id: i64,
        state: InstanceState,
        status: BatchStatus,
        last_updated: NaiveDateTime,
    ) -> Result<JobInstance> {
        let mut entry = self
            .store
            .job_instances
            .get_mut(&instance_id)
            .ok_or(BatchError::NoSuchJobInstance(instance_id))?;
        let instance = entry.value_mut();
        // A state check is enough here; the status rides along.
        verify_state_transition(instance_id, instance.instance_state, state)?;
        instance.instance_state = state;
        instance.batch_status = status;
        instance.last_updated_time = last_updated;
        Ok(instance.clone())
    }

    async fn update_job_instance_on_restart(
        &self,
        instance_id: i64,
        last_updated: NaiveDateTime,
    ) -> Result<JobInstance> {
        let mut entry = self
            .store
            .job_instances
            .get_mut(&instance_id)
            .ok_or(BatchError::NoSuchJobInstance(instance_id))?;
        let instance = entry.value_mut();
        verify_state_transition(instance_id, instance.instance_state, InstanceState::Submitted)?;
        verify_status_transition(instance_id, instance.batch_status, BatchStatus::Starting)?;
        if !matches!(
            instance.instance_state,
            InstanceState::Stopped | InstanceState::Failed
        ) {
            return Err(BatchError::InstanceNotRestartable(instance_id));
        }
        instance.instance_state = InstanceState::Submitted;
        instance.batch_status = BatchStatus::Starting;
        instance.last_updated_time = last_updated;
        Ok(instance.clone())
    }

    async fn update_job_instance_on_queued(&self, instance_id: i64) -> Result<JobInstance> {
        let mut entry = self
            .store
            .job_instances
            .get_mut(&instance_id)
            .ok_or(BatchError::NoSuchJobInstance(instance_id))?;
        let instance = entry.value_mut();
        verify_state_transition(instance_id, instance.instance_state, InstanceState::JmsQueued)?;
        if instance.instance_state == InstanceState::Submitted {
            instance.instance_state = InstanceState::JmsQueued;
            instance.last_updated_time = Utc::now().naive_utc();
        } else {
            debug!(instance_id, state = %instance.instance_state, "queued update skipped; not SUBMITTED");
        }
        Ok(instance.clone())
    }

    async fn update_job_instance_on_consumed(&self, instance_id: i64) -> Result<JobInstance> {
        let mut entry = self
            .store
            .job_instances
            .get_mut(&instance_id)
            .ok_or(BatchError::NoSuchJobInstance(instance_id))?;
        let instance = entry.value_mut();
        // Guarded by the queued-state condition rather than the validator.
        if instance.instance_state != InstanceState::JmsQueued {
            return Err(BatchError::JobInstanceNotQueued(instance_id));
        }
        instance.instance_state = InstanceState::JmsConsumed;
        instance.last_updated_time = Utc::now().naive_utc();
        Ok(instance.clone())
    }

    async fn update_job_instance_restart_on(
        &self,
        instance_id: i64,
        restart_on: Option<&str>,
    ) -> Result<JobInstance> {
        let mut entry = self
            .store
            .job_instances
            .get_mut(&instance_id)
            .ok_or(BatchError::NoSuchJobInstance(instance_id))?;
        let instance = entry.value_mut();
        instance.restart_on = restart_on.map(str::to_string);
        Ok(instance.clone())
    }

    async fn update_job_instance_job_name_and_jsl(
        &self,
        instance_id: i64,
        job_name: &str,
        job_xml: &str,
    ) -> Result<JobInstance> {
        let mut entry = self
            .store
            .job_instances
            .get_mut(&instance_id)
            .ok_or(BatchError::NoSuchJobInstance(instance_id))?;
        let instance = entry.value_mut();
        instance.job_name = job_name.to_string();
        instance.job_xml = Some(job_xml.to_string());
        Ok(instance.clone())
    }

    async fn update_job_instance_group_names(
        &self,
        instance_id: i64,
        group_names: &BTreeSet<String>,
    ) -> Result<JobInstance> {
        let mut entry = self
            .store
            .job_instances
            .get_mut(&instance_id)
            .ok_or(BatchError::NoSuchJobInstance(instance_id))?;
        let instance = entry.value_mut();
        instance.group_names = group_names.clone();
        Ok(instance.clone())
    }

    async fn purge_job_instance(&self, instance_id: i64) -> Result<bool> {
        if self.store.job_instances.remove(&instance_id).is_none() {
            return Err(BatchError::NoSuchJobInstance(instance_id));
        }
        let owned_executions: Vec<i64> = self
            .store
            .job_executions
            .iter()
            .filter(|entry| entry.value().instance_id == instance_id)
            .map(|entry| entry.value().execution_id)
            .collect();
        for execution_id in &owned_executions {
            self.store.job_executions.remove(execution_id);
            self.store
                .remotable_partitions
                .retain(|key, _| key.job_execution_id != *execution_id);
        }
        self.store
            .step_executions
            .retain(|_, exec| exec.job_instance_id != instance_id);
        self.store
            .step_instances
            .retain(|key, _| key.job_instance_id != instance_id);
        Ok(true)
    }

    async fn create_job_execution(
        &self,
        instance_id: i64,
        job_parameters: Option<serde_json::Value>,
        create_time: NaiveDateTime,
    ) -> Result<JobExecution> {
        // The prior execution count is also the sequence number of this, the
        // next execution (numbering starts at 0). The instance entry is
        // released before touching the execution map; lock order is always
        // execution before instance.
        let execution_num = {
            let mut entry = self.store.job_instances.get_mut(&instance_id).ok_or_else(|| {
                BatchError::illegal_state(format!(
                    "Didn't find job instance associated with value: {instance_id}"
                ))
            })?;
            let instance = entry.value_mut();
            let execution_num = instance.num_executions;
            instance.num_executions += 1;
            execution_num
        };

        let execution_id = self.store.next_execution_id();
        let mut execution = JobExecution::starting(
            execution_id,
            instance_id,
            execution_num,
            job_parameters,
            create_time,
        );
        execution.rest_url = self.location.rest_url().to_string();
        self.store.job_executions.insert(execution_id, execution.clone());
        debug!(execution_id, instance_id, execution_num, "created job execution");
        Ok(execution)
    }

    async fn get_job_execution(&self, execution_id: i64) -> Result<JobExecution> {
        self.execution_snapshot(execution_id)
    }

    async fn get_job_executions(&self, instance_id: i64) -> Result<Vec<JobExecution>> {
        let mut executions: Vec<JobExecution> = self
            .store
            .job_executions
            .iter()
            .filter(|entry| entry.value().instance_id == instance_id)
            .map(|entry| entry.value().clone())
            .collect();
        if executions.is_empty() {
            // Distinguish "unknown instance" from "no executions yet".
            self.instance_snapshot(instance_id)?;
            return Ok(Vec::new());
        }
        executions.sort_by(|a, b| b.execution_num_for_instance.cmp(&a.execution_num_for_instance));
        Ok(executions)
    }

    async fn get_most_recent_job_execution(&self, instance_id: i64) -> Result<JobExecution> {
        self.get_job_executions(instance_id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                BatchError::illegal_state(format!(
                    "No executions found for job instance {instance_id}"
                ))
            })
    }

    async fn get_job_execution_from_job_exec_num(
        &self,
        instance_id: i64,
        exec_num: i32,
    ) -> Result<JobExecution> {
        let executions = self.get_job_executions(instance_id).await?;
        executions
            .into_iter()
            .find(|exec| exec.execution_num_for_instance == exec_num)
            .ok_or_else(|| {
                BatchError::illegal_state(format!(
                    "Didn't find any job execution entries at job instance id: {instance_id}, job execution number: {exec_num}"
                ))
            })
    }

    async fn get_job_executions_running(&self, job_name: &str) -> Result<Vec<i64>> {
        let running_instances: BTreeSet<i64> = self
            .store
            .job_instances
            .iter()
            .filter(|entry| {
                let instance = entry.value();
                instance.job_name == job_name && instance.batch_status.is_running()
            })
            .map(|entry| entry.value().instance_id)
            .collect();
        let mut ids: Vec<i64> = self
            .store
            .job_executions
            .iter()
            .filter(|entry| running_instances.contains(&entry.value().instance_id))
            .map(|entry| entry.value().execution_id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn update_job_execution_and_instance_on_started(
        &self,
        execution_id: i64,
        started_time: NaiveDateTime,
    ) -> Result<JobExecution> {
        let mut exec_entry = self
            .store
            .job_executions
            .get_mut(&execution_id)
            .ok_or(BatchError::NoSuchJobExecution(execution_id))?;
        let execution = exec_entry.value_mut();
        let mut instance_entry = self
            .store
            .job_instances
            .get_mut(&execution.instance_id)
            .ok_or(BatchError::NoSuchJobInstance(execution.instance_id))?;
        let instance = instance_entry.value_mut();

        verify_status_transition(execution_id, execution.batch_status, BatchStatus::Started)?;
        verify_state_transition(
            instance.instance_id,
            instance.instance_state,
            InstanceState::Dispatched,
        )?;

        execution.batch_status = BatchStatus::Started;
        execution.start_time = Some(started_time);
        execution.last_updated_time = started_time;
        instance.instance_state = InstanceState::Dispatched;
        instance.batch_status = BatchStatus::Started;
        instance.last_updated_time = started_time;
        Ok(execution.clone())
    }

    async fn update_job_execution_and_instance_on_status_change(
        &self,
        execution_id: i64,
        status: BatchStatus,
        update_time: NaiveDateTime,
    ) -> Result<JobExecution> {
        let mut exec_entry = self
            .store
            .job_executions
            .get_mut(&execution_id)
            .ok_or(BatchError::NoSuchJobExecution(execution_id))?;
        let execution = exec_entry.value_mut();
        let mut instance_entry = self
            .store
            .job_instances
            .get_mut(&execution.instance_id)
            .ok_or(BatchError::NoSuchJobInstance(execution.instance_id))?;
        let instance = instance_entry.value_mut();

        verify_status_transition(execution_id, execution.batch_status, status)?;

        execution.batch_status = status;
        execution.last_updated_time = update_time;
        instance.batch_status = status;
        instance.last_updated_time = update_time;
        Ok(execution.clone())
    }

    async fn update_job_execution_and_instance_on_stop_before_server_assigned(
        &self,
        execution_id: i64,
        update_time: NaiveDateTime,
    ) -> Result<JobExecution> {
        let mut exec_entry = self
            .store
            .job_executions
            .get_mut(&execution_id)
            .ok_or(BatchError::NoSuchJobExecution(execution_id))?;
        let execution = exec_entry.value_mut();
        let mut instance_entry = self
            .store
            .job_instances
            .get_mut(&execution.instance_id)
            .ok_or(BatchError::NoSuchJobInstance(execution.instance_id))?;
        let instance = instance_entry.value_mut();

        verify_status_transition(execution_id, execution.batch_status, BatchStatus::Stopped)?;
        verify_state_transition(
            instance.instance_id,
            instance.instance_state,
            InstanceState::Stopped,
        )?;

        if instance.instance_state == InstanceState::Stopped {
            debug!(instance_id = instance.instance_id, "instance already STOPPED");
            return Ok(execution.clone());
        }
        if !execution.server_not_assigned() {
            return Err(BatchError::ExecutionAssignedToServer(execution_id));
        }

        execution.batch_status = BatchStatus::Stopped;
        execution.last_updated_time = update_time;
        instance.batch_status = BatchStatus::Stopped;
        instance.instance_state = InstanceState::Stopped;
        instance.last_updated_time = update_time;
        Ok(execution.clone())
    }

    async fn update_job_execution_and_instance_on_end(
        &self,
        execution_id: i64,
        final_status: BatchStatus,
        exit_status: Option<&str>,
        end_time: NaiveDateTime,
    ) -> Result<JobExecution> {
        let mut exec_entry = self
            .store
            .job_executions
            .get_mut(&execution_id)
            .ok_or(BatchError::NoSuchJobExecution(execution_id))?;
        let execution = exec_entry.value_mut();
        let mut instance_entry = self
            .store
            .job_instances
            .get_mut(&execution.instance_id)
            .ok_or(BatchError::NoSuchJobInstance(execution.instance_id))?;
        let instance = instance_entry.value_mut();

        verify_status_transition(execution_id, execution.batch_status, final_status)?;

        // The instance state follows only for the "done" statuses.
        if let Some(new_state) = InstanceState::from_final_batch_status(final_status) {
            verify_state_transition(instance.instance_id, instance.instance_state, new_state)?;
            instance.instance_state = new_state;
        }

        execution.batch_status = final_status;
        execution.exit_status = exit_status.map(str::to_string);
        execution.end_time = Some(end_time);
        execution.last_updated_time = end_time;
        instance.batch_status = final_status;
        instance.exit_status = exit_status.map(str::to_string);
        instance.last_updated_time = end_time;
        Ok(execution.clone())
    }

    async fn update_job_execution_server_and_rest_url_for_starting_job(
        &self,
        execution_id: i64,
    ) -> Result<JobExecution> {
        let mut exec_entry = self
            .store
            .job_executions
            .get_mut(&execution_id)
            .ok_or(BatchError::NoSuchJobExecution(execution_id))?;
        let execution = exec_entry.value_mut();
        // Guarded by the STARTING condition; the execution may have been
        // stopped by the time dispatch reaches it.
        if execution.batch_status != BatchStatus::Starting {
            return Err(BatchError::JobStopped(execution_id));
        }
        execution.server_id = self.location.server_id().to_string();
        execution.rest_url = self.location.rest_url().to_string();
        Ok(execution.clone())
    }

    async fn update_job_execution_log_dir(
        &self,
        execution_id: i64,
        log_dir_path: &str,
    ) -> Result<JobExecution> {
        let mut exec_entry = self
            .store
            .job_executions
            .get_mut(&execution_id)
            .ok_or(BatchError::NoSuchJobExecution(execution_id))?;
        let execution = exec_entry.value_mut();
        execution.log_dir_path = Some(log_dir_path.to_string());
        Ok(execution.clone())
    }

    async fn create_top_level_step_execution_and_new_instance(
        &self,
        job_execution_id: i64,
        key: &StepThreadInstanceKey,
        is_partitioned: bool,
    ) -> Result<StepThreadExecution> {
        if !self.store.job_instances.contains_key(&key.job_instance_id) {
            return Err(BatchError::illegal_state(format!(
                "Didn't find job instance associated with step thread key value: {}",
                key.job_instance_id
            )));
        }
        if !self.store.job_executions.contains_key(&job_execution_id) {
            return Err(BatchError::illegal_state(format!(
                "Didn't find job execution associated with value: {job_execution_id}"
            )));
        }

        let step_execution_id = self.store.next_step_execution_id();
        let execution = StepThreadExecution::new_top_level(
            step_execution_id,
            job_execution_id,
            key.job_instance_id,
            key.step_name.clone(),
        );
        let instance =
            StepThreadInstance::new_top_level(key.clone(), step_execution_id, is_partitioned);
        self.store
            .step_executions
            .insert(step_execution_id, execution.clone());
        self.store.step_instances.insert(key.clone(), instance);
        Ok(execution)
    }

    async fn create_partition_step_execution_and_new_instance(
        &self,
        job_execution_id: i64,
        key: &StepThreadInstanceKey,
        is_remote_dispatch: bool,
    ) -> Result<StepThreadExecution> {
        if !self.store.job_instances.contains_key(&key.job_instance_id) {
            return Err(BatchError::illegal_state(format!(
                "Didn't find job instance associated with step thread key value: {}",
                key.job_instance_id
            )));
        }
        if !self.store.job_executions.contains_key(&job_execution_id) {
            return Err(BatchError::illegal_state(format!(
                "Didn't find job execution associated with value: {job_execution_id}"
            )));
        }
        let top_level = self.unique_top_level_execution(job_execution_id, &key.step_name)?;

        let step_execution_id = self.store.next_step_execution_id();
        let execution = StepThreadExecution::new_partition(
            step_execution_id,
            job_execution_id,
            key.job_instance_id,
            key.step_name.clone(),
            key.partition_number,
            top_level.step_execution_id,
        );
        let instance = StepThreadInstance::new_partition(key.clone(), step_execution_id);
        self.store
            .step_executions
            .insert(step_execution_id, execution.clone());
        self.store.step_instances.insert(key.clone(), instance);

        if is_remote_dispatch {
            self.consume_remotable_partition(job_execution_id, key, step_execution_id);
        }
        Ok(execution)
    }

    async fn create_top_level_step_execution_on_restart(
        &self,
        job_execution_id: i64,
        key: &StepThreadInstanceKey,
    ) -> Result<StepThreadExecution> {
        let execution = self.execution_snapshot(job_execution_id)?;
        let mut instance_entry = self.store.step_instances.get_mut(key).ok_or_else(|| {
            BatchError::illegal_state(format!("No step thread instance found for key = {key}"))
        })?;
        let instance = instance_entry.value_mut();
        let previous = self
            .store
            .step_executions
            .get(&instance.latest_execution_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                BatchError::illegal_state(format!(
                    "Latest step execution {} not found for key = {key}",
                    instance.latest_execution_id
                ))
            })?;

        let step_execution_id = self.store.next_step_execution_id();
        let fresh = StepThreadExecution::new_top_level(
            step_execution_id,
            job_execution_id,
            execution.instance_id,
            key.step_name.clone(),
        )
        .with_user_data_from(&previous);
        instance.increment_start_count();
        instance.latest_execution_id = step_execution_id;
        self.store
            .step_executions
            .insert(step_execution_id, fresh.clone());
        Ok(fresh)
    }

    async fn create_partition_step_execution_on_restart(
        &self,
        job_execution_id: i64,
        key: &StepThreadInstanceKey,
        is_remote_dispatch: bool,
    ) -> Result<StepThreadExecution> {
        let execution = self.execution_snapshot(job_execution_id)?;
        let top_level = self.unique_top_level_execution(job_execution_id, &key.step_name)?;
        let mut instance_entry = self.store.step_instances.get_mut(key).ok_or_else(|| {
            BatchError::illegal_state(format!("No step thread instance found for key = {key}"))
        })?;
        let instance = instance_entry.value_mut();
        let previous = self
            .store
            .step_executions
            .get(&instance.latest_execution_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                BatchError::illegal_state(format!(
                    "Latest step execution {} not found for key = {key}",
                    instance.latest_execution_id
                ))
            })?;

        let step_execution_id = self.store.next_step_execution_id();
        let fresh = StepThreadExecution::new_partition(
            step_execution_id,
            job_execution_id,
            execution.instance_id,
            key.step_name.clone(),
            key.partition_number,
            top_level.step_execution_id,
        )
        .with_user_data_from(&previous);
        instance.latest_execution_id = step_execution_id;
        self.store
            .step_executions
            .insert(step_execution_id, fresh.clone());
        drop(instance_entry);

        if is_remote_dispatch {
            self.consume_remotable_partition(job_execution_id, key, step_execution_id);
        }
        Ok(fresh)
    }

    async fn create_top_level_step_execution_on_restart_and_clean(
        &self,
        job_execution_id: i64,
        key: &StepThreadInstanceKey,
    ) -> Result<StepThreadExecution> {
        let execution = self.execution_snapshot(job_execution_id)?;
        let mut instance_entry = self.store.step_instances.get_mut(key).ok_or_else(|| {
            BatchError::illegal_state(format!("No step thread instance found for key = {key}"))
        })?;
        let instance = instance_entry.value_mut();

        let step_execution_id = self.store.next_step_execution_id();
        let fresh = StepThreadExecution::new_top_level(
            step_execution_id,
            job_execution_id,
            execution.instance_id,
            key.step_name.clone(),
        );
        instance.increment_start_count();
        instance.delete_checkpoint_data();
        instance.latest_execution_id = step_execution_id;
        self.store
            .step_executions
            .insert(step_execution_id, fresh.clone());
        Ok(fresh)
    }

    async fn get_step_thread_execution(
        &self,
        step_execution_id: i64,
    ) -> Result<StepThreadExecution> {
        self.store
            .step_executions
            .get(&step_execution_id)
            .map(|entry| entry.value().clone())
            .ok_or(BatchError::UnknownStepExecution(step_execution_id))
    }

    async fn get_step_thread_instance(
        &self,
        key: &StepThreadInstanceKey,
    ) -> Result<Option<StepThreadInstance>> {
        Ok(self
            .store
            .step_instances
            .get(key)
            .map(|entry| entry.value().clone()))
    }

    async fn get_completed_partition_numbers(
        &self,
        top_level_key: &StepThreadInstanceKey,
    ) -> Result<Vec<i32>> {
        let mut numbers: Vec<i32> = self
            .store
            .step_instances
            .iter()
            .filter(|entry| {
                let instance = entry.value();
                !instance.is_top_level()
                    && instance.key.job_instance_id == top_level_key.job_instance_id
                    && instance.key.step_name == top_level_key.step_name
            })
            .filter(|entry| {
                self.store
                    .step_executions
                    .get(&entry.value().latest_execution_id)
                    .map(|exec| exec.value().batch_status == BatchStatus::Completed)
                    .unwrap_or(false)
            })
            .map(|entry| entry.value().key.partition_number)
            .collect();
        numbers.sort_unstable();
        Ok(numbers)
    }

    async fn update_step_thread_instance_checkpoint(
        &self,
        key: &StepThreadInstanceKey,
        checkpoint_data: Option<Vec<u8>>,
    ) -> Result<StepThreadInstance> {
        let mut entry = self.store.step_instances.get_mut(key).ok_or_else(|| {
            BatchError::illegal_state(format!("No step thread instance found for key = {key}"))
        })?;
        let instance = entry.value_mut();
        instance.checkpoint_data = checkpoint_data;
        Ok(instance.clone())
    }

    async fn update_partition_plan_size(
        &self,
        top_level_key: &StepThreadInstanceKey,
        plan_size: i32,
    ) -> Result<StepThreadInstance> {
        let mut entry = self.store.step_instances.get_mut(top_level_key).ok_or_else(|| {
            BatchError::illegal_state(format!(
                "No step thread instance found for key = {top_level_key}"
            ))
        })?;
        let instance = entry.value_mut();
        instance.partition_plan_size = Some(plan_size);
        Ok(instance.clone())
    }

    async fn delete_partition_step_thread_instances(
        &self,
        top_level_key: &StepThreadInstanceKey,
    ) -> Result<()> {
        self.store.step_instances.retain(|key, _| {
            !(key.job_instance_id == top_level_key.job_instance_id
                && key.step_name == top_level_key.step_name
                && key.partition_number != crate::models::TOP_LEVEL_PARTITION_NUMBER)
        });
        Ok(())
    }

    async fn update_step_execution(
        &self,
        snapshot: &RuntimeStepSnapshot,
    ) -> Result<StepThreadExecution> {
        let mut entry = self
            .store
            .step_executions
            .get_mut(&snapshot.step_execution_id)
            .ok_or_else(|| {
                BatchError::illegal_state(format!(
                    "Step thread execution with id = {} should be persisted at this point",
                    snapshot.step_execution_id
                ))
            })?;
        let execution = entry.value_mut();
        Self::apply_snapshot(execution, snapshot)?;
        Ok(execution.clone())
    }

    async fn update_top_level_step_execution_with_partition_aggregate(
        &self,
        snapshot: &RuntimeStepSnapshot,
    ) -> Result<StepThreadExecution> {
        let partitions = self.partition_executions_of(snapshot.step_execution_id);
        let mut entry = self
            .store
            .step_executions
            .get_mut(&snapshot.step_execution_id)
            .ok_or_else(|| {
                BatchError::illegal_state(format!(
                    "Step thread execution with id = {} should be persisted at this point",
                    snapshot.step_execution_id
                ))
            })?;
        let execution = entry.value_mut();
        if !execution.is_top_level {
            return Err(BatchError::illegal_state(format!(
                "Step thread execution {} is not a top-level execution",
                snapshot.step_execution_id
            )));
        }
        Self::apply_snapshot(execution, snapshot)?;
        for partition in &partitions {
            execution.metrics.add(&partition.metrics);
        }
        Ok(execution.clone())
    }

    async fn get_top_level_step_executions(
        &self,
        job_execution_id: i64,
    ) -> Result<Vec<StepThreadExecution>> {
        let mut executions: Vec<StepThreadExecution> = self
            .store
            .step_executions
            .iter()
            .filter(|entry| {
                let exec = entry.value();
                exec.job_execution_id == job_execution_id && exec.is_top_level
            })
            .map(|entry| entry.value().clone())
            .collect();
        if executions.is_empty() {
            // Unknown execution id should fail, an execution without steps
            // should not.
            self.execution_snapshot(job_execution_id)?;
        }
        executions.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then(a.step_execution_id.cmp(&b.step_execution_id))
        });
        Ok(executions)
    }

    async fn create_remotable_partition(
        &self,
        key: RemotablePartitionKey,
    ) -> Result<Option<RemotablePartition>> {
        if !self
            .store
            .job_executions
            .contains_key(&key.job_execution_id)
        {
            return Err(BatchError::illegal_state(format!(
                "Didn't find job execution associated with value: {}",
                key.job_execution_id
            )));
        }
        let partition = RemotablePartition::queued(key.clone(), Utc::now().naive_utc());
        self.store
            .remotable_partitions
            .insert(key, partition.clone());
        Ok(Some(partition))
    }

    async fn update_remotable_partition_log_dir(
        &self,
        key: &RemotablePartitionKey,
        log_dir_path: &str,
    ) -> Result<Option<RemotablePartition>> {
        match self.store.remotable_partitions.get_mut(key) {
            Some(mut entry) => {
                let partition = entry.value_mut();
                partition.log_dir_path = Some(log_dir_path.to_string());
                Ok(Some(partition.clone()))
            }
            None => Ok(None),
        }
    }

    async fn get_remotable_partition_internal_state(
        &self,
        key: &RemotablePartitionKey,
    ) -> Result<Option<RemotablePartitionState>> {
        Ok(self
            .store
            .remotable_partitions
            .get(key)
            .map(|entry| entry.value().internal_state))
    }

    async fn get_recovered_partition_numbers(
        &self,
        top_level_step_execution_id: i64,
    ) -> Result<Vec<i32>> {
        let mut numbers: Vec<i32> = self
            .store
            .remotable_partitions
            .iter()
            .filter(|entry| {
                entry.value().internal_state == RemotablePartitionState::Recovered
                    && entry
                        .value()
                        .step_execution_id
                        .and_then(|id| self.store.step_executions.get(&id))
                        .map(|exec| {
                            exec.value().top_level_execution_id == Some(top_level_step_execution_id)
                        })
                        .unwrap_or(false)
            })
            .map(|entry| entry.value().key.partition_number)
            .collect();
        numbers.sort_unstable();
        Ok(numbers)
    }

    async fn get_remotable_partitions_for_job_execution(
        &self,
        job_execution_id: i64,
    ) -> Result<Option<Vec<RemotablePartition>>> {
        let mut partitions: Vec<RemotablePartition> = self
            .store
            .remotable_partitions
            .iter()
            .filter(|entry| entry.value().key.job_execution_id == job_execution_id)
            .map(|entry| entry.value().clone())
            .collect();
        partitions.sort_by(|a, b| {
            a.key
                .step_name
                .cmp(&b.key.step_name)
                .then(a.key.partition_number.cmp(&b.key.partition_number))
        });
        Ok(Some(partitions))
    }

    async fn get_step_execution_aggregate(
        &self,
        top_level_step_execution_id: i64,
    ) -> Result<StepThreadExecutionAggregate> {
        let top_level = self
            .store
            .step_executions
            .get(&top_level_step_execution_id)
            .map(|entry| entry.value().clone())
            .ok_or(BatchError::UnknownStepExecution(top_level_step_execution_id))?;
        if !top_level.is_top_level {
            return Err(BatchError::illegal_state(format!(
                "Didn't find top-level step thread execution at id: {top_level_step_execution_id}"
            )));
        }
        Ok(self.aggregate_for(top_level))
    }

    async fn get_step_execution_aggregate_from_job_execution(
        &self,
        job_execution_id: i64,
        step_name: &str,
    ) -> Result<StepThreadExecutionAggregate> {
        let top_level = self.unique_top_level_execution(job_execution_id, step_name)?;
        Ok(self.aggregate_for(top_level))
    }

    async fn get_step_execution_aggregate_from_job_exec_num(
        &self,
        instance_id: i64,
        exec_num: i32,
        step_name: &str,
    ) -> Result<StepThreadExecutionAggregate> {
        let execution = self
            .get_job_execution_from_job_exec_num(instance_id, exec_num)
            .await?;
        self.get_step_execution_aggregate_from_job_execution(execution.execution_id, step_name)
            .await
    }

    fn schema_versions(&self) -> SchemaVersions {
        SchemaVersions::MAX
    }
}

#[async_trait]
impl RecoveryStore for MemoryPersistence {
    async fn get_job_executions_running_on_server(
        &self,
        server_id: &str,
    ) -> Result<Vec<JobExecution>> {
        let mut executions: Vec<JobExecution> = self
            .store
            .job_executions
            .iter()
            .filter(|entry| {
                let exec = entry.value();
                exec.batch_status.is_running() && exec.server_id == server_id
            })
            .map(|entry| entry.value().clone())
            .collect();
        executions.sort_by_key(|exec| exec.execution_id);
        Ok(executions)
    }

    async fn get_step_thread_executions_running(
        &self,
        job_execution_id: i64,
    ) -> Result<Vec<StepThreadExecution>> {
        let mut executions: Vec<StepThreadExecution> = self
            .store
            .step_executions
            .iter()
            .filter(|entry| {
                let exec = entry.value();
                exec.job_execution_id == job_execution_id && exec.batch_status.is_running()
            })
            .map(|entry| entry.value().clone())
            .collect();
        executions.sort_by_key(|exec| exec.step_execution_id);
        Ok(executions)
    }

    async fn update_step_execution_on_recovery(
        &self,
        step_execution_id: i64,
        status: BatchStatus,
        exit_status: Option<&str>,
        end_time: NaiveDateTime,
    ) -> Result<StepThreadExecution> {
        let mut entry = self
            .store
            .step_executions
            .get_mut(&step_execution_id)
            .ok_or(BatchError::UnknownStepExecution(step_execution_id))?;
        let execution = entry.value_mut();
        verify_status_transition(step_execution_id, execution.batch_status, status)?;
        execution.batch_status = status;
        execution.exit_status = exit_status.map(str::to_string);
        execution.end_time = Some(end_time);
        Ok(execution.clone())
    }

    async fn finalize_job_execution_on_recovery(
        &self,
        execution_id: i64,
        status: BatchStatus,
        exit_status: Option<&str>,
        end_time: NaiveDateTime,
    ) -> Result<JobExecution> {
        self.update_job_execution_and_instance_on_end(execution_id, status, exit_status, end_time)
            .await
    }

    async fn get_remotable_partitions_running_on_server(
        &self,
        server_id: &str,
    ) -> Result<Vec<RemotablePartition>> {
        let mut partitions: Vec<RemotablePartition> = self
            .store
            .remotable_partitions
            .iter()
            .filter(|entry| {
                let partition = entry.value();
                partition.server_id == server_id
                    && partition
                        .step_execution_id
                        .and_then(|id| self.store.step_executions.get(&id))
                        .map(|exec| exec.value().batch_status.is_running())
                        .unwrap_or(false)
            })
            .map(|entry| entry.value().clone())
            .collect();
        partitions.sort_by(|a, b| {
            a.key
                .job_execution_id
                .cmp(&b.key.job_execution_id)
                .then(a.key.step_name.cmp(&b.key.step_name))
                .then(a.key.partition_number.cmp(&b.key.partition_number))
        });
        Ok(partitions)
    }

    async fn update_remotable_partition_on_recovery(
        &self,
        key: &RemotablePartitionKey,
        now: NaiveDateTime,
    ) -> Result<RemotablePartition> {
        let mut entry = self.store.remotable_partitions.get_mut(key).ok_or_else(|| {
            BatchError::illegal_state(format!("No remotable partition found for key = {key}"))
        })?;
        let partition = entry.value_mut();
        partition.internal_state = RemotablePartitionState::Recovered;
        partition.last_updated = now;
        Ok(partition.clone())
    }
}
