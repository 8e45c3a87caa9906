//! # Durable Persistence Backend
//!
//! PostgreSQL-backed implementation of the persistence contract.
//!
//! Every mutating operation runs inside its own transaction: the public
//! method owns the begin/commit boundary and internal helpers take the open
//! transaction explicitly, so join-versus-new is always a visible choice at
//! the call site. A failed operation rolls back (the transaction drops) and
//! the error surfaces once, carrying the original cause.
//!
//! Activation happens lazily on first use or eagerly via [`SqlPersistence::activate`]:
//! schema versions are detected once (see [`schema`]) and startup recovery
//! runs to completion before any request is served. Both are guarded so
//! concurrent first callers wait rather than re-run them.

pub mod rows;
pub mod schema;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::BatchCoreConfig;
use crate::error::{BatchError, Result};
use crate::location::BatchLocation;
use crate::models::{
    BatchStatus, InstanceState, JobExecution, JobInstance, NewJobInstance, PartitionStepAggregate,
    RemotablePartition, RemotablePartitionKey, RemotablePartitionState, RuntimeStepSnapshot,
    StepThreadExecutionAggregate, StepThreadExecution, StepThreadInstance, StepThreadInstanceKey,
};
use crate::state_machine::{verify_state_transition, verify_status_transition};

use super::recovery::StartupRecovery;
use super::{PersistenceService, RecoveryStore, SchemaVersions};

use rows::{
    execution_columns, instance_columns, partition_columns, step_execution_columns,
    JobExecutionRow, JobInstanceRow, RemotablePartitionRow, StepThreadExecutionRow,
    StepThreadInstanceRow, STEP_INSTANCE_COLUMNS,
};
use schema::{detect_schema_versions, is_missing_schema_error, ProbeOutcome, SchemaProbes};

const RUNNING_STATUSES_SQL: &str = "('STARTING', 'STARTED', 'STOPPING')";

/// Durable implementation of [`PersistenceService`] over a PostgreSQL pool.
pub struct SqlPersistence {
    pool: PgPool,
    location: Arc<dyn BatchLocation>,
    versions: std::sync::OnceLock<SchemaVersions>,
    activated: OnceCell<()>,
}

struct PoolProbes<'a> {
    pool: &'a PgPool,
}

impl PoolProbes<'_> {
    async fn probe(&self, sql: &str) -> Result<ProbeOutcome> {
        match sqlx::query(sql).fetch_one(self.pool).await {
            Ok(_) => Ok(ProbeOutcome::Present),
            Err(err) if is_missing_schema_error(&err) => Ok(ProbeOutcome::Missing),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl SchemaProbes for PoolProbes<'_> {
    async fn remotable_partition_table(&self) -> Result<ProbeOutcome> {
        self.probe("SELECT COUNT(*) FROM remotable_partition").await
    }

    async fn instance_group_names(&self) -> Result<ProbeOutcome> {
        self.probe("SELECT COUNT(group_names) FROM job_instance").await
    }

    async fn instance_update_time(&self) -> Result<ProbeOutcome> {
        self.probe("SELECT COUNT(last_updated_time) FROM job_instance").await
    }

    async fn execution_job_parameters(&self) -> Result<ProbeOutcome> {
        self.probe("SELECT COUNT(job_parameters) FROM job_execution").await
    }
}

impl SqlPersistence {
    pub fn new(pool: PgPool, location: Arc<dyn BatchLocation>) -> Self {
        Self {
            pool,
            location,
            versions: std::sync::OnceLock::new(),
            activated: OnceCell::new(),
        }
    }

    /// Connect a pool from configuration.
    pub async fn connect(
        config: &BatchCoreConfig,
        location: Arc<dyn BatchLocation>,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await?;
        Ok(Self::new(pool, location))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Detect schema versions and run startup recovery, exactly once.
    /// Every operation calls this; it is also safe to call eagerly.
    pub async fn activate(&self) -> Result<SchemaVersions> {
        self.activated
            .get_or_try_init(|| async {
                let detected = detect_schema_versions(&PoolProbes { pool: &self.pool }).await?;
                // Publish for the recovery queries below; external callers
                // are still held off by this init block.
                let _ = self.versions.set(detected);
                info!(
                    instance = detected.instance,
                    execution = detected.execution,
                    partition = detected.partition,
                    "durable persistence activated"
                );
                StartupRecovery::new(self.location.server_id())
                    .recover(self)
                    .await?;
                Ok::<(), BatchError>(())
            })
            .await?;
        self.versions.get().copied().ok_or_else(|| {
            BatchError::illegal_state("Schema versions unset after activation".to_string())
        })
    }

    fn current_versions(&self) -> SchemaVersions {
        self.versions.get().copied().unwrap_or(SchemaVersions::MAX)
    }

    //
    // Row fetch helpers. Each takes any executor so callers decide whether
    // the read joins an open transaction.
    //

    async fn fetch_instance<'e, E>(
        &self,
        executor: E,
        versions: SchemaVersions,
        instance_id: i64,
        for_update: bool,
    ) -> Result<Option<JobInstance>>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let cols = instance_columns(
            "",
            versions.supports_update_time(),
            versions.supports_group_names(),
        );
        let lock = if for_update { " FOR UPDATE" } else { "" };
        let sql = format!("SELECT {cols} FROM job_instance WHERE instance_id = $1{lock}");
        let row = sqlx::query_as::<_, JobInstanceRow>(&sql)
            .bind(instance_id)
            .fetch_optional(executor)
            .await?;
        row.map(JobInstance::try_from).transpose()
    }

    async fn fetch_execution<'e, E>(
        &self,
        executor: E,
        versions: SchemaVersions,
        execution_id: i64,
        for_update: bool,
    ) -> Result<Option<JobExecution>>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let cols = execution_columns("", versions.supports_job_parameters());
        let lock = if for_update { " FOR UPDATE" } else { "" };
        let sql = format!("SELECT {cols} FROM job_execution WHERE execution_id = $1{lock}");
        let row = sqlx::query_as::<_, JobExecutionRow>(&sql)
            .bind(execution_id)
            .fetch_optional(executor)
            .await?;
        row.map(JobExecution::try_from).transpose()
    }

    async fn fetch_step_execution<'e, E>(
        &self,
        executor: E,
        step_execution_id: i64,
        for_update: bool,
    ) -> Result<Option<StepThreadExecution>>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let cols = step_execution_columns("");
        let lock = if for_update { " FOR UPDATE" } else { "" };
        let sql =
            format!("SELECT {cols} FROM step_thread_execution WHERE step_execution_id = $1{lock}");
        let row = sqlx::query_as::<_, StepThreadExecutionRow>(&sql)
            .bind(step_execution_id)
            .fetch_optional(executor)
            .await?;
        row.map(StepThreadExecution::try_from).transpose()
    }

    async fn fetch_step_instance<'e, E>(
        &self,
        executor: E,
        key: &StepThreadInstanceKey,
        for_update: bool,
    ) -> Result<Option<StepThreadInstance>>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let lock = if for_update { " FOR UPDATE" } else { "" };
        let sql = format!(
            "SELECT {STEP_INSTANCE_COLUMNS} FROM step_thread_instance \
             WHERE job_instance_id = $1 AND step_name = $2 AND partition_number = $3{lock}"
        );
        let row = sqlx::query_as::<_, StepThreadInstanceRow>(&sql)
            .bind(key.job_instance_id)
            .bind(&key.step_name)
            .bind(key.partition_number)
            .fetch_optional(executor)
            .await?;
        Ok(row.map(StepThreadInstance::from))
    }

    async fn instance_or_not_found(
        &self,
        versions: SchemaVersions,
        instance_id: i64,
    ) -> Result<JobInstance> {
        self.fetch_instance(&self.pool, versions, instance_id, false)
            .await?
            .ok_or(BatchError::NoSuchJobInstance(instance_id))
    }

    async fn execution_or_not_found(
        &self,
        versions: SchemaVersions,
        execution_id: i64,
    ) -> Result<JobExecution> {
        self.fetch_execution(&self.pool, versions, execution_id, false)
            .await?
            .ok_or(BatchError::NoSuchJobExecution(execution_id))
    }

    async fn query_instances(
        &self,
        versions: SchemaVersions,
        where_clause: &str,
        binds: &[&str],
        offset: i64,
        limit: i64,
    ) -> Result<Vec<JobInstance>> {
        let cols = instance_columns(
            "",
            versions.supports_update_time(),
            versions.supports_group_names(),
        );
        let sql = format!(
            "SELECT {cols} FROM job_instance {where_clause} \
             ORDER BY create_time DESC, instance_id DESC OFFSET {offset} LIMIT {limit}"
        );
        let mut query = sqlx::query_as::<_, JobInstanceRow>(&sql);
        for bind in binds {
            query = query.bind(bind.to_string());
        }
        let instance_rows = query.fetch_all(&self.pool).await?;
        instance_rows.into_iter().map(JobInstance::try_from).collect()
    }

    /// Update an instance's state/status columns, appending the update
    /// timestamp only when the schema carries it.
    async fn write_instance_state(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        versions: SchemaVersions,
        instance_id: i64,
        state: InstanceState,
        status: Option<BatchStatus>,
        last_updated: NaiveDateTime,
    ) -> Result<JobInstance> {
        let cols = instance_columns(
            "",
            versions.supports_update_time(),
            versions.supports_group_names(),
        );
        let status_set = if status.is_some() {
            ", batch_status = $3"
        } else {
            ""
        };
        let updated_set = if versions.supports_update_time() {
            if status.is_some() {
                ", last_updated_time = $4"
            } else {
                ", last_updated_time = $3"
            }
        } else {
            ""
        };
        let sql = format!(
            "UPDATE job_instance SET instance_state = $2{status_set}{updated_set} \
             WHERE instance_id = $1 RETURNING {cols}"
        );
        let mut query = sqlx::query_as::<_, JobInstanceRow>(&sql)
            .bind(instance_id)
            .bind(state.to_string());
        if let Some(status) = status {
            query = query.bind(status.to_string());
        }
        if versions.supports_update_time() {
            query = query.bind(last_updated);
        }
        let row = query.fetch_one(&mut **tx).await?;
        JobInstance::try_from(row)
    }

    /// The unique top-level step execution for one job execution and step
    /// name. Zero or more than one is a fatal inconsistency.
    async fn unique_top_level_execution(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job_execution_id: i64,
        step_name: &str,
    ) -> Result<StepThreadExecution> {
        let cols = step_execution_columns("");
        let sql = format!(
            "SELECT {cols} FROM step_thread_execution \
             WHERE job_execution_id = $1 AND step_name = $2 AND is_top_level"
        );
        let step_rows = sqlx::query_as::<_, StepThreadExecutionRow>(&sql)
            .bind(job_execution_id)
            .bind(step_name)
            .fetch_all(&mut **tx)
            .await?;
        match step_rows.len() {
            1 => StepThreadExecution::try_from(step_rows.into_iter().next().ok_or_else(|| {
                BatchError::illegal_state("Top-level step execution row vanished".to_string())
            })?),
            0 => Err(BatchError::illegal_state(format!(
                "No top-level step execution found for job execution {job_execution_id}, step {step_name}"
            ))),
            n => Err(BatchError::illegal_state(format!(
                "Found {n} top-level step executions for job execution {job_execution_id}, step {step_name}"
            ))),
        }
    }

    async fn insert_step_execution(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        execution: &StepThreadExecution,
    ) -> Result<StepThreadExecution> {
        let cols = step_execution_columns("");
        let sql = format!(
            "INSERT INTO step_thread_execution \
             (job_execution_id, job_instance_id, step_name, partition_number, batch_status, \
              persistent_user_data, is_top_level, top_level_execution_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {cols}"
        );
        let row = sqlx::query_as::<_, StepThreadExecutionRow>(&sql)
            .bind(execution.job_execution_id)
            .bind(execution.job_instance_id)
            .bind(&execution.step_name)
            .bind(execution.partition_number)
            .bind(execution.batch_status.to_string())
            .bind(&execution.persistent_user_data)
            .bind(execution.is_top_level)
            .bind(execution.top_level_execution_id)
            .fetch_one(&mut **tx)
            .await?;
        StepThreadExecution::try_from(row)
    }

    async fn insert_step_instance(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        instance: &StepThreadInstance,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO step_thread_instance \
             (job_instance_id, step_name, partition_number, start_count, checkpoint_data, \
              latest_execution_id, partitioned, partition_plan_size) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(instance.key.job_instance_id)
        .bind(&instance.key.step_name)
        .bind(instance.key.partition_number)
        .bind(instance.start_count)
        .bind(&instance.checkpoint_data)
        .bind(instance.latest_execution_id)
        .bind(instance.partitioned)
        .bind(instance.partition_plan_size)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn require_job_links(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        versions: SchemaVersions,
        job_instance_id: i64,
        job_execution_id: i64,
    ) -> Result<JobExecution> {
        if self
            .fetch_instance(&mut **tx, versions, job_instance_id, false)
            .await?
            .is_none()
        {
            return Err(BatchError::illegal_state(format!(
                "Didn't find job instance associated with step thread key value: {job_instance_id}"
            )));
        }
        self.fetch_execution(&mut **tx, versions, job_execution_id, false)
            .await?
            .ok_or_else(|| {
                BatchError::illegal_state(format!(
                    "Didn't find job execution associated with value: {job_execution_id}"
                ))
            })
    }

    /// Stamp a queued dispatch record as consumed by this server, tolerating
    /// its absence (a down-level dispatcher never created one).
    async fn consume_remotable_partition(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        versions: SchemaVersions,
        job_execution_id: i64,
        key: &StepThreadInstanceKey,
        step_execution_id: i64,
    ) -> Result<()> {
        if !versions.supports_remotable_partitions() {
            return Ok(());
        }
        let updated = sqlx::query(
            "UPDATE remotable_partition \
             SET server_id = $4, rest_url = $5, step_execution_id = $6, \
                 internal_state = 'CONSUMED', last_updated = $7 \
             WHERE job_execution_id = $1 AND step_name = $2 AND partition_number = $3",
        )
        .bind(job_execution_id)
        .bind(&key.step_name)
        .bind(key.partition_number)
        .bind(self.location.server_id())
        .bind(self.location.rest_url())
        .bind(step_execution_id)
        .bind(Utc::now().naive_utc())
        .execute(&mut **tx)
        .await?
        .rows_affected();
        if updated == 0 {
            debug!(
                job_execution_id,
                step_name = %key.step_name,
                partition_number = key.partition_number,
                "no remotable partition to consume; dispatcher may be down-level"
            );
        }
        Ok(())
    }

    /// Persist a snapshot's status, timestamps, user data, and metrics onto
    /// an already-locked step execution row.
    async fn write_snapshot(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        current: &StepThreadExecution,
        snapshot: &RuntimeStepSnapshot,
        extra_metrics: Option<crate::models::StepMetrics>,
    ) -> Result<StepThreadExecution> {
        verify_status_transition(
            current.step_execution_id,
            current.batch_status,
            snapshot.batch_status,
        )?;
        let mut metrics = snapshot.metrics();
        if let Some(extra) = extra_metrics {
            metrics.add(&extra);
        }
        let cols = step_execution_columns("");
        let sql = format!(
            "UPDATE step_thread_execution \
             SET batch_status = $2, exit_status = $3, start_time = $4, end_time = $5, \
                 persistent_user_data = $6, read_count = $7, write_count = $8, \
                 commit_count = $9, rollback_count = $10, read_skip_count = $11, \
                 write_skip_count = $12 \
             WHERE step_execution_id = $1 RETURNING {cols}"
        );
        let row = sqlx::query_as::<_, StepThreadExecutionRow>(&sql)
            .bind(current.step_execution_id)
            .bind(snapshot.batch_status.to_string())
            .bind(&snapshot.exit_status)
            .bind(snapshot.start_time)
            .bind(snapshot.end_time)
            .bind(&snapshot.persistent_user_data)
            .bind(metrics.read_count)
            .bind(metrics.write_count)
            .bind(metrics.commit_count)
            .bind(metrics.rollback_count)
            .bind(metrics.read_skip_count)
            .bind(metrics.write_skip_count)
            .fetch_one(&mut **tx)
            .await?;
        StepThreadExecution::try_from(row)
    }

    /// Shared final-status write for the on-end operation and recovery.
    async fn finalize_execution_and_instance(
        &self,
        versions: SchemaVersions,
        execution_id: i64,
        final_status: BatchStatus,
        exit_status: Option<&str>,
        end_time: NaiveDateTime,
    ) -> Result<JobExecution> {
        let mut tx = self.pool.begin().await?;
        let execution = self
            .fetch_execution(&mut *tx, versions, execution_id, true)
            .await?
            .ok_or(BatchError::NoSuchJobExecution(execution_id))?;
        let instance = self
            .fetch_instance(&mut *tx, versions, execution.instance_id, true)
            .await?
            .ok_or(BatchError::NoSuchJobInstance(execution.instance_id))?;

        verify_status_transition(execution_id, execution.batch_status, final_status)?;
        let new_state = InstanceState::from_final_batch_status(final_status);
        if let Some(state) = new_state {
            verify_state_transition(instance.instance_id, instance.instance_state, state)?;
        }

        let cols = execution_columns("", versions.supports_job_parameters());
        let sql = format!(
            "UPDATE job_execution \
             SET batch_status = $2, exit_status = $3, end_time = $4, last_updated_time = $4 \
             WHERE execution_id = $1 RETURNING {cols}"
        );
        let row = sqlx::query_as::<_, JobExecutionRow>(&sql)
            .bind(execution_id)
            .bind(final_status.to_string())
            .bind(exit_status)
            .bind(end_time)
            .fetch_one(&mut *tx)
            .await?;

        // Writing the unchanged state back is harmless when the final status
        // has no matching instance state.
        let instance_state = new_state.unwrap_or(instance.instance_state);
        let updated_set = if versions.supports_update_time() {
            ", last_updated_time = $5"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE job_instance \
             SET batch_status = $2, exit_status = $3, instance_state = $4{updated_set} \
             WHERE instance_id = $1"
        );
        let mut query = sqlx::query(&sql)
            .bind(instance.instance_id)
            .bind(final_status.to_string())
            .bind(exit_status)
            .bind(instance_state.to_string());
        if versions.supports_update_time() {
            query = query.bind(end_time);
        }
        query.execute(&mut *tx).await?;

        tx.commit().await?;
        JobExecution::try_from(row)
    }

    async fn aggregate_for(
        &self,
        versions: SchemaVersions,
        top_level: StepThreadExecution,
    ) -> Result<StepThreadExecutionAggregate> {
        let cols = step_execution_columns("");
        let sql = format!(
            "SELECT {cols} FROM step_thread_execution \
             WHERE top_level_execution_id = $1 ORDER BY partition_number ASC"
        );
        let partition_rows = sqlx::query_as::<_, StepThreadExecutionRow>(&sql)
            .bind(top_level.step_execution_id)
            .fetch_all(&self.pool)
            .await?;

        let mut dispatch_records = std::collections::HashMap::new();
        if versions.supports_remotable_partitions() {
            let cols = partition_columns("");
            let sql = format!(
                "SELECT {cols} FROM remotable_partition \
                 WHERE job_execution_id = $1 AND step_name = $2"
            );
            let remotable_rows = sqlx::query_as::<_, RemotablePartitionRow>(&sql)
                .bind(top_level.job_execution_id)
                .bind(&top_level.step_name)
                .fetch_all(&self.pool)
                .await?;
            for row in remotable_rows {
                let partition = RemotablePartition::try_from(row)?;
                dispatch_records.insert(partition.key.partition_number, partition);
            }
        }

        let mut partitions = Vec::with_capacity(partition_rows.len());
        for row in partition_rows {
            let execution = StepThreadExecution::try_from(row)?;
            let remotable_partition = dispatch_records.remove(&execution.partition_number);
            partitions.push(PartitionStepAggregate {
                execution,
                remotable_partition,
            });
        }
        Ok(StepThreadExecutionAggregate {
            top_level,
            partitions,
        })
    }
}

#[async_trait]
impl PersistenceService for SqlPersistence {
    async fn create_job_instance(&self, new: NewJobInstance) -> Result<JobInstance> {
        let versions = self.activate().await?;
        let cols = instance_columns(
            "",
            versions.supports_update_time(),
            versions.supports_group_names(),
        );
        let updated_col = if versions.supports_update_time() {
            ", last_updated_time"
        } else {
            ""
        };
        let updated_val = if versions.supports_update_time() {
            ", $5"
        } else {
            ""
        };
        let sql = format!(
            "INSERT INTO job_instance \
             (job_name, job_xml_name, job_xml, submitter, create_time, num_executions, \
              instance_state, batch_status{updated_col}) \
             VALUES ($1, $2, $3, $4, $5, 0, 'SUBMITTED', 'STARTING'{updated_val}) \
             RETURNING {cols}"
        );
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, JobInstanceRow>(&sql)
            .bind(&new.job_name)
            .bind(&new.job_xml_name)
            .bind(&new.job_xml)
            .bind(&new.submitter)
            .bind(new.create_time)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        let instance = JobInstance::try_from(row)?;
        debug!(instance_id = instance.instance_id, job_name = %instance.job_name, "created job instance");
        Ok(instance)
    }

    async fn get_job_instance(&self, instance_id: i64) -> Result<JobInstance> {
        let versions = self.activate().await?;
        self.instance_or_not_found(versions, instance_id).await
    }

    async fn get_job_instance_from_execution_id(&self, execution_id: i64) -> Result<JobInstance> {
        let versions = self.activate().await?;
        let cols = instance_columns(
            "i.",
            versions.supports_update_time(),
            versions.supports_group_names(),
        );
        let sql = format!(
            "SELECT {cols} FROM job_instance i \
             JOIN job_execution e ON e.instance_id = i.instance_id \
             WHERE e.execution_id = $1"
        );
        let row = sqlx::query_as::<_, JobInstanceRow>(&sql)
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BatchError::NoSuchJobExecution(execution_id))?;
        JobInstance::try_from(row)
    }

    async fn get_job_instances(
        &self,
        job_name: &str,
        start: usize,
        count: usize,
    ) -> Result<Vec<JobInstance>> {
        let versions = self.activate().await?;
        self.query_instances(
            versions,
            "WHERE job_name = $1",
            &[job_name],
            start as i64,
            count as i64,
        )
        .await
    }

    async fn get_job_instances_for_submitter(
        &self,
        job_name: &str,
        submitter: &str,
        start: usize,
        count: usize,
    ) -> Result<Vec<JobInstance>> {
        let versions = self.activate().await?;
        self.query_instances(
            versions,
            "WHERE job_name = $1 AND submitter = $2",
            &[job_name, submitter],
            start as i64,
            count as i64,
        )
        .await
    }

    async fn get_job_instances_page(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<JobInstance>> {
        let versions = self.activate().await?;
        self.query_instances(
            versions,
            "",
            &[],
            (page * page_size) as i64,
            page_size as i64,
        )
        .await
    }

    async fn job_instance_count(&self, job_name: &str) -> Result<i64> {
        self.activate().await?;
        Ok(
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM job_instance WHERE job_name = $1")
                .bind(job_name)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    async fn job_instance_count_for_submitter(
        &self,
        job_name: &str,
        submitter: &str,
    ) -> Result<i64> {
        self.activate().await?;
        Ok(sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM job_instance WHERE job_name = $1 AND submitter = $2",
        )
        .bind(job_name)
        .bind(submitter)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn job_names_set(&self) -> Result<BTreeSet<String>> {
        self.activate().await?;
        let names =
            sqlx::query_scalar::<_, String>("SELECT DISTINCT job_name FROM job_instance")
                .fetch_all(&self.pool)
                .await?;
        Ok(names.into_iter().collect())
    }

    async fn job_names_set_for_submitter(&self, submitter: &str) -> Result<BTreeSet<String>> {
        self.activate().await?;
        let names = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT job_name FROM job_instance WHERE submitter = $1",
        )
        .bind(submitter)
        .fetch_all(&self.pool)
        .await?;
        Ok(names.into_iter().collect())
    }

    async fn update_job_instance_state(
        &self,
        instance_id: i64,
        state: InstanceState,
        last_updated: NaiveDateTime,
    ) -> Result<JobInstance> {
        let versions = self.activate().await?;
        let mut tx = self.pool.begin().await?;
        let instance = self
            .fetch_instance(&mut *tx, versions, instance_id, true)
            .await?
            .ok_or(BatchError::NoSuchJobInstance(instance_id))?;
        verify_state_transition(instance_id, instance.instance_state, state)?;
        let updated = self
            .write_instance_state(&mut tx, versions, instance_id, state, None, last_updated)
            .await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn update_job_instance_state_and_status(
        &self,
        instance_id: i64,
        state: InstanceState,
        status: BatchStatus,
        last_updated: NaiveDateTime,
    ) -> Result<JobInstance> {
        let versions = self.activate().await?;
        let mut tx = self.pool.begin().await?;
        let instance = self
            .fetch_instance(&mut *tx, versions, instance_id, true)
            .await?
            .ok_or(BatchError::NoSuchJobInstance(instance_id))?;
        // A state check is enough here; the status rides along.
        verify_state_transition(instance_id, instance.instance_state, state)?;
        let updated = self
            .write_instance_state(
                &mut tx,
                versions,
                instance_id,
                state,
                Some(status),
                last_updated,
            )
            .await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn update_job_instance_on_restart(
        &self,
        instance_id: i64,
        last_updated: NaiveDateTime,
    ) -> Result<JobInstance> {
        let versions = self.activate().await?;
        let mut tx = self.pool.begin().await?;
        let instance = self
            .fetch_instance(&mut *tx, versions, instance_id, true)
            .await?
            .ok_or(BatchError::NoSuchJobInstance(instance_id))?;
        verify_state_transition(instance_id, instance.instance_state, InstanceState::Submitted)?;
        verify_status_transition(instance_id, instance.batch_status, BatchStatus::Starting)?;

        let cols = instance_columns(
            "",
            versions.supports_update_time(),
            versions.supports_group_names(),
        );
        let updated_set = if versions.supports_update_time() {
            ", last_updated_time = $2"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE job_instance \
             SET instance_state = 'SUBMITTED', batch_status = 'STARTING'{updated_set} \
             WHERE instance_id = $1 AND instance_state IN ('STOPPED', 'FAILED') \
             RETURNING {cols}"
        );
        let mut query = sqlx::query_as::<_, JobInstanceRow>(&sql).bind(instance_id);
        if versions.supports_update_time() {
            query = query.bind(last_updated);
        }
        let row = query
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(BatchError::InstanceNotRestartable(instance_id))?;
        tx.commit().await?;
        JobInstance::try_from(row)
    }

    async fn update_job_instance_on_queued(&self, instance_id: i64) -> Result<JobInstance> {
        let versions = self.activate().await?;
        let mut tx = self.pool.begin().await?;
        let instance = self
            .fetch_instance(&mut *tx, versions, instance_id, true)
            .await?
            .ok_or(BatchError::NoSuchJobInstance(instance_id))?;
        verify_state_transition(instance_id, instance.instance_state, InstanceState::JmsQueued)?;

        let cols = instance_columns(
            "",
            versions.supports_update_time(),
            versions.supports_group_names(),
        );
        let updated_set = if versions.supports_update_time() {
            ", last_updated_time = $2"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE job_instance SET instance_state = 'JMS_QUEUED'{updated_set} \
             WHERE instance_id = $1 AND instance_state = 'SUBMITTED' RETURNING {cols}"
        );
        let mut query = sqlx::query_as::<_, JobInstanceRow>(&sql).bind(instance_id);
        if versions.supports_update_time() {
            query = query.bind(Utc::now().naive_utc());
        }
        let row = query.fetch_optional(&mut *tx).await?;
        tx.commit().await?;
        match row {
            Some(row) => JobInstance::try_from(row),
            // Not queued from SUBMITTED; leave the instance as it stands.
            None => Ok(instance),
        }
    }

    async fn update_job_instance_on_consumed(&self, instance_id: i64) -> Result<JobInstance> {
        let versions = self.activate().await?;
        let mut tx = self.pool.begin().await?;
        // Guarded by the queued-state condition rather than the validator.
        let cols = instance_columns(
            "",
            versions.supports_update_time(),
            versions.supports_group_names(),
        );
        let updated_set = if versions.supports_update_time() {
            ", last_updated_time = $2"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE job_instance SET instance_state = 'JMS_CONSUMED'{updated_set} \
             WHERE instance_id = $1 AND instance_state = 'JMS_QUEUED' RETURNING {cols}"
        );
        let mut query = sqlx::query_as::<_, JobInstanceRow>(&sql).bind(instance_id);
        if versions.supports_update_time() {
            query = query.bind(Utc::now().naive_utc());
        }
        let row = query.fetch_optional(&mut *tx).await?;
        tx.commit().await?;
        match row {
            Some(row) => JobInstance::try_from(row),
            None => {
                // Distinguish the benign race from a missing instance.
                self.instance_or_not_found(versions, instance_id).await?;
                Err(BatchError::JobInstanceNotQueued(instance_id))
            }
        }
    }

    async fn update_job_instance_restart_on(
        &self,
        instance_id: i64,
        restart_on: Option<&str>,
    ) -> Result<JobInstance> {
        let versions = self.activate().await?;
        let cols = instance_columns(
            "",
            versions.supports_update_time(),
            versions.supports_group_names(),
        );
        let sql = format!(
            "UPDATE job_instance SET restart_on = $2 WHERE instance_id = $1 RETURNING {cols}"
        );
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, JobInstanceRow>(&sql)
            .bind(instance_id)
            .bind(restart_on)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(BatchError::NoSuchJobInstance(instance_id))?;
        tx.commit().await?;
        JobInstance::try_from(row)
    }

    async fn update_job_instance_job_name_and_jsl(
        &self,
        instance_id: i64,
        job_name: &str,
        job_xml: &str,
    ) -> Result<JobInstance> {
        let versions = self.activate().await?;
        let cols = instance_columns(
            "",
            versions.supports_update_time(),
            versions.supports_group_names(),
        );
        let sql = format!(
            "UPDATE job_instance SET job_name = $2, job_xml = $3 \
             WHERE instance_id = $1 RETURNING {cols}"
        );
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, JobInstanceRow>(&sql)
            .bind(instance_id)
            .bind(job_name)
            .bind(job_xml)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(BatchError::NoSuchJobInstance(instance_id))?;
        tx.commit().await?;
        JobInstance::try_from(row)
    }

    async fn update_job_instance_group_names(
        &self,
        instance_id: i64,
        group_names: &BTreeSet<String>,
    ) -> Result<JobInstance> {
        let versions = self.activate().await?;
        if !versions.supports_group_names() {
            return Err(BatchError::illegal_state(
                "The backing schema does not support group names".to_string(),
            ));
        }
        let cols = instance_columns("", versions.supports_update_time(), true);
        let sql = format!(
            "UPDATE job_instance SET group_names = $2 WHERE instance_id = $1 RETURNING {cols}"
        );
        let names: Vec<String> = group_names.iter().cloned().collect();
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, JobInstanceRow>(&sql)
            .bind(instance_id)
            .bind(names)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(BatchError::NoSuchJobInstance(instance_id))?;
        tx.commit().await?;
        JobInstance::try_from(row)
    }

    async fn purge_job_instance(&self, instance_id: i64) -> Result<bool> {
        self.activate().await?;
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM job_instance WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(BatchError::NoSuchJobInstance(instance_id));
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn create_job_execution(
        &self,
        instance_id: i64,
        job_parameters: Option<serde_json::Value>,
        create_time: NaiveDateTime,
    ) -> Result<JobExecution> {
        let versions = self.activate().await?;
        let mut tx = self.pool.begin().await?;

        // The prior execution count is also the sequence number of this, the
        // next execution (numbering starts at 0).
        let new_count = sqlx::query_scalar::<_, i32>(
            "UPDATE job_instance SET num_executions = num_executions + 1 \
             WHERE instance_id = $1 RETURNING num_executions",
        )
        .bind(instance_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            BatchError::illegal_state(format!(
                "Didn't find job instance associated with value: {instance_id}"
            ))
        })?;
        let execution_num = new_count - 1;

        let cols = execution_columns("", versions.supports_job_parameters());
        let parameters_col = if versions.supports_job_parameters() {
            ", job_parameters"
        } else {
            ""
        };
        let parameters_val = if versions.supports_job_parameters() {
            ", $5"
        } else {
            ""
        };
        let sql = format!(
            "INSERT INTO job_execution \
             (instance_id, execution_num_for_instance, batch_status, create_time, \
              last_updated_time, rest_url{parameters_col}) \
             VALUES ($1, $2, 'STARTING', $3, $3, $4{parameters_val}) RETURNING {cols}"
        );
        let mut query = sqlx::query_as::<_, JobExecutionRow>(&sql)
            .bind(instance_id)
            .bind(execution_num)
            .bind(create_time)
            .bind(self.location.rest_url());
        if versions.supports_job_parameters() {
            query = query.bind(job_parameters);
        }
        let row = query.fetch_one(&mut *tx).await?;
        tx.commit().await?;
        let execution = JobExecution::try_from(row)?;
        debug!(
            execution_id = execution.execution_id,
            instance_id, execution_num, "created job execution"
        );
        Ok(execution)
    }

    async fn get_job_execution(&self, execution_id: i64) -> Result<JobExecution> {
        let versions = self.activate().await?;
        self.execution_or_not_found(versions, execution_id).await
    }

    async fn get_job_executions(&self, instance_id: i64) -> Result<Vec<JobExecution>> {
        let versions = self.activate().await?;
        let cols = execution_columns("", versions.supports_job_parameters());
        let sql = format!(
            "SELECT {cols} FROM job_execution WHERE instance_id = $1 \
             ORDER BY execution_num_for_instance DESC"
        );
        let execution_rows = sqlx::query_as::<_, JobExecutionRow>(&sql)
            .bind(instance_id)
            .fetch_all(&self.pool)
            .await?;
        if execution_rows.is_empty() {
            // Distinguish "unknown instance" from "no executions yet".
            self.instance_or_not_found(versions, instance_id).await?;
            return Ok(Vec::new());
        }
        execution_rows
            .into_iter()
            .map(JobExecution::try_from)
            .collect()
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
        let versions = self.activate().await?;
        let cols = execution_columns("", versions.supports_job_parameters());
        let sql = format!(
            "SELECT {cols} FROM job_execution \
             WHERE instance_id = $1 AND execution_num_for_instance = $2"
        );
        let execution_rows = sqlx::query_as::<_, JobExecutionRow>(&sql)
            .bind(instance_id)
            .bind(exec_num)
            .fetch_all(&self.pool)
            .await?;
        if execution_rows.len() > 1 {
            return Err(BatchError::illegal_state(format!(
                "Found more than one result for job instance {instance_id}, execution number {exec_num}"
            )));
        }
        match execution_rows.into_iter().next() {
            Some(row) => JobExecution::try_from(row),
            None => {
                self.instance_or_not_found(versions, instance_id).await?;
                Err(BatchError::illegal_state(format!(
                    "Didn't find any job execution entries at job instance id: {instance_id}, job execution number: {exec_num}"
                )))
            }
        }
    }

    async fn get_job_executions_running(&self, job_name: &str) -> Result<Vec<i64>> {
        self.activate().await?;
        let sql = format!(
            "SELECT e.execution_id FROM job_execution e \
             JOIN job_instance i ON i.instance_id = e.instance_id \
             WHERE i.job_name = $1 AND i.batch_status IN {RUNNING_STATUSES_SQL} \
             ORDER BY e.execution_id"
        );
        Ok(sqlx::query_scalar::<_, i64>(&sql)
            .bind(job_name)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn update_job_execution_and_instance_on_started(
        &self,
        execution_id: i64,
        started_time: NaiveDateTime,
    ) -> Result<JobExecution> {
        let versions = self.activate().await?;
        let mut tx = self.pool.begin().await?;
        let execution = self
            .fetch_execution(&mut *tx, versions, execution_id, true)
            .await?
            .ok_or(BatchError::NoSuchJobExecution(execution_id))?;
        let instance = self
            .fetch_instance(&mut *tx, versions, execution.instance_id, true)
            .await?
            .ok_or(BatchError::NoSuchJobInstance(execution.instance_id))?;

        verify_status_transition(execution_id, execution.batch_status, BatchStatus::Started)?;
        verify_state_transition(
            instance.instance_id,
            instance.instance_state,
            InstanceState::Dispatched,
        )?;

        let cols = execution_columns("", versions.supports_job_parameters());
        let sql = format!(
            "UPDATE job_execution \
             SET batch_status = 'STARTED', start_time = $2, last_updated_time = $2 \
             WHERE execution_id = $1 RETURNING {cols}"
        );
        let row = sqlx::query_as::<_, JobExecutionRow>(&sql)
            .bind(execution_id)
            .bind(started_time)
            .fetch_one(&mut *tx)
            .await?;
        self.write_instance_state(
            &mut tx,
            versions,
            instance.instance_id,
            InstanceState::Dispatched,
            Some(BatchStatus::Started),
            started_time,
        )
        .await?;
        tx.commit().await?;
        JobExecution::try_from(row)
    }

    async fn update_job_execution_and_instance_on_status_change(
        &self,
        execution_id: i64,
        status: BatchStatus,
        update_time: NaiveDateTime,
    ) -> Result<JobExecution> {
        let versions = self.activate().await?;
        let mut tx = self.pool.begin().await?;
        let execution = self
            .fetch_execution(&mut *tx, versions, execution_id, true)
            .await?
            .ok_or(BatchError::NoSuchJobExecution(execution_id))?;
        verify_status_transition(execution_id, execution.batch_status, status)?;

        let cols = execution_columns("", versions.supports_job_parameters());
        let sql = format!(
            "UPDATE job_execution SET batch_status = $2, last_updated_time = $3 \
             WHERE execution_id = $1 RETURNING {cols}"
        );
        let row = sqlx::query_as::<_, JobExecutionRow>(&sql)
            .bind(execution_id)
            .bind(status.to_string())
            .bind(update_time)
            .fetch_one(&mut *tx)
            .await?;

        let updated_set = if versions.supports_update_time() {
            ", last_updated_time = $3"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE job_instance SET batch_status = $2{updated_set} WHERE instance_id = $1"
        );
        let mut query = sqlx::query(&sql)
            .bind(execution.instance_id)
            .bind(status.to_string());
        if versions.supports_update_time() {
            query = query.bind(update_time);
        }
        query.execute(&mut *tx).await?;
        tx.commit().await?;
        JobExecution::try_from(row)
    }

    async fn update_job_execution_and_instance_on_stop_before_server_assigned(
        &self,
        execution_id: i64,
        update_time: NaiveDateTime,
    ) -> Result<JobExecution> {
        let versions = self.activate().await?;
        let mut tx = self.pool.begin().await?;
        let execution = self
            .fetch_execution(&mut *tx, versions, execution_id, true)
            .await?
            .ok_or(BatchError::NoSuchJobExecution(execution_id))?;
        let instance = self
            .fetch_instance(&mut *tx, versions, execution.instance_id, true)
            .await?
            .ok_or(BatchError::NoSuchJobInstance(execution.instance_id))?;

        verify_status_transition(execution_id, execution.batch_status, BatchStatus::Stopped)?;
        verify_state_transition(
            instance.instance_id,
            instance.instance_state,
            InstanceState::Stopped,
        )?;

        if instance.instance_state == InstanceState::Stopped {
            debug!(instance_id = instance.instance_id, "instance already STOPPED");
            return Ok(execution);
        }

        // The guard: only an execution no server has claimed may be stopped
        // through this path.
        let cols = execution_columns("", versions.supports_job_parameters());
        let sql = format!(
            "UPDATE job_execution SET batch_status = 'STOPPED', last_updated_time = $2 \
             WHERE execution_id = $1 AND server_id = '' RETURNING {cols}"
        );
        let row = sqlx::query_as::<_, JobExecutionRow>(&sql)
            .bind(execution_id)
            .bind(update_time)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(BatchError::ExecutionAssignedToServer(execution_id))?;

        self.write_instance_state(
            &mut tx,
            versions,
            instance.instance_id,
            InstanceState::Stopped,
            Some(BatchStatus::Stopped),
            update_time,
        )
        .await?;
        tx.commit().await?;
        JobExecution::try_from(row)
    }

    async fn update_job_execution_and_instance_on_end(
        &self,
        execution_id: i64,
        final_status: BatchStatus,
        exit_status: Option<&str>,
        end_time: NaiveDateTime,
    ) -> Result<JobExecution> {
        let versions = self.activate().await?;
        self.finalize_execution_and_instance(versions, execution_id, final_status, exit_status, end_time)
            .await
    }

    async fn update_job_execution_server_and_rest_url_for_starting_job(
        &self,
        execution_id: i64,
    ) -> Result<JobExecution> {
        let versions = self.activate().await?;
        let mut tx = self.pool.begin().await?;
        let cols = execution_columns("", versions.supports_job_parameters());
        let sql = format!(
            "UPDATE job_execution SET server_id = $2, rest_url = $3 \
             WHERE execution_id = $1 AND batch_status = 'STARTING' RETURNING {cols}"
        );
        let row = sqlx::query_as::<_, JobExecutionRow>(&sql)
            .bind(execution_id)
            .bind(self.location.server_id())
            .bind(self.location.rest_url())
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        match row {
            Some(row) => JobExecution::try_from(row),
            None => {
                // The execution may have been stopped by the time we reach
                // this update.
                self.execution_or_not_found(versions, execution_id).await?;
                Err(BatchError::JobStopped(execution_id))
            }
        }
    }

    async fn update_job_execution_log_dir(
        &self,
        execution_id: i64,
        log_dir_path: &str,
    ) -> Result<JobExecution> {
        let versions = self.activate().await?;
        let cols = execution_columns("", versions.supports_job_parameters());
        let sql = format!(
            "UPDATE job_execution SET log_dir_path = $2 WHERE execution_id = $1 RETURNING {cols}"
        );
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, JobExecutionRow>(&sql)
            .bind(execution_id)
            .bind(log_dir_path)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(BatchError::NoSuchJobExecution(execution_id))?;
        tx.commit().await?;
        JobExecution::try_from(row)
    }

    async fn create_top_level_step_execution_and_new_instance(
        &self,
        job_execution_id: i64,
        key: &StepThreadInstanceKey,
        is_partitioned: bool,
    ) -> Result<StepThreadExecution> {
        let versions = self.activate().await?;
        let mut tx = self.pool.begin().await?;
        self.require_job_links(&mut tx, versions, key.job_instance_id, job_execution_id)
            .await?;

        let execution = StepThreadExecution::new_top_level(
            0,
            job_execution_id,
            key.job_instance_id,
            key.step_name.clone(),
        );
        let execution = self.insert_step_execution(&mut tx, &execution).await?;
        let instance = StepThreadInstance::new_top_level(
            key.clone(),
            execution.step_execution_id,
            is_partitioned,
        );
        self.insert_step_instance(&mut tx, &instance).await?;
        tx.commit().await?;
        Ok(execution)
    }

    async fn create_partition_step_execution_and_new_instance(
        &self,
        job_execution_id: i64,
        key: &StepThreadInstanceKey,
        is_remote_dispatch: bool,
    ) -> Result<StepThreadExecution> {
        let versions = self.activate().await?;
        let mut tx = self.pool.begin().await?;
        self.require_job_links(&mut tx, versions, key.job_instance_id, job_execution_id)
            .await?;
        let top_level = self
            .unique_top_level_execution(&mut tx, job_execution_id, &key.step_name)
            .await?;

        let execution = StepThreadExecution::new_partition(
            0,
            job_execution_id,
            key.job_instance_id,
            key.step_name.clone(),
            key.partition_number,
            top_level.step_execution_id,
        );
        let execution = self.insert_step_execution(&mut tx, &execution).await?;
        let instance = StepThreadInstance::new_partition(key.clone(), execution.step_execution_id);
        self.insert_step_instance(&mut tx, &instance).await?;

        if is_remote_dispatch {
            self.consume_remotable_partition(
                &mut tx,
                versions,
                job_execution_id,
                key,
                execution.step_execution_id,
            )
            .await?;
        }
        tx.commit().await?;
        Ok(execution)
    }

    async fn create_top_level_step_execution_on_restart(
        &self,
        job_execution_id: i64,
        key: &StepThreadInstanceKey,
    ) -> Result<StepThreadExecution> {
        let versions = self.activate().await?;
        let mut tx = self.pool.begin().await?;
        let job_execution = self
            .fetch_execution(&mut *tx, versions, job_execution_id, false)
            .await?
            .ok_or(BatchError::NoSuchJobExecution(job_execution_id))?;
        let instance = self
            .fetch_step_instance(&mut *tx, key, true)
            .await?
            .ok_or_else(|| {
                BatchError::illegal_state(format!("No step thread instance found for key = {key}"))
            })?;
        let previous = self
            .fetch_step_execution(&mut *tx, instance.latest_execution_id, false)
            .await?
            .ok_or_else(|| {
                BatchError::illegal_state(format!(
                    "Latest step execution {} not found for key = {key}",
                    instance.latest_execution_id
                ))
            })?;

        let fresh = StepThreadExecution::new_top_level(
            0,
            job_execution_id,
            job_execution.instance_id,
            key.step_name.clone(),
        )
        .with_user_data_from(&previous);
        let fresh = self.insert_step_execution(&mut tx, &fresh).await?;
        sqlx::query(
            "UPDATE step_thread_instance \
             SET start_count = start_count + 1, latest_execution_id = $4 \
             WHERE job_instance_id = $1 AND step_name = $2 AND partition_number = $3",
        )
        .bind(key.job_instance_id)
        .bind(&key.step_name)
        .bind(key.partition_number)
        .bind(fresh.step_execution_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(fresh)
    }

    async fn create_partition_step_execution_on_restart(
        &self,
        job_execution_id: i64,
        key: &StepThreadInstanceKey,
        is_remote_dispatch: bool,
    ) -> Result<StepThreadExecution> {
        let versions = self.activate().await?;
        let mut tx = self.pool.begin().await?;
        let job_execution = self
            .fetch_execution(&mut *tx, versions, job_execution_id, false)
            .await?
            .ok_or(BatchError::NoSuchJobExecution(job_execution_id))?;
        let top_level = self
            .unique_top_level_execution(&mut tx, job_execution_id, &key.step_name)
            .await?;
        let instance = self
            .fetch_step_instance(&mut *tx, key, true)
            .await?
            .ok_or_else(|| {
                BatchError::illegal_state(format!("No step thread instance found for key = {key}"))
            })?;
        let previous = self
            .fetch_step_execution(&mut *tx, instance.latest_execution_id, false)
            .await?
            .ok_or_else(|| {
                BatchError::illegal_state(format!(
                    "Latest step execution {} not found for key = {key}",
                    instance.latest_execution_id
                ))
            })?;

        let fresh = StepThreadExecution::new_partition(
            0,
            job_execution_id,
            job_execution.instance_id,
            key.step_name.clone(),
            key.partition_number,
            top_level.step_execution_id,
        )
        .with_user_data_from(&previous);
        let fresh = self.insert_step_execution(&mut tx, &fresh).await?;
        sqlx::query(
            "UPDATE step_thread_instance SET latest_execution_id = $4 \
             WHERE job_instance_id = $1 AND step_name = $2 AND partition_number = $3",
        )
        .bind(key.job_instance_id)
        .bind(&key.step_name)
        .bind(key.partition_number)
        .bind(fresh.step_execution_id)
        .execute(&mut *tx)
        .await?;

        if is_remote_dispatch {
            self.consume_remotable_partition(
                &mut tx,
                versions,
                job_execution_id,
                key,
                fresh.step_execution_id,
            )
            .await?;
        }
        tx.commit().await?;
        Ok(fresh)
    }

    async fn create_top_level_step_execution_on_restart_and_clean(
        &self,
        job_execution_id: i64,
        key: &StepThreadInstanceKey,
    ) -> Result<StepThreadExecution> {
        let versions = self.activate().await?;
        let mut tx = self.pool.begin().await?;
        let job_execution = self
            .fetch_execution(&mut *tx, versions, job_execution_id, false)
            .await?
            .ok_or(BatchError::NoSuchJobExecution(job_execution_id))?;
        self.fetch_step_instance(&mut *tx, key, true)
            .await?
            .ok_or_else(|| {
                BatchError::illegal_state(format!("No step thread instance found for key = {key}"))
            })?;

        let fresh = StepThreadExecution::new_top_level(
            0,
            job_execution_id,
            job_execution.instance_id,
            key.step_name.clone(),
        );
        let fresh = self.insert_step_execution(&mut tx, &fresh).await?;
        sqlx::query(
            "UPDATE step_thread_instance \
             SET start_count = start_count + 1, checkpoint_data = NULL, latest_execution_id = $4 \
             WHERE job_instance_id = $1 AND step_name = $2 AND partition_number = $3",
        )
        .bind(key.job_instance_id)
        .bind(&key.step_name)
        .bind(key.partition_number)
        .bind(fresh.step_execution_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(fresh)
    }

    async fn get_step_thread_execution(
        &self,
        step_execution_id: i64,
    ) -> Result<StepThreadExecution> {
        self.activate().await?;
        self.fetch_step_execution(&self.pool, step_execution_id, false)
            .await?
            .ok_or(BatchError::UnknownStepExecution(step_execution_id))
    }

    async fn get_step_thread_instance(
        &self,
        key: &StepThreadInstanceKey,
    ) -> Result<Option<StepThreadInstance>> {
        self.activate().await?;
        self.fetch_step_instance(&self.pool, key, false).await
    }

    async fn get_completed_partition_numbers(
        &self,
        top_level_key: &StepThreadInstanceKey,
    ) -> Result<Vec<i32>> {
        self.activate().await?;
        Ok(sqlx::query_scalar::<_, i32>(
            "SELECT sti.partition_number FROM step_thread_instance sti \
             JOIN step_thread_execution ste ON ste.step_execution_id = sti.latest_execution_id \
             WHERE sti.job_instance_id = $1 AND sti.step_name = $2 \
               AND sti.partition_number >= 0 AND ste.batch_status = 'COMPLETED' \
             ORDER BY sti.partition_number ASC",
        )
        .bind(top_level_key.job_instance_id)
        .bind(&top_level_key.step_name)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn update_step_thread_instance_checkpoint(
        &self,
        key: &StepThreadInstanceKey,
        checkpoint_data: Option<Vec<u8>>,
    ) -> Result<StepThreadInstance> {
        self.activate().await?;
        let sql = format!(
            "UPDATE step_thread_instance SET checkpoint_data = $4 \
             WHERE job_instance_id = $1 AND step_name = $2 AND partition_number = $3 \
             RETURNING {STEP_INSTANCE_COLUMNS}"
        );
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, StepThreadInstanceRow>(&sql)
            .bind(key.job_instance_id)
            .bind(&key.step_name)
            .bind(key.partition_number)
            .bind(checkpoint_data)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| {
                BatchError::illegal_state(format!("No step thread instance found for key = {key}"))
            })?;
        tx.commit().await?;
        Ok(StepThreadInstance::from(row))
    }

    async fn update_partition_plan_size(
        &self,
        top_level_key: &StepThreadInstanceKey,
        plan_size: i32,
    ) -> Result<StepThreadInstance> {
        self.activate().await?;
        let sql = format!(
            "UPDATE step_thread_instance SET partition_plan_size = $4 \
             WHERE job_instance_id = $1 AND step_name = $2 AND partition_number = $3 \
             RETURNING {STEP_INSTANCE_COLUMNS}"
        );
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, StepThreadInstanceRow>(&sql)
            .bind(top_level_key.job_instance_id)
            .bind(&top_level_key.step_name)
            .bind(top_level_key.partition_number)
            .bind(plan_size)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| {
                BatchError::illegal_state(format!(
                    "No step thread instance found for key = {top_level_key}"
                ))
            })?;
        tx.commit().await?;
        Ok(StepThreadInstance::from(row))
    }

    async fn delete_partition_step_thread_instances(
        &self,
        top_level_key: &StepThreadInstanceKey,
    ) -> Result<()> {
        self.activate().await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM step_thread_instance \
             WHERE job_instance_id = $1 AND step_name = $2 AND partition_number >= 0",
        )
        .bind(top_level_key.job_instance_id)
        .bind(&top_level_key.step_name)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_step_execution(
        &self,
        snapshot: &RuntimeStepSnapshot,
    ) -> Result<StepThreadExecution> {
        self.activate().await?;
        let result: Result<StepThreadExecution> = async {
            let mut tx = self.pool.begin().await?;
            let current = self
                .fetch_step_execution(&mut *tx, snapshot.step_execution_id, true)
                .await?
                .ok_or_else(|| {
                    BatchError::illegal_state(format!(
                        "Step thread execution with id = {} should be persisted at this point",
                        snapshot.step_execution_id
                    ))
                })?;
            let updated = self.write_snapshot(&mut tx, &current, snapshot, None).await?;
            tx.commit().await?;
            Ok(updated)
        }
        .await;

        // Counter protection across retries: the live metrics become the
        // committed baseline only once the transaction commits.
        match &result {
            Ok(_) => snapshot.commit_metrics(),
            Err(_) => snapshot.rollback_metrics(),
        }
        result
    }

    async fn update_top_level_step_execution_with_partition_aggregate(
        &self,
        snapshot: &RuntimeStepSnapshot,
    ) -> Result<StepThreadExecution> {
        self.activate().await?;
        let mut tx = self.pool.begin().await?;
        let current = self
            .fetch_step_execution(&mut *tx, snapshot.step_execution_id, true)
            .await?
            .ok_or_else(|| {
                BatchError::illegal_state(format!(
                    "Step thread execution with id = {} should be persisted at this point",
                    snapshot.step_execution_id
                ))
            })?;
        if !current.is_top_level {
            return Err(BatchError::illegal_state(format!(
                "Step thread execution {} is not a top-level execution",
                snapshot.step_execution_id
            )));
        }

        let sums = sqlx::query_as::<_, (i64, i64, i64, i64, i64, i64)>(
            "SELECT CAST(COALESCE(SUM(read_count), 0) AS BIGINT), \
                    CAST(COALESCE(SUM(write_count), 0) AS BIGINT), \
                    CAST(COALESCE(SUM(commit_count), 0) AS BIGINT), \
                    CAST(COALESCE(SUM(rollback_count), 0) AS BIGINT), \
                    CAST(COALESCE(SUM(read_skip_count), 0) AS BIGINT), \
                    CAST(COALESCE(SUM(write_skip_count), 0) AS BIGINT) \
             FROM step_thread_execution WHERE top_level_execution_id = $1",
        )
        .bind(snapshot.step_execution_id)
        .fetch_one(&mut *tx)
        .await?;
        let partition_totals = crate::models::StepMetrics {
            read_count: sums.0,
            write_count: sums.1,
            commit_count: sums.2,
            rollback_count: sums.3,
            read_skip_count: sums.4,
            write_skip_count: sums.5,
        };

        let updated = self
            .write_snapshot(&mut tx, &current, snapshot, Some(partition_totals))
            .await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn get_top_level_step_executions(
        &self,
        job_execution_id: i64,
    ) -> Result<Vec<StepThreadExecution>> {
        let versions = self.activate().await?;
        let cols = step_execution_columns("");
        let sql = format!(
            "SELECT {cols} FROM step_thread_execution \
             WHERE job_execution_id = $1 AND is_top_level \
             ORDER BY start_time ASC NULLS FIRST, step_execution_id ASC"
        );
        let step_rows = sqlx::query_as::<_, StepThreadExecutionRow>(&sql)
            .bind(job_execution_id)
            .fetch_all(&self.pool)
            .await?;
        if step_rows.is_empty() {
            self.execution_or_not_found(versions, job_execution_id).await?;
        }
        step_rows
            .into_iter()
            .map(StepThreadExecution::try_from)
            .collect()
    }

    async fn create_remotable_partition(
        &self,
        key: RemotablePartitionKey,
    ) -> Result<Option<RemotablePartition>> {
        let versions = self.activate().await?;
        if !versions.supports_remotable_partitions() {
            return Ok(None);
        }
        let mut tx = self.pool.begin().await?;
        if self
            .fetch_execution(&mut *tx, versions, key.job_execution_id, false)
            .await?
            .is_none()
        {
            return Err(BatchError::illegal_state(format!(
                "Didn't find job execution associated with value: {}",
                key.job_execution_id
            )));
        }
        let cols = partition_columns("");
        let sql = format!(
            "INSERT INTO remotable_partition \
             (job_execution_id, step_name, partition_number, internal_state, last_updated) \
             VALUES ($1, $2, $3, 'QUEUED', $4) RETURNING {cols}"
        );
        let row = sqlx::query_as::<_, RemotablePartitionRow>(&sql)
            .bind(key.job_execution_id)
            .bind(&key.step_name)
            .bind(key.partition_number)
            .bind(Utc::now().naive_utc())
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(RemotablePartition::try_from(row)?))
    }

    async fn update_remotable_partition_log_dir(
        &self,
        key: &RemotablePartitionKey,
        log_dir_path: &str,
    ) -> Result<Option<RemotablePartition>> {
        let versions = self.activate().await?;
        if !versions.supports_remotable_partitions() {
            return Ok(None);
        }
        let cols = partition_columns("");
        let sql = format!(
            "UPDATE remotable_partition SET log_dir_path = $4 \
             WHERE job_execution_id = $1 AND step_name = $2 AND partition_number = $3 \
             RETURNING {cols}"
        );
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, RemotablePartitionRow>(&sql)
            .bind(key.job_execution_id)
            .bind(&key.step_name)
            .bind(key.partition_number)
            .bind(log_dir_path)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        row.map(RemotablePartition::try_from).transpose()
    }

    async fn get_remotable_partition_internal_state(
        &self,
        key: &RemotablePartitionKey,
    ) -> Result<Option<RemotablePartitionState>> {
        let versions = self.activate().await?;
        if !versions.supports_remotable_partitions() {
            return Ok(None);
        }
        let state = sqlx::query_scalar::<_, String>(
            "SELECT internal_state FROM remotable_partition \
             WHERE job_execution_id = $1 AND step_name = $2 AND partition_number = $3",
        )
        .bind(key.job_execution_id)
        .bind(&key.step_name)
        .bind(key.partition_number)
        .fetch_optional(&self.pool)
        .await?;
        match state {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|e: String| BatchError::illegal_state(format!("Invalid value in database: {e}"))),
            None => {
                debug!(key = %key, "no remotable partition found; dispatcher may be down-level");
                Ok(None)
            }
        }
    }

    async fn get_recovered_partition_numbers(
        &self,
        top_level_step_execution_id: i64,
    ) -> Result<Vec<i32>> {
        let versions = self.activate().await?;
        if !versions.supports_remotable_partitions() {
            return Ok(Vec::new());
        }
        Ok(sqlx::query_scalar::<_, i32>(
            "SELECT rp.partition_number FROM remotable_partition rp \
             JOIN step_thread_execution ste ON ste.step_execution_id = rp.step_execution_id \
             WHERE ste.top_level_execution_id = $1 AND rp.internal_state = 'RECOVERED' \
             ORDER BY rp.partition_number ASC",
        )
        .bind(top_level_step_execution_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn get_remotable_partitions_for_job_execution(
        &self,
        job_execution_id: i64,
    ) -> Result<Option<Vec<RemotablePartition>>> {
        let versions = self.activate().await?;
        if !versions.supports_remotable_partitions() {
            return Ok(None);
        }
        let cols = partition_columns("");
        let sql = format!(
            "SELECT {cols} FROM remotable_partition WHERE job_execution_id = $1 \
             ORDER BY step_name, partition_number"
        );
        let partition_rows = sqlx::query_as::<_, RemotablePartitionRow>(&sql)
            .bind(job_execution_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(Some(
            partition_rows
                .into_iter()
                .map(RemotablePartition::try_from)
                .collect::<Result<Vec<_>>>()?,
        ))
    }

    async fn get_step_execution_aggregate(
        &self,
        top_level_step_execution_id: i64,
    ) -> Result<StepThreadExecutionAggregate> {
        let versions = self.activate().await?;
        let top_level = self
            .fetch_step_execution(&self.pool, top_level_step_execution_id, false)
            .await?
            .ok_or(BatchError::UnknownStepExecution(top_level_step_execution_id))?;
        if !top_level.is_top_level {
            return Err(BatchError::illegal_state(format!(
                "Didn't find top-level step thread execution at id: {top_level_step_execution_id}"
            )));
        }
        self.aggregate_for(versions, top_level).await
    }

    async fn get_step_execution_aggregate_from_job_execution(
        &self,
        job_execution_id: i64,
        step_name: &str,
    ) -> Result<StepThreadExecutionAggregate> {
        let versions = self.activate().await?;
        let mut tx = self.pool.begin().await?;
        let top_level = self
            .unique_top_level_execution(&mut tx, job_execution_id, step_name)
            .await?;
        tx.commit().await?;
        self.aggregate_for(versions, top_level).await
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
        self.current_versions()
    }
}

#[async_trait]
impl RecoveryStore for SqlPersistence {
    async fn get_job_executions_running_on_server(
        &self,
        server_id: &str,
    ) -> Result<Vec<JobExecution>> {
        let versions = self.current_versions();
        let cols = execution_columns("", versions.supports_job_parameters());
        let sql = format!(
            "SELECT {cols} FROM job_execution \
             WHERE server_id = $1 AND batch_status IN {RUNNING_STATUSES_SQL} \
             ORDER BY execution_id"
        );
        let execution_rows = sqlx::query_as::<_, JobExecutionRow>(&sql)
            .bind(server_id)
            .fetch_all(&self.pool)
            .await?;
        execution_rows
            .into_iter()
            .map(JobExecution::try_from)
            .collect()
    }

    async fn get_step_thread_executions_running(
        &self,
        job_execution_id: i64,
    ) -> Result<Vec<StepThreadExecution>> {
        let cols = step_execution_columns("");
        // Sorted low-to-high by step execution id, not by timestamp.
        let sql = format!(
            "SELECT {cols} FROM step_thread_execution \
             WHERE job_execution_id = $1 AND batch_status IN {RUNNING_STATUSES_SQL} \
             ORDER BY step_execution_id ASC"
        );
        let step_rows = sqlx::query_as::<_, StepThreadExecutionRow>(&sql)
            .bind(job_execution_id)
            .fetch_all(&self.pool)
            .await?;
        step_rows
            .into_iter()
            .map(StepThreadExecution::try_from)
            .collect()
    }

    async fn update_step_execution_on_recovery(
        &self,
        step_execution_id: i64,
        status: BatchStatus,
        exit_status: Option<&str>,
        end_time: NaiveDateTime,
    ) -> Result<StepThreadExecution> {
        let mut tx = self.pool.begin().await?;
        let current = self
            .fetch_step_execution(&mut *tx, step_execution_id, true)
            .await?
            .ok_or(BatchError::UnknownStepExecution(step_execution_id))?;
        verify_status_transition(step_execution_id, current.batch_status, status)?;
        let cols = step_execution_columns("");
        let sql = format!(
            "UPDATE step_thread_execution \
             SET batch_status = $2, exit_status = $3, end_time = $4 \
             WHERE step_execution_id = $1 RETURNING {cols}"
        );
        let row = sqlx::query_as::<_, StepThreadExecutionRow>(&sql)
            .bind(step_execution_id)
            .bind(status.to_string())
            .bind(exit_status)
            .bind(end_time)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        StepThreadExecution::try_from(row)
    }

    async fn finalize_job_execution_on_recovery(
        &self,
        execution_id: i64,
        status: BatchStatus,
        exit_status: Option<&str>,
        end_time: NaiveDateTime,
    ) -> Result<JobExecution> {
        self.finalize_execution_and_instance(
            self.current_versions(),
            execution_id,
            status,
            exit_status,
            end_time,
        )
        .await
    }

    async fn get_remotable_partitions_running_on_server(
        &self,
        server_id: &str,
    ) -> Result<Vec<RemotablePartition>> {
        let versions = self.current_versions();
        if !versions.supports_remotable_partitions() {
            return Ok(Vec::new());
        }
        let cols = partition_columns("rp.");
        let sql = format!(
            "SELECT {cols} FROM remotable_partition rp \
             JOIN step_thread_execution ste ON ste.step_execution_id = rp.step_execution_id \
             WHERE rp.server_id = $1 AND ste.batch_status IN {RUNNING_STATUSES_SQL} \
             ORDER BY rp.job_execution_id, rp.step_name, rp.partition_number"
        );
        let partition_rows = sqlx::query_as::<_, RemotablePartitionRow>(&sql)
            .bind(server_id)
            .fetch_all(&self.pool)
            .await?;
        partition_rows
            .into_iter()
            .map(RemotablePartition::try_from)
            .collect()
    }

    async fn update_remotable_partition_on_recovery(
        &self,
        key: &RemotablePartitionKey,
        now: NaiveDateTime,
    ) -> Result<RemotablePartition> {
        let cols = partition_columns("");
        let sql = format!(
            "UPDATE remotable_partition SET internal_state = 'RECOVERED', last_updated = $4 \
             WHERE job_execution_id = $1 AND step_name = $2 AND partition_number = $3 \
             RETURNING {cols}"
        );
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, RemotablePartitionRow>(&sql)
            .bind(key.job_execution_id)
            .bind(&key.step_name)
            .bind(key.partition_number)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| {
                BatchError::illegal_state(format!("No remotable partition found for key = {key}"))
            })?;
        tx.commit().await?;
        RemotablePartition::try_from(row)
    }
}
