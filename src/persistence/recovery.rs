//! # Startup Recovery
//!
//! Resolves executions and partitions left in non-terminal states by an
//! unclean prior shutdown of this node. The durable backend runs this during
//! activation, before the persistence unit is handed to any caller, so nobody
//! can observe an execution in its stale in-flight state.
//!
//! For every running-like job execution attributed to this server: its
//! running step thread executions are forced to FAILED, then the execution
//! and its owning instance are forced to the terminal FAILED family with an
//! end time of now, all through the validated-transition paths. When the
//! backing schema supports remotable partitions, this server's running
//! partitions are marked RECOVERED with a fresh last-updated stamp.

use chrono::Utc;
use tracing::{info, warn};

use crate::error::Result;
use crate::models::BatchStatus;

use super::RecoveryStore;

/// Coordinates the one-shot recovery pass for a server identity.
pub struct StartupRecovery {
    server_id: String,
}

impl StartupRecovery {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
        }
    }

    /// Run the full recovery pass against `store`.
    pub async fn recover<S: RecoveryStore + ?Sized>(&self, store: &S) -> Result<()> {
        let executions = store
            .get_job_executions_running_on_server(&self.server_id)
            .await?;
        if !executions.is_empty() {
            info!(
                server_id = %self.server_id,
                count = executions.len(),
                "recovering job executions left in in-flight states"
            );
        }

        for execution in executions {
            let now = Utc::now().naive_utc();
            let steps = store
                .get_step_thread_executions_running(execution.execution_id)
                .await?;
            for step in steps {
                warn!(
                    step_execution_id = step.step_execution_id,
                    step_name = %step.step_name,
                    "marking in-flight step thread execution FAILED"
                );
                store
                    .update_step_execution_on_recovery(
                        step.step_execution_id,
                        BatchStatus::Failed,
                        step.exit_status.as_deref(),
                        now,
                    )
                    .await?;
            }
            warn!(
                execution_id = execution.execution_id,
                "marking in-flight job execution FAILED"
            );
            store
                .finalize_job_execution_on_recovery(
                    execution.execution_id,
                    BatchStatus::Failed,
                    execution.exit_status.as_deref(),
                    now,
                )
                .await?;
        }

        // Empty when the backing schema has no remotable partition support.
        let partitions = store
            .get_remotable_partitions_running_on_server(&self.server_id)
            .await?;
        for partition in partitions {
            warn!(key = %partition.key, "marking in-flight remotable partition RECOVERED");
            store
                .update_remotable_partition_on_recovery(&partition.key, Utc::now().naive_utc())
                .await?;
        }

        Ok(())
    }
}
