//! Schema version detection and DDL export.
//!
//! The job store's tables come in versions that add optional capabilities
//! (job parameters, instance update timestamp, group names, remotable
//! partition support) without breaking older deployments. On first access the
//! backend probes for each optional capability with a trial query; a failure
//! whose SQLSTATE marks a missing column (42703) or missing table (42P01)
//! downgrades the assumed entity version. Any other failure propagates.
//!
//! Probe order is fixed: remotable-partition table, then instance group
//! names, then instance update time, then execution job parameters. A
//! partition-probe miss pins the execution entity directly at version 2; the
//! version-3 determination (which rides on partition support) is never
//! attempted after that.

use std::io;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::persistence::SchemaVersions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbeOutcome {
    Present,
    Missing,
}

/// The four capability probes, in detection order.
#[async_trait]
pub(crate) trait SchemaProbes {
    async fn remotable_partition_table(&self) -> Result<ProbeOutcome>;
    async fn instance_group_names(&self) -> Result<ProbeOutcome>;
    async fn instance_update_time(&self) -> Result<ProbeOutcome>;
    async fn execution_job_parameters(&self) -> Result<ProbeOutcome>;
}

/// Resolve entity versions from probe outcomes. Runs each probe at most once
/// and only when its outcome can still affect the result.
pub(crate) async fn detect_schema_versions<P: SchemaProbes + Sync>(
    probes: &P,
) -> Result<SchemaVersions> {
    let mut versions = SchemaVersions::MAX;

    if probes.remotable_partition_table().await? == ProbeOutcome::Missing {
        debug!("remotable partition table not found; partition entity version = 1");
        versions.partition = 1;
        // Without partition support the execution entity can be at most v2.
        versions.execution = 2;
    }

    match probes.instance_group_names().await? {
        ProbeOutcome::Present => versions.instance = 3,
        ProbeOutcome::Missing => {
            debug!("group names column not found; instance entity version <= 2");
            versions.instance = 2;
            if probes.instance_update_time().await? == ProbeOutcome::Missing {
                debug!("update time column not found; instance entity version = 1");
                versions.instance = 1;
            }
        }
    }

    if versions.partition >= 2 {
        // Partition support implies the newest execution entity; no probe needed.
        versions.execution = 3;
    } else if probes.execution_job_parameters().await? == ProbeOutcome::Missing {
        debug!("job parameters column not found; execution entity version = 1");
        versions.execution = 1;
    }

    debug!(
        instance = versions.instance,
        execution = versions.execution,
        partition = versions.partition,
        "detected schema versions"
    );
    Ok(versions)
}

/// True for errors that mean "this column or table does not exist" rather
/// than a real failure: SQLSTATE 42703 (undefined column) and 42P01
/// (undefined table).
pub(crate) fn is_missing_schema_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some("42703") | Some("42P01")
        ),
        _ => false,
    }
}

/// Write the complete latest-version schema definition to `out`.
///
/// Deployment tooling path; the runtime never executes this.
pub fn write_ddl<W: io::Write>(out: &mut W) -> io::Result<()> {
    out.write_all(DDL.as_bytes())
}

const DDL: &str = r#"CREATE TABLE job_instance (
    instance_id BIGSERIAL PRIMARY KEY,
    job_name VARCHAR(256) NOT NULL,
    job_xml_name VARCHAR(128),
    job_xml TEXT,
    submitter VARCHAR(256),
    create_time TIMESTAMP NOT NULL,
    last_updated_time TIMESTAMP NOT NULL,
    num_executions INTEGER NOT NULL DEFAULT 0,
    instance_state VARCHAR(32) NOT NULL,
    batch_status VARCHAR(32) NOT NULL,
    exit_status TEXT,
    restart_on VARCHAR(128),
    group_names TEXT[]
);

CREATE INDEX job_instance_job_name_ix ON job_instance (job_name);
CREATE INDEX job_instance_submitter_ix ON job_instance (submitter);

CREATE TABLE job_execution (
    execution_id BIGSERIAL PRIMARY KEY,
    instance_id BIGINT NOT NULL REFERENCES job_instance (instance_id) ON DELETE CASCADE,
    execution_num_for_instance INTEGER NOT NULL,
    batch_status VARCHAR(32) NOT NULL,
    exit_status TEXT,
    create_time TIMESTAMP NOT NULL,
    start_time TIMESTAMP,
    end_time TIMESTAMP,
    last_updated_time TIMESTAMP NOT NULL,
    job_parameters JSONB,
    server_id VARCHAR(256) NOT NULL DEFAULT '',
    rest_url VARCHAR(512) NOT NULL DEFAULT '',
    log_dir_path TEXT
);

CREATE INDEX job_execution_instance_ix ON job_execution (instance_id);
CREATE INDEX job_execution_server_ix ON job_execution (server_id, batch_status);

CREATE TABLE step_thread_instance (
    job_instance_id BIGINT NOT NULL REFERENCES job_instance (instance_id) ON DELETE CASCADE,
    step_name VARCHAR(128) NOT NULL,
    partition_number INTEGER NOT NULL,
    start_count INTEGER NOT NULL DEFAULT 1,
    checkpoint_data BYTEA,
    latest_execution_id BIGINT NOT NULL,
    partitioned BOOLEAN NOT NULL DEFAULT FALSE,
    partition_plan_size INTEGER,
    PRIMARY KEY (job_instance_id, step_name, partition_number)
);

CREATE TABLE step_thread_execution (
    step_execution_id BIGSERIAL PRIMARY KEY,
    job_execution_id BIGINT NOT NULL REFERENCES job_execution (execution_id) ON DELETE CASCADE,
    job_instance_id BIGINT NOT NULL,
    step_name VARCHAR(128) NOT NULL,
    partition_number INTEGER NOT NULL,
    batch_status VARCHAR(32) NOT NULL,
    exit_status TEXT,
    start_time TIMESTAMP,
    end_time TIMESTAMP,
    persistent_user_data BYTEA,
    read_count BIGINT NOT NULL DEFAULT 0,
    write_count BIGINT NOT NULL DEFAULT 0,
    commit_count BIGINT NOT NULL DEFAULT 0,
    rollback_count BIGINT NOT NULL DEFAULT 0,
    read_skip_count BIGINT NOT NULL DEFAULT 0,
    write_skip_count BIGINT NOT NULL DEFAULT 0,
    is_top_level BOOLEAN NOT NULL,
    top_level_execution_id BIGINT
);

CREATE INDEX step_thread_execution_job_exec_ix ON step_thread_execution (job_execution_id, step_name);
CREATE INDEX step_thread_execution_top_level_ix ON step_thread_execution (top_level_execution_id);

CREATE TABLE remotable_partition (
    job_execution_id BIGINT NOT NULL REFERENCES job_execution (execution_id) ON DELETE CASCADE,
    step_name VARCHAR(128) NOT NULL,
    partition_number INTEGER NOT NULL,
    internal_state VARCHAR(32) NOT NULL,
    server_id VARCHAR(256) NOT NULL DEFAULT '',
    rest_url VARCHAR(512) NOT NULL DEFAULT '',
    log_dir_path TEXT,
    last_updated TIMESTAMP NOT NULL,
    step_execution_id BIGINT,
    PRIMARY KEY (job_execution_id, step_name, partition_number)
);

CREATE INDEX remotable_partition_server_ix ON remotable_partition (server_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Scripted probe set recording which probes actually ran.
    struct ScriptedProbes {
        partition: ProbeOutcome,
        group_names: ProbeOutcome,
        update_time: ProbeOutcome,
        job_parameters: ProbeOutcome,
        ran: Mutex<Vec<&'static str>>,
    }

    impl ScriptedProbes {
        fn all_present() -> Self {
            Self {
                partition: ProbeOutcome::Present,
                group_names: ProbeOutcome::Present,
                update_time: ProbeOutcome::Present,
                job_parameters: ProbeOutcome::Present,
                ran: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SchemaProbes for ScriptedProbes {
        async fn remotable_partition_table(&self) -> Result<ProbeOutcome> {
            self.ran.lock().push("partition");
            Ok(self.partition)
        }
        async fn instance_group_names(&self) -> Result<ProbeOutcome> {
            self.ran.lock().push("group_names");
            Ok(self.group_names)
        }
        async fn instance_update_time(&self) -> Result<ProbeOutcome> {
            self.ran.lock().push("update_time");
            Ok(self.update_time)
        }
        async fn execution_job_parameters(&self) -> Result<ProbeOutcome> {
            self.ran.lock().push("job_parameters");
            Ok(self.job_parameters)
        }
    }

    #[tokio::test]
    async fn test_all_present_yields_max_versions() {
        let probes = ScriptedProbes::all_present();
        let versions = detect_schema_versions(&probes).await.unwrap();
        assert_eq!(versions, SchemaVersions::MAX);
        // Partition support implies execution v3; its probe must not run.
        assert_eq!(*probes.ran.lock(), vec!["partition", "group_names"]);
    }

    #[tokio::test]
    async fn test_partition_miss_pins_execution_at_two() {
        let probes = ScriptedProbes {
            partition: ProbeOutcome::Missing,
            ..ScriptedProbes::all_present()
        };
        let versions = detect_schema_versions(&probes).await.unwrap();
        assert_eq!(versions.partition, 1);
        assert_eq!(versions.execution, 2);
        assert_eq!(versions.instance, 3);
        assert_eq!(
            *probes.ran.lock(),
            vec!["partition", "group_names", "job_parameters"]
        );
    }

    #[tokio::test]
    async fn test_partition_and_parameters_missing_yields_execution_one() {
        let probes = ScriptedProbes {
            partition: ProbeOutcome::Missing,
            job_parameters: ProbeOutcome::Missing,
            ..ScriptedProbes::all_present()
        };
        let versions = detect_schema_versions(&probes).await.unwrap();
        assert_eq!(versions.partition, 1);
        assert_eq!(versions.execution, 1);
    }

    #[tokio::test]
    async fn test_instance_downgrade_chain() {
        let probes = ScriptedProbes {
            group_names: ProbeOutcome::Missing,
            ..ScriptedProbes::all_present()
        };
        let versions = detect_schema_versions(&probes).await.unwrap();
        assert_eq!(versions.instance, 2);

        let probes = ScriptedProbes {
            group_names: ProbeOutcome::Missing,
            update_time: ProbeOutcome::Missing,
            ..ScriptedProbes::all_present()
        };
        let versions = detect_schema_versions(&probes).await.unwrap();
        assert_eq!(versions.instance, 1);
    }

    #[tokio::test]
    async fn test_update_time_probe_skipped_when_group_names_present() {
        let probes = ScriptedProbes::all_present();
        detect_schema_versions(&probes).await.unwrap();
        assert!(!probes.ran.lock().contains(&"update_time"));
    }

    #[test]
    fn test_ddl_contains_every_table() {
        let mut sink = Vec::new();
        write_ddl(&mut sink).unwrap();
        let ddl = String::from_utf8(sink).unwrap();
        for table in [
            "job_instance",
            "job_execution",
            "step_thread_instance",
            "step_thread_execution",
            "remotable_partition",
        ] {
            assert!(ddl.contains(&format!("CREATE TABLE {table} (")), "missing {table}");
        }
    }
}
