//! Durable backend tests.
//!
//! The DDL export is pure and always runs. The live-database tests need a
//! PostgreSQL instance with the exported schema applied and `DATABASE_URL`
//! set; they are ignored by default.

use std::io::Write;
use std::sync::Arc;

use batch_core::location::StaticLocation;
use batch_core::persistence::sql::{schema, SqlPersistence};
use batch_core::persistence::PersistenceService;

#[test]
fn test_ddl_export_writes_full_schema() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let mut buffer = Vec::new();
    schema::write_ddl(&mut buffer).unwrap();
    file.write_all(&buffer).unwrap();

    let ddl = String::from_utf8(buffer).unwrap();
    assert!(ddl.contains("CREATE TABLE job_instance ("));
    assert!(ddl.contains("CREATE TABLE job_execution ("));
    assert!(ddl.contains("CREATE TABLE step_thread_instance ("));
    assert!(ddl.contains("CREATE TABLE step_thread_execution ("));
    assert!(ddl.contains("CREATE TABLE remotable_partition ("));
    // The version-gated capability columns ship in the latest-version DDL.
    assert!(ddl.contains("group_names"));
    assert!(ddl.contains("job_parameters"));
    assert!(ddl.contains("last_updated_time"));
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database with the exported schema applied"]
async fn test_activation_detects_versions_and_round_trips() {
    let config = batch_core::config::BatchCoreConfig::from_env().unwrap();
    let location = Arc::new(StaticLocation::new(&config.server_id, &config.rest_url));
    let backend = SqlPersistence::connect(&config, location).await.unwrap();

    let versions = backend.activate().await.unwrap();
    assert!(versions.instance >= 1 && versions.instance <= 3);

    let instance = backend
        .create_job_instance(batch_core::models::NewJobInstance {
            job_name: "payroll".into(),
            job_xml_name: None,
            job_xml: None,
            submitter: Some("alice".into()),
            create_time: chrono::Utc::now().naive_utc(),
        })
        .await
        .unwrap();
    let execution = backend
        .create_job_execution(
            instance.instance_id,
            Some(serde_json::json!({"x": "1"})),
            chrono::Utc::now().naive_utc(),
        )
        .await
        .unwrap();
    assert_eq!(execution.execution_num_for_instance, 0);

    backend
        .update_job_execution_and_instance_on_end(
            execution.execution_id,
            batch_core::models::BatchStatus::Completed,
            Some("OK"),
            chrono::Utc::now().naive_utc(),
        )
        .await
        .unwrap();
    let read_back = backend
        .get_job_execution(execution.execution_id)
        .await
        .unwrap();
    assert_eq!(
        read_back.batch_status,
        batch_core::models::BatchStatus::Completed
    );

    backend.purge_job_instance(instance.instance_id).await.unwrap();
}
