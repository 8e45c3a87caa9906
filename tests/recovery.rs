//! Startup recovery scenarios.
//!
//! Two backends sharing one store stand in for two servers sharing one job
//! store: executions dispatched by either carry that server's identity, and
//! recovery for one server must leave the other's work alone.

use std::sync::Arc;

use chrono::Utc;

use batch_core::location::StaticLocation;
use batch_core::models::{
    BatchStatus, InstanceState, NewJobInstance, RemotablePartitionKey, RemotablePartitionState,
    RuntimeStepSnapshot, StepThreadInstanceKey,
};
use batch_core::persistence::memory::{MemoryPersistence, MemoryStore};
use batch_core::persistence::recovery::StartupRecovery;
use batch_core::persistence::PersistenceService;

const SERVER_A: &str = "server-a";
const SERVER_B: &str = "server-b";

fn two_servers() -> (MemoryPersistence, MemoryPersistence) {
    let store = Arc::new(MemoryStore::new());
    let a = MemoryPersistence::new(
        store.clone(),
        Arc::new(StaticLocation::new(SERVER_A, "https://a:9443/batch")),
    );
    let b = MemoryPersistence::new(
        store,
        Arc::new(StaticLocation::new(SERVER_B, "https://b:9443/batch")),
    );
    (a, b)
}

fn new_instance(job_name: &str) -> NewJobInstance {
    NewJobInstance {
        job_name: job_name.to_string(),
        job_xml_name: None,
        job_xml: None,
        submitter: Some("alice".to_string()),
        create_time: Utc::now().naive_utc(),
    }
}

/// Create an instance with one execution dispatched and STARTED on `backend`.
async fn started_execution(backend: &MemoryPersistence, job_name: &str) -> (i64, i64) {
    let instance = backend.create_job_instance(new_instance(job_name)).await.unwrap();
    let execution = backend
        .create_job_execution(instance.instance_id, None, Utc::now().naive_utc())
        .await
        .unwrap();
    backend
        .update_job_execution_server_and_rest_url_for_starting_job(execution.execution_id)
        .await
        .unwrap();
    backend
        .update_job_execution_and_instance_on_started(
            execution.execution_id,
            Utc::now().naive_utc(),
        )
        .await
        .unwrap();
    (instance.instance_id, execution.execution_id)
}

#[tokio::test]
async fn test_recovery_fails_in_flight_execution_and_instance() {
    let (backend, _) = two_servers();
    let (instance_id, execution_id) = started_execution(&backend, "payroll").await;

    // A step left mid-flight by the crash.
    let step_key = StepThreadInstanceKey::top_level(instance_id, "load");
    let step = backend
        .create_top_level_step_execution_and_new_instance(execution_id, &step_key, false)
        .await
        .unwrap();
    let snapshot = RuntimeStepSnapshot::new(step.step_execution_id, BatchStatus::Started);
    backend.update_step_execution(&snapshot).await.unwrap();

    StartupRecovery::new(SERVER_A).recover(&backend).await.unwrap();

    let execution = backend.get_job_execution(execution_id).await.unwrap();
    assert_eq!(execution.batch_status, BatchStatus::Failed);
    assert!(execution.end_time.is_some());

    let instance = backend.get_job_instance(instance_id).await.unwrap();
    assert_eq!(instance.instance_state, InstanceState::Failed);
    assert_eq!(instance.batch_status, BatchStatus::Failed);

    let step = backend
        .get_step_thread_execution(step.step_execution_id)
        .await
        .unwrap();
    assert_eq!(step.batch_status, BatchStatus::Failed);
    assert!(step.end_time.is_some());
}

#[tokio::test]
async fn test_recovery_ignores_other_servers_executions() {
    let (backend_a, backend_b) = two_servers();
    let (_, execution_a) = started_execution(&backend_a, "payroll").await;
    let (_, execution_b) = started_execution(&backend_b, "inventory").await;

    StartupRecovery::new(SERVER_A).recover(&backend_a).await.unwrap();

    assert_eq!(
        backend_a
            .get_job_execution(execution_a)
            .await
            .unwrap()
            .batch_status,
        BatchStatus::Failed
    );
    // Server B's execution is untouched.
    assert_eq!(
        backend_b
            .get_job_execution(execution_b)
            .await
            .unwrap()
            .batch_status,
        BatchStatus::Started
    );
}

#[tokio::test]
async fn test_recovery_is_clean_with_nothing_in_flight() {
    let (backend, _) = two_servers();
    let instance = backend.create_job_instance(new_instance("payroll")).await.unwrap();
    let execution = backend
        .create_job_execution(instance.instance_id, None, Utc::now().naive_utc())
        .await
        .unwrap();
    backend
        .update_job_execution_and_instance_on_end(
            execution.execution_id,
            BatchStatus::Completed,
            Some("OK"),
            Utc::now().naive_utc(),
        )
        .await
        .unwrap();

    StartupRecovery::new(SERVER_A).recover(&backend).await.unwrap();

    let read_back = backend.get_job_execution(execution.execution_id).await.unwrap();
    assert_eq!(read_back.batch_status, BatchStatus::Completed);
    assert_eq!(read_back.exit_status.as_deref(), Some("OK"));
}

#[tokio::test]
async fn test_recovery_marks_local_partitions_recovered() {
    let (backend_a, backend_b) = two_servers();

    // The job itself runs on server B; one partition is dispatched to A.
    let (instance_id, execution_id) = started_execution(&backend_b, "payroll").await;
    let top_level_key = StepThreadInstanceKey::top_level(instance_id, "load");
    let top_level = backend_b
        .create_top_level_step_execution_and_new_instance(execution_id, &top_level_key, true)
        .await
        .unwrap();

    let partition_key = RemotablePartitionKey::new(execution_id, "load", 0);
    backend_b
        .create_remotable_partition(partition_key.clone())
        .await
        .unwrap();

    // Server A consumes the partition and gets it running.
    let step_key = StepThreadInstanceKey::partition(instance_id, "load", 0);
    let partition_step = backend_a
        .create_partition_step_execution_and_new_instance(execution_id, &step_key, true)
        .await
        .unwrap();
    let snapshot = RuntimeStepSnapshot::new(partition_step.step_execution_id, BatchStatus::Started);
    backend_a.update_step_execution(&snapshot).await.unwrap();

    // Server A crashes and comes back.
    StartupRecovery::new(SERVER_A).recover(&backend_a).await.unwrap();

    let state = backend_a
        .get_remotable_partition_internal_state(&partition_key)
        .await
        .unwrap();
    assert_eq!(state, Some(RemotablePartitionState::Recovered));

    let recovered = backend_a
        .get_recovered_partition_numbers(top_level.step_execution_id)
        .await
        .unwrap();
    assert_eq!(recovered, vec![0]);

    // The job execution belongs to server B and is untouched.
    assert_eq!(
        backend_b
            .get_job_execution(execution_id)
            .await
            .unwrap()
            .batch_status,
        BatchStatus::Started
    );
}
