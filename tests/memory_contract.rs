//! Contract tests for the persistence backend abstraction, exercised against
//! the in-memory implementation. The durable backend must satisfy the same
//! properties; its live-database variants live in `sql_backend.rs`.

use std::sync::Arc;

use chrono::Utc;

use batch_core::error::BatchError;
use batch_core::location::StaticLocation;
use batch_core::models::{
    BatchStatus, InstanceState, NewJobInstance, RuntimeStepSnapshot, StepMetrics,
    StepThreadInstanceKey,
};
use batch_core::persistence::memory::{MemoryPersistence, MemoryStore};
use batch_core::persistence::{PersistenceService, SchemaVersions};

const SERVER_A: &str = "server-a";
const REST_A: &str = "https://server-a:9443/ibm/api/batch";

fn memory_backend() -> MemoryPersistence {
    MemoryPersistence::new(
        Arc::new(MemoryStore::new()),
        Arc::new(StaticLocation::new(SERVER_A, REST_A)),
    )
}

fn new_instance(job_name: &str) -> NewJobInstance {
    NewJobInstance {
        job_name: job_name.to_string(),
        job_xml_name: Some(format!("{job_name}-xml")),
        job_xml: Some("<job/>".to_string()),
        submitter: Some("alice".to_string()),
        create_time: Utc::now().naive_utc(),
    }
}

async fn instance_with_execution(backend: &MemoryPersistence) -> (i64, i64) {
    let instance = backend
        .create_job_instance(new_instance("payroll"))
        .await
        .unwrap();
    let execution = backend
        .create_job_execution(instance.instance_id, None, Utc::now().naive_utc())
        .await
        .unwrap();
    (instance.instance_id, execution.execution_id)
}

#[tokio::test]
async fn test_round_trip_submission_to_completed() {
    let backend = memory_backend();
    let instance = backend
        .create_job_instance(new_instance("payroll"))
        .await
        .unwrap();
    assert_eq!(instance.instance_state, InstanceState::Submitted);
    assert_eq!(instance.batch_status, BatchStatus::Starting);

    let execution = backend
        .create_job_execution(
            instance.instance_id,
            Some(serde_json::json!({"x": "1"})),
            Utc::now().naive_utc(),
        )
        .await
        .unwrap();
    assert_eq!(execution.execution_num_for_instance, 0);
    assert_eq!(
        execution.job_parameters,
        Some(serde_json::json!({"x": "1"}))
    );

    backend
        .update_job_execution_and_instance_on_started(
            execution.execution_id,
            Utc::now().naive_utc(),
        )
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

    let read_back = backend
        .get_job_execution(execution.execution_id)
        .await
        .unwrap();
    assert_eq!(read_back.batch_status, BatchStatus::Completed);
    assert_eq!(read_back.exit_status.as_deref(), Some("OK"));
    assert!(read_back.end_time.is_some());

    let owner = backend
        .get_job_instance(instance.instance_id)
        .await
        .unwrap();
    assert_eq!(owner.instance_state, InstanceState::Completed);
    assert_eq!(owner.exit_status.as_deref(), Some("OK"));
}

#[tokio::test]
async fn test_completed_status_permits_only_abandoned() {
    let backend = memory_backend();
    let (_, execution_id) = instance_with_execution(&backend).await;

    backend
        .update_job_execution_and_instance_on_end(
            execution_id,
            BatchStatus::Completed,
            Some("OK"),
            Utc::now().naive_utc(),
        )
        .await
        .unwrap();

    let err = backend
        .update_job_execution_and_instance_on_status_change(
            execution_id,
            BatchStatus::Started,
            Utc::now().naive_utc(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::IllegalStatusTransition { .. }));

    // The one permitted post-terminal edge.
    backend
        .update_job_execution_and_instance_on_status_change(
            execution_id,
            BatchStatus::Abandoned,
            Utc::now().naive_utc(),
        )
        .await
        .unwrap();

    // And nothing moves after ABANDONED.
    for target in [
        BatchStatus::Starting,
        BatchStatus::Completed,
        BatchStatus::Abandoned,
    ] {
        let err = backend
            .update_job_execution_and_instance_on_status_change(
                execution_id,
                target,
                Utc::now().naive_utc(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::IllegalStatusTransition { .. }));
    }
}

#[tokio::test]
async fn test_instance_state_terminality() {
    let backend = memory_backend();
    let instance = backend
        .create_job_instance(new_instance("payroll"))
        .await
        .unwrap();

    backend
        .update_job_instance_state(
            instance.instance_id,
            InstanceState::Completed,
            Utc::now().naive_utc(),
        )
        .await
        .unwrap();

    let err = backend
        .update_job_instance_state(
            instance.instance_id,
            InstanceState::Failed,
            Utc::now().naive_utc(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::IllegalStateTransition { .. }));

    backend
        .update_job_instance_state(
            instance.instance_id,
            InstanceState::Abandoned,
            Utc::now().naive_utc(),
        )
        .await
        .unwrap();
    let err = backend
        .update_job_instance_state(
            instance.instance_id,
            InstanceState::Submitted,
            Utc::now().naive_utc(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::IllegalStateTransition { .. }));
}

#[tokio::test]
async fn test_execution_numbers_are_sequential_and_most_recent_wins() {
    let backend = memory_backend();
    let instance = backend
        .create_job_instance(new_instance("payroll"))
        .await
        .unwrap();

    for expected in 0..5 {
        let execution = backend
            .create_job_execution(instance.instance_id, None, Utc::now().naive_utc())
            .await
            .unwrap();
        assert_eq!(execution.execution_num_for_instance, expected);
    }

    let executions = backend
        .get_job_executions(instance.instance_id)
        .await
        .unwrap();
    let nums: Vec<i32> = executions
        .iter()
        .map(|e| e.execution_num_for_instance)
        .collect();
    assert_eq!(nums, vec![4, 3, 2, 1, 0]);

    let most_recent = backend
        .get_most_recent_job_execution(instance.instance_id)
        .await
        .unwrap();
    assert_eq!(most_recent.execution_num_for_instance, 4);

    let by_num = backend
        .get_job_execution_from_job_exec_num(instance.instance_id, 2)
        .await
        .unwrap();
    assert_eq!(by_num.execution_num_for_instance, 2);
}

#[tokio::test]
async fn test_partition_requires_existing_top_level() {
    let backend = memory_backend();
    let (instance_id, execution_id) = instance_with_execution(&backend).await;

    let partition_key = StepThreadInstanceKey::partition(instance_id, "load", 0);
    let err = backend
        .create_partition_step_execution_and_new_instance(execution_id, &partition_key, false)
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::IllegalState(_)));

    let top_level_key = StepThreadInstanceKey::top_level(instance_id, "load");
    let top_level = backend
        .create_top_level_step_execution_and_new_instance(execution_id, &top_level_key, true)
        .await
        .unwrap();

    let partition = backend
        .create_partition_step_execution_and_new_instance(execution_id, &partition_key, false)
        .await
        .unwrap();
    assert_eq!(
        partition.top_level_execution_id,
        Some(top_level.step_execution_id)
    );
    assert_eq!(partition.batch_status, BatchStatus::Starting);
    assert_eq!(partition.metrics, StepMetrics::zero());
}

#[tokio::test]
async fn test_delete_partition_instances_keeps_executions() {
    let backend = memory_backend();
    let (instance_id, execution_id) = instance_with_execution(&backend).await;
    let top_level_key = StepThreadInstanceKey::top_level(instance_id, "load");
    backend
        .create_top_level_step_execution_and_new_instance(execution_id, &top_level_key, true)
        .await
        .unwrap();

    let mut partition_exec_ids = Vec::new();
    for number in 0..2 {
        let key = StepThreadInstanceKey::partition(instance_id, "load", number);
        let execution = backend
            .create_partition_step_execution_and_new_instance(execution_id, &key, false)
            .await
            .unwrap();
        partition_exec_ids.push(execution.step_execution_id);
    }

    backend
        .delete_partition_step_thread_instances(&top_level_key)
        .await
        .unwrap();

    // Instances are gone, the top-level one stays.
    for number in 0..2 {
        let key = StepThreadInstanceKey::partition(instance_id, "load", number);
        assert!(backend.get_step_thread_instance(&key).await.unwrap().is_none());
    }
    assert!(backend
        .get_step_thread_instance(&top_level_key)
        .await
        .unwrap()
        .is_some());

    // Executions are owned by the job execution and survive.
    for id in partition_exec_ids {
        assert!(backend.get_step_thread_execution(id).await.is_ok());
    }
}

#[tokio::test]
async fn test_metrics_aggregation_sums_partitions() {
    let backend = memory_backend();
    let (instance_id, execution_id) = instance_with_execution(&backend).await;
    let top_level_key = StepThreadInstanceKey::top_level(instance_id, "load");
    let top_level = backend
        .create_top_level_step_execution_and_new_instance(execution_id, &top_level_key, true)
        .await
        .unwrap();

    for (number, read_count) in [(0, 5), (1, 7)] {
        let key = StepThreadInstanceKey::partition(instance_id, "load", number);
        let partition = backend
            .create_partition_step_execution_and_new_instance(execution_id, &key, false)
            .await
            .unwrap();
        let snapshot = RuntimeStepSnapshot::new(partition.step_execution_id, BatchStatus::Started);
        snapshot.record_metrics(StepMetrics {
            read_count,
            ..StepMetrics::zero()
        });
        backend.update_step_execution(&snapshot).await.unwrap();
    }

    let snapshot = RuntimeStepSnapshot::new(top_level.step_execution_id, BatchStatus::Started);
    let updated = backend
        .update_top_level_step_execution_with_partition_aggregate(&snapshot)
        .await
        .unwrap();
    assert_eq!(updated.metrics.read_count, 12);

    let aggregate = backend
        .get_step_execution_aggregate(top_level.step_execution_id)
        .await
        .unwrap();
    assert_eq!(aggregate.partitions.len(), 2);
    assert_eq!(
        aggregate
            .partitions
            .iter()
            .map(|p| p.execution.partition_number)
            .collect::<Vec<_>>(),
        vec![0, 1]
    );
}

#[tokio::test]
async fn test_completed_partition_numbers_ascending() {
    let backend = memory_backend();
    let (instance_id, execution_id) = instance_with_execution(&backend).await;
    let top_level_key = StepThreadInstanceKey::top_level(instance_id, "load");
    backend
        .create_top_level_step_execution_and_new_instance(execution_id, &top_level_key, true)
        .await
        .unwrap();

    // Partitions 2 and 0 complete, partition 1 fails.
    for (number, status) in [
        (2, BatchStatus::Completed),
        (1, BatchStatus::Failed),
        (0, BatchStatus::Completed),
    ] {
        let key = StepThreadInstanceKey::partition(instance_id, "load", number);
        let partition = backend
            .create_partition_step_execution_and_new_instance(execution_id, &key, false)
            .await
            .unwrap();
        let snapshot = RuntimeStepSnapshot::new(partition.step_execution_id, status);
        backend.update_step_execution(&snapshot).await.unwrap();
    }

    let completed = backend
        .get_completed_partition_numbers(&top_level_key)
        .await
        .unwrap();
    assert_eq!(completed, vec![0, 2]);
}

#[tokio::test]
async fn test_stop_race_when_server_already_assigned() {
    let backend = memory_backend();
    let (_, execution_id) = instance_with_execution(&backend).await;

    backend
        .update_job_execution_server_and_rest_url_for_starting_job(execution_id)
        .await
        .unwrap();

    let err = backend
        .update_job_execution_and_instance_on_stop_before_server_assigned(
            execution_id,
            Utc::now().naive_utc(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::ExecutionAssignedToServer(_)));
    assert!(err.is_benign_race());
}

#[tokio::test]
async fn test_server_assignment_fails_after_stop() {
    let backend = memory_backend();
    let (_, execution_id) = instance_with_execution(&backend).await;

    let stopped = backend
        .update_job_execution_and_instance_on_stop_before_server_assigned(
            execution_id,
            Utc::now().naive_utc(),
        )
        .await
        .unwrap();
    assert_eq!(stopped.batch_status, BatchStatus::Stopped);

    let err = backend
        .update_job_execution_server_and_rest_url_for_starting_job(execution_id)
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::JobStopped(_)));
    assert!(err.is_benign_race());
}

#[tokio::test]
async fn test_queued_consumed_flow_and_race() {
    let backend = memory_backend();
    let instance = backend
        .create_job_instance(new_instance("payroll"))
        .await
        .unwrap();

    let queued = backend
        .update_job_instance_on_queued(instance.instance_id)
        .await
        .unwrap();
    assert_eq!(queued.instance_state, InstanceState::JmsQueued);

    let consumed = backend
        .update_job_instance_on_consumed(instance.instance_id)
        .await
        .unwrap();
    assert_eq!(consumed.instance_state, InstanceState::JmsConsumed);

    // A second consumer loses the race.
    let err = backend
        .update_job_instance_on_consumed(instance.instance_id)
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::JobInstanceNotQueued(_)));
    assert!(err.is_benign_race());
}

#[tokio::test]
async fn test_queued_update_is_noop_when_not_submitted() {
    let backend = memory_backend();
    let instance = backend
        .create_job_instance(new_instance("payroll"))
        .await
        .unwrap();
    backend
        .update_job_instance_state(
            instance.instance_id,
            InstanceState::Dispatched,
            Utc::now().naive_utc(),
        )
        .await
        .unwrap();

    let unchanged = backend
        .update_job_instance_on_queued(instance.instance_id)
        .await
        .unwrap();
    assert_eq!(unchanged.instance_state, InstanceState::Dispatched);
}

#[tokio::test]
async fn test_restart_flow_carries_user_data_and_bumps_start_count() {
    let backend = memory_backend();
    let (instance_id, execution_id) = instance_with_execution(&backend).await;
    let top_level_key = StepThreadInstanceKey::top_level(instance_id, "load");
    let first = backend
        .create_top_level_step_execution_and_new_instance(execution_id, &top_level_key, false)
        .await
        .unwrap();

    // First attempt fails, leaving user data and a checkpoint behind.
    let mut snapshot = RuntimeStepSnapshot::new(first.step_execution_id, BatchStatus::Failed);
    snapshot.persistent_user_data = Some(vec![42]);
    backend.update_step_execution(&snapshot).await.unwrap();
    backend
        .update_step_thread_instance_checkpoint(&top_level_key, Some(vec![1, 2, 3]))
        .await
        .unwrap();
    backend
        .update_job_execution_and_instance_on_end(
            execution_id,
            BatchStatus::Failed,
            Some("FAILED"),
            Utc::now().naive_utc(),
        )
        .await
        .unwrap();

    backend
        .update_job_instance_on_restart(instance_id, Utc::now().naive_utc())
        .await
        .unwrap();
    let second_execution = backend
        .create_job_execution(instance_id, None, Utc::now().naive_utc())
        .await
        .unwrap();

    let restarted = backend
        .create_top_level_step_execution_on_restart(
            second_execution.execution_id,
            &top_level_key,
        )
        .await
        .unwrap();
    assert_eq!(restarted.batch_status, BatchStatus::Starting);
    assert_eq!(restarted.persistent_user_data, Some(vec![42]));
    assert_eq!(restarted.metrics, StepMetrics::zero());

    let thread_instance = backend
        .get_step_thread_instance(&top_level_key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(thread_instance.start_count, 2);
    assert_eq!(thread_instance.latest_execution_id, restarted.step_execution_id);
    assert_eq!(thread_instance.checkpoint_data, Some(vec![1, 2, 3]));
}

#[tokio::test]
async fn test_restart_and_clean_discards_history() {
    let backend = memory_backend();
    let (instance_id, execution_id) = instance_with_execution(&backend).await;
    let top_level_key = StepThreadInstanceKey::top_level(instance_id, "load");
    let first = backend
        .create_top_level_step_execution_and_new_instance(execution_id, &top_level_key, false)
        .await
        .unwrap();

    let mut snapshot = RuntimeStepSnapshot::new(first.step_execution_id, BatchStatus::Failed);
    snapshot.persistent_user_data = Some(vec![42]);
    backend.update_step_execution(&snapshot).await.unwrap();
    backend
        .update_step_thread_instance_checkpoint(&top_level_key, Some(vec![1, 2, 3]))
        .await
        .unwrap();

    let second_execution = backend
        .create_job_execution(instance_id, None, Utc::now().naive_utc())
        .await
        .unwrap();
    let clean = backend
        .create_top_level_step_execution_on_restart_and_clean(
            second_execution.execution_id,
            &top_level_key,
        )
        .await
        .unwrap();
    assert_eq!(clean.persistent_user_data, None);

    let thread_instance = backend
        .get_step_thread_instance(&top_level_key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(thread_instance.start_count, 2);
    assert!(thread_instance.checkpoint_data.is_none());
}

#[tokio::test]
async fn test_instance_restart_rejected_while_running() {
    let backend = memory_backend();
    let instance = backend
        .create_job_instance(new_instance("payroll"))
        .await
        .unwrap();
    let err = backend
        .update_job_instance_on_restart(instance.instance_id, Utc::now().naive_utc())
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::InstanceNotRestartable(_)));
}

#[tokio::test]
async fn test_instance_listing_and_names() {
    let backend = memory_backend();
    for _ in 0..3 {
        backend
            .create_job_instance(new_instance("payroll"))
            .await
            .unwrap();
    }
    let mut other = new_instance("inventory");
    other.submitter = Some("bob".to_string());
    backend.create_job_instance(other).await.unwrap();

    assert_eq!(backend.job_instance_count("payroll").await.unwrap(), 3);
    assert_eq!(
        backend
            .job_instance_count_for_submitter("payroll", "alice")
            .await
            .unwrap(),
        3
    );
    assert_eq!(
        backend
            .job_instance_count_for_submitter("payroll", "bob")
            .await
            .unwrap(),
        0
    );

    let names = backend.job_names_set().await.unwrap();
    assert_eq!(
        names.into_iter().collect::<Vec<_>>(),
        vec!["inventory".to_string(), "payroll".to_string()]
    );

    let page = backend.get_job_instances("payroll", 0, 2).await.unwrap();
    assert_eq!(page.len(), 2);
    let rest = backend.get_job_instances("payroll", 2, 2).await.unwrap();
    assert_eq!(rest.len(), 1);

    let bob_names = backend.job_names_set_for_submitter("bob").await.unwrap();
    assert!(bob_names.contains("inventory"));
    assert!(!bob_names.contains("payroll"));
}

#[tokio::test]
async fn test_not_found_errors() {
    let backend = memory_backend();
    assert!(matches!(
        backend.get_job_instance(99).await.unwrap_err(),
        BatchError::NoSuchJobInstance(99)
    ));
    assert!(matches!(
        backend.get_job_execution(99).await.unwrap_err(),
        BatchError::NoSuchJobExecution(99)
    ));
    assert!(matches!(
        backend.get_step_thread_execution(99).await.unwrap_err(),
        BatchError::UnknownStepExecution(99)
    ));
    let key = StepThreadInstanceKey::top_level(1, "load");
    assert!(backend.get_step_thread_instance(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_remotable_partition_dispatch_flow() {
    let backend = memory_backend();
    let (instance_id, execution_id) = instance_with_execution(&backend).await;
    let top_level_key = StepThreadInstanceKey::top_level(instance_id, "load");
    backend
        .create_top_level_step_execution_and_new_instance(execution_id, &top_level_key, true)
        .await
        .unwrap();

    let partition_key =
        batch_core::models::RemotablePartitionKey::new(execution_id, "load", 0);
    let partition = backend
        .create_remotable_partition(partition_key.clone())
        .await
        .unwrap()
        .expect("memory backend always supports partitions");
    assert_eq!(
        partition.internal_state,
        batch_core::models::RemotablePartitionState::Queued
    );

    let step_key = StepThreadInstanceKey::partition(instance_id, "load", 0);
    let step_execution = backend
        .create_partition_step_execution_and_new_instance(execution_id, &step_key, true)
        .await
        .unwrap();

    let state = backend
        .get_remotable_partition_internal_state(&partition_key)
        .await
        .unwrap();
    assert_eq!(
        state,
        Some(batch_core::models::RemotablePartitionState::Consumed)
    );

    let partitions = backend
        .get_remotable_partitions_for_job_execution(execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(partitions.len(), 1);
    assert_eq!(partitions[0].server_id, SERVER_A);
    assert_eq!(partitions[0].step_execution_id, Some(step_execution.step_execution_id));

    let updated = backend
        .update_remotable_partition_log_dir(&partition_key, "/logs/p0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.log_dir_path.as_deref(), Some("/logs/p0"));

    // A record that was never created is a tolerated absence, not an error.
    let missing = batch_core::models::RemotablePartitionKey::new(execution_id, "load", 9);
    assert!(backend
        .update_remotable_partition_log_dir(&missing, "/logs/p9")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_schema_versions_report_maximum() {
    let backend = memory_backend();
    assert_eq!(backend.schema_versions(), SchemaVersions::MAX);
    assert!(backend.schema_versions().supports_remotable_partitions());
}

#[tokio::test]
async fn test_store_survives_backend_restart() {
    let store = Arc::new(MemoryStore::new());
    let location = Arc::new(StaticLocation::new(SERVER_A, REST_A));
    let backend = MemoryPersistence::new(store.clone(), location.clone());
    let instance = backend
        .create_job_instance(new_instance("payroll"))
        .await
        .unwrap();
    drop(backend);

    // A new backend over the same store still sees the data.
    let revived = MemoryPersistence::new(store, location);
    let found = revived.get_job_instance(instance.instance_id).await.unwrap();
    assert_eq!(found.job_name, "payroll");
}

#[tokio::test]
async fn test_aggregate_from_execution_number() {
    let backend = memory_backend();
    let (instance_id, execution_id) = instance_with_execution(&backend).await;
    let top_level_key = StepThreadInstanceKey::top_level(instance_id, "load");
    let top_level = backend
        .create_top_level_step_execution_and_new_instance(execution_id, &top_level_key, false)
        .await
        .unwrap();

    let aggregate = backend
        .get_step_execution_aggregate_from_job_exec_num(instance_id, 0, "load")
        .await
        .unwrap();
    assert_eq!(
        aggregate.top_level.step_execution_id,
        top_level.step_execution_id
    );
    assert!(aggregate.partitions.is_empty());

    let err = backend
        .get_step_execution_aggregate_from_job_exec_num(instance_id, 7, "load")
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::IllegalState(_)));
}
