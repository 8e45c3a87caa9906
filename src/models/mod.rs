pub mod aggregate;
pub mod job_execution;
pub mod job_instance;
pub mod keys;
pub mod metrics;
pub mod remotable_partition;
pub mod snapshot;
pub mod status;
pub mod step_thread_execution;
pub mod step_thread_instance;

// Re-export core models for easy access
pub use aggregate::{PartitionStepAggregate, StepThreadExecutionAggregate};
pub use job_execution::JobExecution;
pub use job_instance::{JobInstance, NewJobInstance};
pub use keys::{RemotablePartitionKey, StepThreadInstanceKey, TOP_LEVEL_PARTITION_NUMBER};
pub use metrics::StepMetrics;
pub use remotable_partition::RemotablePartition;
pub use snapshot::RuntimeStepSnapshot;
pub use status::{BatchStatus, InstanceState, RemotablePartitionState};
pub use step_thread_execution::StepThreadExecution;
pub use step_thread_instance::StepThreadInstance;
