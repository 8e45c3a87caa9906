//! # Error Types
//!
//! Structured error handling for the batch persistence core using thiserror
//! instead of `Box<dyn Error>` patterns.
//!
//! The taxonomy distinguishes three families the caller must treat
//! differently:
//!
//! - **Not-found**: the referenced id is unknown to this store. Recoverable
//!   by the caller.
//! - **Benign races**: expected outcomes of multiple writers racing on the
//!   same execution (`ExecutionAssignedToServer`, `JobStopped`,
//!   `JobInstanceNotQueued`). Callers no-op or retry; see
//!   [`BatchError::is_benign_race`].
//! - **Fatal**: referential-integrity violations and unexpected store
//!   failures. Not retried.

use thiserror::Error;

use crate::models::status::{BatchStatus, InstanceState};

/// Error type for every operation of the persistence core.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("No job instance found for id = {0}")]
    NoSuchJobInstance(i64),

    #[error("No job execution found for id = {0}")]
    NoSuchJobExecution(i64),

    #[error("No step thread execution found for id = {0}")]
    UnknownStepExecution(i64),

    /// A status transition disallowed by the validator. Carries enough detail
    /// to reconstruct the failure in logs.
    #[error("Illegal batch status transition for entity {entity_id}: {from} -> {to}")]
    IllegalStatusTransition {
        entity_id: i64,
        from: BatchStatus,
        to: BatchStatus,
    },

    /// An instance state transition disallowed by the validator.
    #[error("Illegal instance state transition for instance {entity_id}: {from} -> {to}")]
    IllegalStateTransition {
        entity_id: i64,
        from: InstanceState,
        to: InstanceState,
    },

    /// Another dispatcher already claimed the execution before we could stop it.
    #[error("Job execution {0} has already been assigned to a server")]
    ExecutionAssignedToServer(i64),

    /// The execution left STARTING (e.g. was stopped) before dispatch stamped it.
    #[error("No job execution found for id = {0} and status = STARTING")]
    JobStopped(i64),

    /// The instance was no longer in the queued state when consume ran.
    #[error("Job instance {0} is not in the queued state")]
    JobInstanceNotQueued(i64),

    /// The instance is still in a non-final state and cannot be restarted.
    #[error("The job instance {0} cannot be restarted because it is still in a non-final state")]
    InstanceNotRestartable(i64),

    /// Referential-integrity violation; indicates a programming or
    /// data-corruption bug, never retried.
    #[error("Illegal persistence state: {0}")]
    IllegalState(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl BatchError {
    /// True for the expected, benign outcomes of multi-writer races.
    ///
    /// Callers use this to treat a conflict as a no-op rather than a fault.
    pub fn is_benign_race(&self) -> bool {
        matches!(
            self,
            Self::ExecutionAssignedToServer(_) | Self::JobStopped(_) | Self::JobInstanceNotQueued(_)
        )
    }

    /// True for the not-found family.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NoSuchJobInstance(_) | Self::NoSuchJobExecution(_) | Self::UnknownStepExecution(_)
        )
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }
}

pub type Result<T> = std::result::Result<T, BatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_race_classification() {
        assert!(BatchError::ExecutionAssignedToServer(7).is_benign_race());
        assert!(BatchError::JobStopped(7).is_benign_race());
        assert!(BatchError::JobInstanceNotQueued(7).is_benign_race());
        assert!(!BatchError::NoSuchJobInstance(7).is_benign_race());
        assert!(!BatchError::IllegalState("boom".into()).is_benign_race());
    }

    #[test]
    fn test_not_found_classification() {
        assert!(BatchError::NoSuchJobInstance(1).is_not_found());
        assert!(BatchError::NoSuchJobExecution(1).is_not_found());
        assert!(BatchError::UnknownStepExecution(1).is_not_found());
        assert!(!BatchError::JobStopped(1).is_not_found());
    }

    #[test]
    fn test_display_carries_ids() {
        let err = BatchError::IllegalStatusTransition {
            entity_id: 42,
            from: BatchStatus::Completed,
            to: BatchStatus::Started,
        };
        let rendered = err.to_string();
        assert!(rendered.contains("42"));
        assert!(rendered.contains("COMPLETED"));
        assert!(rendered.contains("STARTED"));
    }
}
