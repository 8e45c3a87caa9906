//! Transition validation for batch statuses and instance states.
//!
//! The guard is deliberately narrow rather than a full lifecycle state
//! machine: once a value reaches COMPLETED the only permitted move is to
//! ABANDONED, and ABANDONED permits nothing. Every other source value may
//! move to any target. This exact permissiveness is part of the contract;
//! do not tighten it.
//!
//! Call one of these before every status-mutating write. The writes that
//! skip validation on purpose (restart-on, job name/JSL, log dir,
//! checkpoint, plan size, group names, and the conditional-update guards for
//! server assignment and queued-to-consumed) are enumerated at their call
//! sites.

use crate::error::{BatchError, Result};
use crate::models::status::{BatchStatus, InstanceState};

/// Validate a batch status change for a job execution, job instance, or step
/// thread execution identified by `entity_id`.
pub fn verify_status_transition(
    entity_id: i64,
    current: BatchStatus,
    target: BatchStatus,
) -> Result<()> {
    let allowed = match current {
        BatchStatus::Completed => target == BatchStatus::Abandoned,
        BatchStatus::Abandoned => false,
        _ => true,
    };
    if allowed {
        Ok(())
    } else {
        Err(BatchError::IllegalStatusTransition {
            entity_id,
            from: current,
            to: target,
        })
    }
}

/// Validate an instance state change for the job instance `entity_id`.
pub fn verify_state_transition(
    entity_id: i64,
    current: InstanceState,
    target: InstanceState,
) -> Result<()> {
    let allowed = match current {
        InstanceState::Completed => target == InstanceState::Abandoned,
        InstanceState::Abandoned => false,
        _ => true,
    };
    if allowed {
        Ok(())
    } else {
        Err(BatchError::IllegalStateTransition {
            entity_id,
            from: current,
            to: target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_STATUSES: [BatchStatus; 7] = [
        BatchStatus::Starting,
        BatchStatus::Started,
        BatchStatus::Stopping,
        BatchStatus::Stopped,
        BatchStatus::Failed,
        BatchStatus::Completed,
        BatchStatus::Abandoned,
    ];

    const ALL_STATES: [InstanceState; 8] = [
        InstanceState::Submitted,
        InstanceState::JmsQueued,
        InstanceState::JmsConsumed,
        InstanceState::Dispatched,
        InstanceState::Failed,
        InstanceState::Stopped,
        InstanceState::Completed,
        InstanceState::Abandoned,
    ];

    #[test]
    fn test_completed_only_allows_abandoned() {
        assert!(verify_status_transition(1, BatchStatus::Completed, BatchStatus::Abandoned).is_ok());
        for target in ALL_STATUSES {
            if target != BatchStatus::Abandoned {
                let err = verify_status_transition(1, BatchStatus::Completed, target).unwrap_err();
                assert!(matches!(
                    err,
                    crate::error::BatchError::IllegalStatusTransition { entity_id: 1, .. }
                ));
            }
        }
    }

    #[test]
    fn test_abandoned_is_terminal() {
        for target in ALL_STATUSES {
            assert!(verify_status_transition(1, BatchStatus::Abandoned, target).is_err());
        }
        for target in ALL_STATES {
            assert!(verify_state_transition(1, InstanceState::Abandoned, target).is_err());
        }
    }

    #[test]
    fn test_instance_state_completed_only_allows_abandoned() {
        assert!(
            verify_state_transition(1, InstanceState::Completed, InstanceState::Abandoned).is_ok()
        );
        assert!(
            verify_state_transition(1, InstanceState::Completed, InstanceState::Failed).is_err()
        );
    }

    proptest! {
        // Any non-terminal source permits any target, including "backward"
        // moves like STARTED -> STARTING. That looseness is contractual.
        #[test]
        fn prop_non_terminal_status_allows_any_target(from in 0usize..7, to in 0usize..7) {
            let current = ALL_STATUSES[from];
            let target = ALL_STATUSES[to];
            prop_assume!(current != BatchStatus::Completed && current != BatchStatus::Abandoned);
            prop_assert!(verify_status_transition(9, current, target).is_ok());
        }

        #[test]
        fn prop_non_terminal_state_allows_any_target(from in 0usize..8, to in 0usize..8) {
            let current = ALL_STATES[from];
            let target = ALL_STATES[to];
            prop_assume!(current != InstanceState::Completed && current != InstanceState::Abandoned);
            prop_assert!(verify_state_transition(9, current, target).is_ok());
        }
    }
}
