//! # Runtime Step Snapshot
//!
//! The value the step engine hands to the persistence core when it wants a
//! step thread execution's state persisted verbatim.
//!
//! The metrics carry a committed baseline alongside the live counters: the
//! durable backend promotes the live counters to the baseline only after its
//! transaction commits, and rolls them back to the baseline on any other
//! outcome. That keeps partially-written counters from leaking into a retry.

use chrono::NaiveDateTime;
use parking_lot::Mutex;

use super::metrics::StepMetrics;
use super::status::BatchStatus;

struct MetricsLedger {
    live: StepMetrics,
    committed: StepMetrics,
}

/// Snapshot of one running step thread execution, supplied by the step engine.
pub struct RuntimeStepSnapshot {
    pub step_execution_id: i64,
    pub batch_status: BatchStatus,
    pub exit_status: Option<String>,
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
    pub persistent_user_data: Option<Vec<u8>>,
    metrics: Mutex<MetricsLedger>,
}

impl RuntimeStepSnapshot {
    pub fn new(step_execution_id: i64, batch_status: BatchStatus) -> Self {
        Self {
            step_execution_id,
            batch_status,
            exit_status: None,
            start_time: None,
            end_time: None,
            persistent_user_data: None,
            metrics: Mutex::new(MetricsLedger {
                live: StepMetrics::zero(),
                committed: StepMetrics::zero(),
            }),
        }
    }

    /// Current live counters.
    pub fn metrics(&self) -> StepMetrics {
        self.metrics.lock().live
    }

    /// Replace the live counters (the step engine owns the arithmetic).
    pub fn record_metrics(&self, metrics: StepMetrics) {
        self.metrics.lock().live = metrics;
    }

    /// Promote the live counters to the committed baseline. Called by the
    /// durable backend after a successful commit.
    pub fn commit_metrics(&self) {
        let mut ledger = self.metrics.lock();
        ledger.committed = ledger.live;
    }

    /// Discard uncommitted counter changes, restoring the last committed
    /// baseline. Called on any non-commit transaction outcome.
    pub fn rollback_metrics(&self) {
        let mut ledger = self.metrics.lock();
        ledger.live = ledger.committed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_promotes_baseline() {
        let snapshot = RuntimeStepSnapshot::new(1, BatchStatus::Started);
        snapshot.record_metrics(StepMetrics {
            read_count: 5,
            ..StepMetrics::zero()
        });
        snapshot.commit_metrics();
        snapshot.record_metrics(StepMetrics {
            read_count: 9,
            ..StepMetrics::zero()
        });
        snapshot.rollback_metrics();
        assert_eq!(snapshot.metrics().read_count, 5);
    }

    #[test]
    fn test_rollback_without_commit_returns_to_zero() {
        let snapshot = RuntimeStepSnapshot::new(1, BatchStatus::Started);
        snapshot.record_metrics(StepMetrics {
            write_count: 3,
            ..StepMetrics::zero()
        });
        snapshot.rollback_metrics();
        assert_eq!(snapshot.metrics(), StepMetrics::zero());
    }
}
