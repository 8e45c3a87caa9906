//! Step execution metrics.
//!
//! Six independent counters per step thread execution. A top-level execution's
//! aggregate is recomputed on demand from its own counters plus every sibling
//! partition execution's, never maintained incrementally.

use serde::{Deserialize, Serialize};

/// The six chunk-processing counters tracked per step thread execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub read_count: i64,
    pub write_count: i64,
    pub commit_count: i64,
    pub rollback_count: i64,
    pub read_skip_count: i64,
    pub write_skip_count: i64,
}

impl StepMetrics {
    pub fn zero() -> Self {
        Self::default()
    }

    /// Add another execution's counters into this one.
    pub fn add(&mut self, other: &StepMetrics) {
        self.read_count += other.read_count;
        self.write_count += other.write_count;
        self.commit_count += other.commit_count;
        self.rollback_count += other.rollback_count;
        self.read_skip_count += other.read_skip_count;
        self.write_skip_count += other.write_skip_count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_metrics() {
        let metrics = StepMetrics::zero();
        assert_eq!(metrics.read_count, 0);
        assert_eq!(metrics.write_skip_count, 0);
    }

    #[test]
    fn test_add_accumulates_all_counters() {
        let mut top = StepMetrics {
            read_count: 1,
            write_count: 2,
            commit_count: 3,
            rollback_count: 4,
            read_skip_count: 5,
            write_skip_count: 6,
        };
        let partition = StepMetrics {
            read_count: 10,
            write_count: 20,
            commit_count: 30,
            rollback_count: 40,
            read_skip_count: 50,
            write_skip_count: 60,
        };
        top.add(&partition);
        assert_eq!(top.read_count, 11);
        assert_eq!(top.write_count, 22);
        assert_eq!(top.commit_count, 33);
        assert_eq!(top.rollback_count, 44);
        assert_eq!(top.read_skip_count, 55);
        assert_eq!(top.write_skip_count, 66);
    }
}
