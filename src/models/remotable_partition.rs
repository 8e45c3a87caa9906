//! # Remotable Partition Model
//!
//! Cross-process dispatch record for a partition run on a different node than
//! the one that launched the job. Exists only when the backing schema has
//! partition support; callers must tolerate its absence.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::keys::RemotablePartitionKey;
use super::status::RemotablePartitionState;

/// Dispatch record for one remotely-dispatched partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotablePartition {
    pub key: RemotablePartitionKey,
    pub internal_state: RemotablePartitionState,
    /// Identity of the server that consumed the partition; empty while queued.
    pub server_id: String,
    pub rest_url: String,
    pub log_dir_path: Option<String>,
    pub last_updated: NaiveDateTime,
    /// The partition-level step thread execution, once one is created on the
    /// consuming server.
    pub step_execution_id: Option<i64>,
}

impl RemotablePartition {
    /// A freshly published partition awaiting dispatch.
    pub fn queued(key: RemotablePartitionKey, last_updated: NaiveDateTime) -> Self {
        Self {
            key,
            internal_state: RemotablePartitionState::Queued,
            server_id: String::new(),
            rest_url: String::new(),
            log_dir_path: None,
            last_updated,
            step_execution_id: None,
        }
    }

    /// Stamp the consuming server's identity and link the step execution.
    pub fn consume(
        &mut self,
        server_id: impl Into<String>,
        rest_url: impl Into<String>,
        step_execution_id: i64,
        now: NaiveDateTime,
    ) {
        self.server_id = server_id.into();
        self.rest_url = rest_url.into();
        self.step_execution_id = Some(step_execution_id);
        self.internal_state = RemotablePartitionState::Consumed;
        self.last_updated = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_queued_partition_defaults() {
        let now = Utc::now().naive_utc();
        let partition = RemotablePartition::queued(RemotablePartitionKey::new(7, "load", 2), now);
        assert_eq!(partition.internal_state, RemotablePartitionState::Queued);
        assert!(partition.server_id.is_empty());
        assert!(partition.step_execution_id.is_none());
    }

    #[test]
    fn test_consume_stamps_location() {
        let now = Utc::now().naive_utc();
        let mut partition =
            RemotablePartition::queued(RemotablePartitionKey::new(7, "load", 2), now);
        partition.consume("server-a", "https://host:9443/batch", 31, now);
        assert_eq!(partition.internal_state, RemotablePartitionState::Consumed);
        assert_eq!(partition.server_id, "server-a");
        assert_eq!(partition.step_execution_id, Some(31));
    }
}
