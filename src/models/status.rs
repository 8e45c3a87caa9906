//! Batch status and instance state definitions.
//!
//! `BatchStatus` carries the standard job/step lifecycle values;
//! `InstanceState` adds the dispatch-path states a job instance moves through
//! before any execution starts running. Both are stored as upper-case strings
//! by the durable backend.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a job execution, job instance, or step thread execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// Created but not yet running
    Starting,
    /// Currently running
    Started,
    /// Stop was requested, still winding down
    Stopping,
    /// Stopped before completion
    Stopped,
    /// Ended in failure
    Failed,
    /// Ended successfully
    Completed,
    /// Marked abandoned by an operator; nothing further is permitted
    Abandoned,
}

impl BatchStatus {
    /// Check if this is a "done" status (no more processing will happen).
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Stopped | Self::Failed | Self::Completed | Self::Abandoned
        )
    }

    /// Check if this is a running-like status (in flight on some server).
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Starting | Self::Started | Self::Stopping)
    }

    /// The statuses recovery scans for at startup.
    pub const RUNNING_STATUSES: [BatchStatus; 3] =
        [Self::Starting, Self::Started, Self::Stopping];
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "STARTING"),
            Self::Started => write!(f, "STARTED"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Abandoned => write!(f, "ABANDONED"),
        }
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTING" => Ok(Self::Starting),
            "STARTED" => Ok(Self::Started),
            "STOPPING" => Ok(Self::Stopping),
            "STOPPED" => Ok(Self::Stopped),
            "FAILED" => Ok(Self::Failed),
            "COMPLETED" => Ok(Self::Completed),
            "ABANDONED" => Ok(Self::Abandoned),
            _ => Err(format!("Invalid batch status: {s}")),
        }
    }
}

/// State of a job instance across its whole life, including the dispatch
/// states that precede any execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    /// Initial state on submission
    Submitted,
    /// Placed on the dispatch queue
    JmsQueued,
    /// Taken off the dispatch queue by an endpoint
    JmsConsumed,
    /// Handed to an executor on some server
    Dispatched,
    Failed,
    Stopped,
    Completed,
    Abandoned,
}

impl InstanceState {
    /// Check if this is a "done" state.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Stopped | Self::Failed | Self::Completed | Self::Abandoned
        )
    }

    /// The instance state matching a final batch status, used when the final
    /// execution status is propagated onto the owning instance.
    pub fn from_final_batch_status(status: BatchStatus) -> Option<Self> {
        match status {
            BatchStatus::Stopped => Some(Self::Stopped),
            BatchStatus::Failed => Some(Self::Failed),
            BatchStatus::Completed => Some(Self::Completed),
            BatchStatus::Abandoned => Some(Self::Abandoned),
            _ => None,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::JmsQueued => write!(f, "JMS_QUEUED"),
            Self::JmsConsumed => write!(f, "JMS_CONSUMED"),
            Self::Dispatched => write!(f, "DISPATCHED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Abandoned => write!(f, "ABANDONED"),
        }
    }
}

impl std::str::FromStr for InstanceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUBMITTED" => Ok(Self::Submitted),
            "JMS_QUEUED" => Ok(Self::JmsQueued),
            "JMS_CONSUMED" => Ok(Self::JmsConsumed),
            "DISPATCHED" => Ok(Self::Dispatched),
            "FAILED" => Ok(Self::Failed),
            "STOPPED" => Ok(Self::Stopped),
            "COMPLETED" => Ok(Self::Completed),
            "ABANDONED" => Ok(Self::Abandoned),
            _ => Err(format!("Invalid instance state: {s}")),
        }
    }
}

/// Internal dispatch state of a remotable partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemotablePartitionState {
    /// Published for dispatch, not yet picked up
    Queued,
    /// Picked up by an executor
    Consumed,
    /// Resolved by startup recovery after an unclean shutdown
    Recovered,
}

impl fmt::Display for RemotablePartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "QUEUED"),
            Self::Consumed => write!(f, "CONSUMED"),
            Self::Recovered => write!(f, "RECOVERED"),
        }
    }
}

impl std::str::FromStr for RemotablePartitionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "CONSUMED" => Ok(Self::Consumed),
            "RECOVERED" => Ok(Self::Recovered),
            _ => Err(format!("Invalid remotable partition state: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_status_check() {
        assert!(BatchStatus::Completed.is_final());
        assert!(BatchStatus::Failed.is_final());
        assert!(BatchStatus::Stopped.is_final());
        assert!(BatchStatus::Abandoned.is_final());
        assert!(!BatchStatus::Starting.is_final());
        assert!(!BatchStatus::Started.is_final());
        assert!(!BatchStatus::Stopping.is_final());
    }

    #[test]
    fn test_running_statuses() {
        for status in BatchStatus::RUNNING_STATUSES {
            assert!(status.is_running());
            assert!(!status.is_final());
        }
        assert!(!BatchStatus::Failed.is_running());
    }

    #[test]
    fn test_status_string_conversion() {
        assert_eq!(BatchStatus::Starting.to_string(), "STARTING");
        assert_eq!("COMPLETED".parse::<BatchStatus>().unwrap(), BatchStatus::Completed);
        assert_eq!(InstanceState::JmsQueued.to_string(), "JMS_QUEUED");
        assert_eq!(
            "JMS_CONSUMED".parse::<InstanceState>().unwrap(),
            InstanceState::JmsConsumed
        );
        assert!("bogus".parse::<BatchStatus>().is_err());
    }

    #[test]
    fn test_instance_state_from_final_batch_status() {
        assert_eq!(
            InstanceState::from_final_batch_status(BatchStatus::Completed),
            Some(InstanceState::Completed)
        );
        assert_eq!(
            InstanceState::from_final_batch_status(BatchStatus::Failed),
            Some(InstanceState::Failed)
        );
        assert_eq!(InstanceState::from_final_batch_status(BatchStatus::Started), None);
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&BatchStatus::Stopping).unwrap();
        assert_eq!(json, "\"STOPPING\"");
        let parsed: BatchStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, BatchStatus::Stopping);

        let json = serde_json::to_string(&RemotablePartitionState::Recovered).unwrap();
        assert_eq!(json, "\"RECOVERED\"");
    }
}
