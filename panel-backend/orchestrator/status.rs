use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Lifecycle status of a flow run as tracked by the panel.
///
/// Mirrors the orchestrator's state types plus two local pseudo-states:
/// `NotStarted` (nothing launched yet) and `Stopped` (cancellation was
/// requested but the orchestrator has not confirmed a terminal state).
/// State types the panel does not know about collapse into `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RunStatus {
    #[default]
    NotStarted,
    Scheduled,
    Pending,
    Running,
    Retrying,
    Paused,
    Cancelling,
    Stopped,
    Completed,
    Failed,
    Cancelled,
    Crashed,
    Unknown,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::NotStarted => "NOT_STARTED",
            RunStatus::Scheduled => "SCHEDULED",
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Retrying => "RETRYING",
            RunStatus::Paused => "PAUSED",
            RunStatus::Cancelling => "CANCELLING",
            RunStatus::Stopped => "STOPPED",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
            RunStatus::Crashed => "CRASHED",
            RunStatus::Unknown => "UNKNOWN",
        }
    }

    /// Parse an orchestrator state type. Matching is case-insensitive.
    pub fn from_state_type(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "NOT_STARTED" => RunStatus::NotStarted,
            "SCHEDULED" => RunStatus::Scheduled,
            "PENDING" => RunStatus::Pending,
            "RUNNING" => RunStatus::Running,
            "RETRYING" => RunStatus::Retrying,
            "PAUSED" => RunStatus::Paused,
            "CANCELLING" => RunStatus::Cancelling,
            "STOPPED" => RunStatus::Stopped,
            "COMPLETED" => RunStatus::Completed,
            "FAILED" => RunStatus::Failed,
            "CANCELLED" => RunStatus::Cancelled,
            "CRASHED" => RunStatus::Crashed,
            _ => RunStatus::Unknown,
        }
    }

    /// No further transition happens from a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled | RunStatus::Crashed
        )
    }

    /// The orchestrator still considers the run in flight.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RunStatus::Running
                | RunStatus::Pending
                | RunStatus::Scheduled
                | RunStatus::Retrying
                | RunStatus::Paused
                | RunStatus::Cancelling
        )
    }

    /// A stop request makes sense from this status.
    pub fn is_stoppable(self) -> bool {
        self.is_active() && self != RunStatus::Cancelling
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RunStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RunStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(RunStatus::from_state_type(&raw))
    }
}
