//! Execution State
//!
//! Status, pause bookkeeping and the serializable snapshot of one run. The
//! snapshot is what control-surface readers see and what the batch store
//! persists as the execution record.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one execution.
///
/// `Idle -> Running -> {Completed | Error | Stopped}`, with
/// `Running <-> Paused` in between.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Error,
    Stopped,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Stopped)
    }

    /// Running or paused.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// Why an execution is paused.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum PauseReason {
    #[default]
    None,
    /// Operator breakpoint; the workflow may be edited
    Breakpoint,
    /// Workflow-defined pause from a wait step; not editable
    WaitPause,
}

/// Which side of a node a pause happened on.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Checkpoint {
    Pre,
    Post,
}

/// Point-in-time view of one execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSnapshot {
    pub id: String,
    pub workflow_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub current_node_id: Option<String>,
    #[serde(default)]
    pub paused_node_id: Option<String>,
    #[serde(default)]
    pub pause_reason: PauseReason,
    /// Append-only, in execution order
    #[serde(default)]
    pub executed_node_ids: Vec<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub stop_requested: bool,
    #[serde(default)]
    pub trace_logging: bool,
    /// Bumped by every accepted mid-pause workflow update
    #[serde(default)]
    pub order_version: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionSnapshot {
    pub fn new(id: impl Into<String>, workflow_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            workflow_name: workflow_name.into(),
            batch_id: None,
            status: ExecutionStatus::Idle,
            current_node_id: None,
            paused_node_id: None,
            pause_reason: PauseReason::None,
            executed_node_ids: Vec::new(),
            last_error: None,
            stop_requested: false,
            trace_logging: false,
            order_version: 0,
            started_at: None,
            finished_at: None,
        }
    }

    /// Run time so far, or total run time once finished.
    pub fn duration_ms(&self) -> Option<i64> {
        let started = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some((end - started).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(!ExecutionStatus::Idle.is_terminal());
        assert!(ExecutionStatus::Paused.is_active());
        assert!(ExecutionStatus::Stopped.is_terminal());
        assert!(!ExecutionStatus::Error.is_active());
        assert_eq!(ExecutionStatus::Completed.to_string(), "completed");
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let mut snapshot = ExecutionSnapshot::new("exec-1", "login");
        snapshot.status = ExecutionStatus::Paused;
        snapshot.pause_reason = PauseReason::WaitPause;
        snapshot.executed_node_ids.push("start".into());

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["status"], "paused");
        assert_eq!(json["pauseReason"], "waitPause");
        assert_eq!(json["executedNodeIds"][0], "start");
        assert!(json.get("batchId").is_none());

        let back: ExecutionSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn test_duration_requires_start() {
        let mut snapshot = ExecutionSnapshot::new("e", "w");
        assert_eq!(snapshot.duration_ms(), None);

        let now = Utc::now();
        snapshot.started_at = Some(now - chrono::Duration::milliseconds(1500));
        snapshot.finished_at = Some(now);
        assert_eq!(snapshot.duration_ms(), Some(1500));
    }
}
