//! Pause and Breakpoint Control
//!
//! Breakpoint policy plus the commands an operator sends to a paused
//! execution. Commands travel over a channel to the executor's run loop,
//! which is the only place execution state changes.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::MutationError;
use crate::workflow::{Node, Workflow};

use super::state::Checkpoint;

/// Which nodes breakpoints apply to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum BreakpointScope {
    /// Every node pauses
    All,
    /// Only nodes with `breakpoint: true`
    #[default]
    Marked,
}

/// Where around a node breakpoints pause.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum BreakpointCheckpoint {
    #[default]
    Pre,
    Post,
    Both,
}

impl BreakpointCheckpoint {
    pub fn includes(&self, checkpoint: Checkpoint) -> bool {
        matches!(
            (self, checkpoint),
            (Self::Both, _) | (Self::Pre, Checkpoint::Pre) | (Self::Post, Checkpoint::Post)
        )
    }
}

/// Global breakpoint switch and policy.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakpointSettings {
    pub enabled: bool,
    pub scope: BreakpointScope,
    pub checkpoint: BreakpointCheckpoint,
}

impl BreakpointSettings {
    /// Pauses before nodes marked with `breakpoint: true`.
    pub fn marked() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Pauses around every node.
    pub fn all() -> Self {
        Self {
            enabled: true,
            scope: BreakpointScope::All,
            ..Self::default()
        }
    }

    pub fn at(mut self, checkpoint: BreakpointCheckpoint) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn applies(&self, node: &Node, checkpoint: Checkpoint) -> bool {
        self.enabled
            && self.checkpoint.includes(checkpoint)
            && (self.scope == BreakpointScope::All || node.breakpoint)
    }
}

/// Operator command delivered to a paused execution.
#[derive(Debug)]
pub(crate) enum ControlCommand {
    /// Resume; breakpoints stay armed
    Continue,
    /// Resume and treat the paused node as completed without running it
    Skip,
    /// Resume and suppress every later breakpoint of this run
    DisableBreakpoints,
    /// Replace the workflow; the execution stays paused
    UpdateWorkflow {
        workflow: Box<Workflow>,
        reply: oneshot::Sender<Result<(), MutationError>>,
    },
}

/// How a pause ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PauseResolution {
    Continue,
    Skip,
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_never_applies() {
        let settings = BreakpointSettings::default();
        let node = Node::new("a", "click").with_breakpoint();
        assert!(!settings.applies(&node, Checkpoint::Pre));
    }

    #[test]
    fn test_marked_scope() {
        let settings = BreakpointSettings::marked();
        let marked = Node::new("a", "click").with_breakpoint();
        let plain = Node::new("b", "click");

        assert!(settings.applies(&marked, Checkpoint::Pre));
        assert!(!settings.applies(&marked, Checkpoint::Post));
        assert!(!settings.applies(&plain, Checkpoint::Pre));
    }

    #[test]
    fn test_all_scope_both_checkpoints() {
        let settings = BreakpointSettings::all().at(BreakpointCheckpoint::Both);
        let plain = Node::new("b", "click");

        assert!(settings.applies(&plain, Checkpoint::Pre));
        assert!(settings.applies(&plain, Checkpoint::Post));
    }

    #[test]
    fn test_settings_from_yaml() {
        let settings: BreakpointSettings =
            serde_yaml::from_str("enabled: true\ncheckpoint: post\n").unwrap();
        assert_eq!(settings.scope, BreakpointScope::Marked);
        assert!(BreakpointCheckpoint::Post.includes(Checkpoint::Post));
        assert_eq!(settings.checkpoint, BreakpointCheckpoint::Post);
    }
}
