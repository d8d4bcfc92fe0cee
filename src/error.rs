//! Error Types
//!
//! Error taxonomy shared by the workflow, execution and batch layers:
//!
//! - [`ValidationError`]: malformed workflow graph, blocks `start`
//! - [`StepError`]: a node failed (handler, retry, wait, session)
//! - [`MutationError`]: a rejected mid-pause workflow update
//! - [`ControlError`]: a control command the execution cannot honor
//! - [`SchedulerError`], [`StoreError`], [`ConfigError`]: outer layers

use std::fmt;

use thiserror::Error;

use crate::workflow::policy::WaitTiming;

/// A single defect found while validating a workflow graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Workflow has no nodes")]
    EmptyWorkflow,

    #[error("Workflow has no start node")]
    MissingStartNode,

    #[error("Node has empty or whitespace-only ID")]
    EmptyNodeId,

    #[error("Duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    #[error("Node '{0}' has no type specified")]
    EmptyNodeType(String),

    #[error("Edge '{from}' -> '{to}' references unknown node '{missing}'")]
    DanglingEdge {
        from: String,
        to: String,
        missing: String,
    },

    #[error("Workflow contains cyclic dependencies involving node '{0}'")]
    CyclicDependency(String),
}

/// Every defect found in one validation pass. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, error: &ValidationError) -> bool {
        self.0.contains(error)
    }

    /// Renders each defect as its own message, for per-file reporting.
    pub fn messages(&self) -> Vec<String> {
        self.0.iter().map(|e| e.to_string()).collect()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.messages().join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

/// Failure reported by the automation session driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Element lookup failed: {0}")]
    Element(String),

    #[error("Script evaluation failed: {0}")]
    Script(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Session is closed")]
    Closed,

    #[error("Session unavailable: {0}")]
    Unavailable(String),
}

/// Failure of a single node.
///
/// Fatal to the execution unless absorbed by `failSilently`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("No handler registered for node type '{0}'")]
    NoHandler(String),

    #[error("{0}")]
    Failed(String),

    #[error("Retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("Condition not met within {timeout_ms}ms: {detail}")]
    ConditionTimeout { timeout_ms: u64, detail: String },

    #[error("Wait {timing} step failed: {message}")]
    Wait { timing: WaitTiming, message: String },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Execution cancelled")]
    Cancelled,
}

impl StepError {
    /// Shorthand for handler failures.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Rejected `update_workflow` call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    #[error("Workflow can only be updated while paused at a breakpoint")]
    NotPaused,

    #[error("Workflow cannot be updated during a wait pause")]
    WaitPause,

    #[error("Updated workflow is invalid: {0}")]
    Invalid(ValidationErrors),

    #[error("Updated workflow no longer contains the paused node '{0}'")]
    PausedNodeRemoved(String),

    #[error("Updated workflow rewrites already executed node '{0}'")]
    HistoryRewritten(String),

    #[error("New node '{node}' would have to run before paused node '{paused}'")]
    InsertedBeforePause { node: String, paused: String },
}

impl MutationError {
    /// Stable code the control surface reports to callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotPaused => "NOT_PAUSED",
            Self::WaitPause => "WAIT_PAUSE_NOT_EDITABLE",
            Self::Invalid(_) => "INVALID_WORKFLOW",
            Self::PausedNodeRemoved(_) => "PAUSED_NODE_REMOVED",
            Self::HistoryRewritten(_) => "HISTORY_REWRITTEN",
            Self::InsertedBeforePause { .. } => "INSERTED_BEFORE_PAUSE",
        }
    }
}

/// A control command the execution cannot honor in its current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("Execution is not paused")]
    NotPaused,

    #[error("Execution has already finished")]
    Finished,

    #[error(transparent)]
    Mutation(#[from] MutationError),
}

/// Errors surfaced by the [`ExecutionManager`](crate::batch::ExecutionManager).
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Execution '{0}' not found")]
    ExecutionNotFound(String),

    #[error("Batch '{0}' not found")]
    BatchNotFound(String),

    #[error("Batch request contains no workflows")]
    EmptyBatch,

    #[error("Failed to load workflows: {0}")]
    Source(String),

    #[error("Workflow is invalid: {0}")]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("Persistence store error: {0}")]
    Store(#[from] StoreError),
}

/// Persistence store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_display_joins_messages() {
        let errors = ValidationErrors(vec![
            ValidationError::EmptyWorkflow,
            ValidationError::MissingStartNode,
        ]);

        assert_eq!(errors.len(), 2);
        assert_eq!(
            errors.to_string(),
            "Workflow has no nodes; Workflow has no start node"
        );
    }

    #[test]
    fn test_dangling_edge_message() {
        let error = ValidationError::DanglingEdge {
            from: "a".to_string(),
            to: "ghost".to_string(),
            missing: "ghost".to_string(),
        };
        assert!(error.to_string().contains("unknown node 'ghost'"));
    }

    #[test]
    fn test_mutation_error_codes_are_distinct() {
        let codes = [
            MutationError::NotPaused.code(),
            MutationError::WaitPause.code(),
            MutationError::Invalid(ValidationErrors(vec![])).code(),
            MutationError::PausedNodeRemoved("x".into()).code(),
            MutationError::HistoryRewritten("x".into()).code(),
        ];
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
        assert_eq!(MutationError::WaitPause.code(), "WAIT_PAUSE_NOT_EDITABLE");
    }

    #[test]
    fn test_step_error_from_session_error() {
        let error: StepError = SessionError::Closed.into();
        assert_eq!(error.to_string(), "Session is closed");
        assert!(!error.is_cancelled());
        assert!(StepError::Cancelled.is_cancelled());
    }
}
