//! Execution Events
//!
//! The engine reports progress as a stream of [`ExecutionEvent`]s pushed
//! into an [`EventSink`]. Emission is fire-and-forget: sinks must not
//! block and cannot fail the run.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::execution::state::{Checkpoint, PauseReason};
use crate::lock;

/// What happened.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum EventKind {
    RunStart {
        workflow: String,
        total_nodes: usize,
    },
    StepStart {
        node_id: String,
        node_type: String,
    },
    StepComplete {
        node_id: String,
        skipped: bool,
        duration_ms: u64,
    },
    StepBypassed {
        node_id: String,
    },
    StepError {
        node_id: String,
        error: String,
    },
    Paused {
        node_id: String,
        reason: PauseReason,
        checkpoint: Checkpoint,
    },
    Resumed {
        node_id: String,
    },
    RunComplete {
        duration_ms: u64,
    },
    RunError {
        error: String,
    },
    RunStopped,
}

impl EventKind {
    /// Wire name of the event, e.g. `step-start`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunStart { .. } => "run-start",
            Self::StepStart { .. } => "step-start",
            Self::StepComplete { .. } => "step-complete",
            Self::StepBypassed { .. } => "step-bypassed",
            Self::StepError { .. } => "step-error",
            Self::Paused { .. } => "paused",
            Self::Resumed { .. } => "resumed",
            Self::RunComplete { .. } => "run-complete",
            Self::RunError { .. } => "run-error",
            Self::RunStopped => "run-stopped",
        }
    }

    /// Node the event refers to, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::StepStart { node_id, .. }
            | Self::StepComplete { node_id, .. }
            | Self::StepBypassed { node_id }
            | Self::StepError { node_id, .. }
            | Self::Paused { node_id, .. }
            | Self::Resumed { node_id } => Some(node_id),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunComplete { .. } | Self::RunError { .. } | Self::RunStopped
        )
    }
}

/// One event of one execution.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ExecutionEvent {
    pub fn new(execution_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            execution_id: execution_id.into(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Consumer of execution events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ExecutionEvent);

    /// Called once per execution during cleanup.
    fn flush(&self) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: ExecutionEvent) {}
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: ExecutionEvent) {
        let id = &event.execution_id;
        match &event.kind {
            EventKind::RunStart {
                workflow,
                total_nodes,
            } => info!("[{}] Started '{}' ({} nodes)", id, workflow, total_nodes),
            EventKind::StepStart { node_id, node_type } => {
                info!("[{}] Running: {} ({})", id, node_id, node_type)
            }
            EventKind::StepComplete {
                node_id,
                skipped: true,
                ..
            } => info!("[{}] Skipped: {}", id, node_id),
            EventKind::StepComplete {
                node_id,
                duration_ms,
                ..
            } => info!("[{}] Completed: {} ({} ms)", id, node_id, duration_ms),
            EventKind::StepBypassed { node_id } => info!("[{}] Bypassed: {}", id, node_id),
            EventKind::StepError { node_id, error: e } => {
                error!("[{}] Failed: {} - {}", id, node_id, e)
            }
            EventKind::Paused {
                node_id,
                reason,
                checkpoint,
            } => warn!(
                "[{}] Paused at {} ({:?}, {:?})",
                id, node_id, reason, checkpoint
            ),
            EventKind::Resumed { node_id } => info!("[{}] Resumed at {}", id, node_id),
            EventKind::RunComplete { duration_ms } => {
                info!("[{}] Workflow completed in {} ms", id, duration_ms)
            }
            EventKind::RunError { error: e } => error!("[{}] Workflow failed: {}", id, e),
            EventKind::RunStopped => warn!("[{}] Workflow stopped", id),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<ExecutionEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ExecutionEvent> {
        lock(&self.events).clone()
    }

    /// Events of one execution, in emission order.
    pub fn events_for(&self, execution_id: &str) -> Vec<EventKind> {
        lock(&self.events)
            .iter()
            .filter(|e| e.execution_id == execution_id)
            .map(|e| e.kind.clone())
            .collect()
    }

    /// Event names of one execution, e.g. `["run-start", "run-complete"]`.
    pub fn names_for(&self, execution_id: &str) -> Vec<&'static str> {
        lock(&self.events)
            .iter()
            .filter(|e| e.execution_id == execution_id)
            .map(|e| e.kind.name())
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: ExecutionEvent) {
        lock(&self.events).push(event);
    }
}

/// Forwards events to an unbounded channel, e.g. for a UI bridge.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: ExecutionEvent) {
        if self.sender.send(event).is_err() {
            debug!("Event receiver dropped; discarding event");
        }
    }
}

/// Fans every event out to several sinks.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: ExecutionEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }

    fn flush(&self) {
        for sink in &self.sinks {
            sink.flush();
        }
    }
}
