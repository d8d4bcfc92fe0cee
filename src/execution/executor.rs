//! Execution State Machine
//!
//! An [`Executor`] drives one workflow run through its execution order:
//!
//! ```text
//! Idle -> Running -> { Completed | Error | Stopped }
//!           ^   |
//!           |   v
//!          Paused   (breakpoint or wait-pause)
//! ```
//!
//! The run loop owns all execution state. Operators talk to it through an
//! [`ExecutorHandle`]: control commands go over a channel and are only
//! honored while paused, and `stop` cancels a token that every suspension
//! point (handler calls, retry backoff, wait polling, pauses) listens to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::automation::{AutomationSession, HandlerRegistry};
use crate::error::{ControlError, MutationError, StepError, ValidationErrors};
use crate::lock;
use crate::monitoring::{EventKind, EventSink, ExecutionEvent};
use crate::workflow::{ExecutionOrder, Node, Workflow};

use super::context::ExecutionContext;
use super::control::{BreakpointSettings, ControlCommand, PauseResolution};
use super::state::{Checkpoint, ExecutionSnapshot, ExecutionStatus, PauseReason};
use super::step::StepRunner;
use super::wait::DEFAULT_POLL_INTERVAL;

/// Per-execution settings.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub breakpoints: BreakpointSettings,
    pub trace_logging: bool,
    pub wait_poll_interval: Duration,
    /// Owning batch, if any
    pub batch_id: Option<String>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            breakpoints: BreakpointSettings::default(),
            trace_logging: false,
            wait_poll_interval: DEFAULT_POLL_INTERVAL,
            batch_id: None,
        }
    }
}

impl ExecutorOptions {
    pub fn with_breakpoints(mut self, breakpoints: BreakpointSettings) -> Self {
        self.breakpoints = breakpoints;
        self
    }

    pub fn with_trace(mut self, enabled: bool) -> Self {
        self.trace_logging = enabled;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.wait_poll_interval = interval;
        self
    }

    pub fn in_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }
}

/// State shared between the run loop and its handles.
struct Shared {
    id: String,
    snapshot: Mutex<ExecutionSnapshot>,
    commands: mpsc::UnboundedSender<ControlCommand>,
    cancel: CancellationToken,
    trace: Arc<AtomicBool>,
    session: Mutex<Option<Arc<dyn AutomationSession>>>,
    sink: Arc<dyn EventSink>,
}

impl Shared {
    fn snapshot(&self) -> ExecutionSnapshot {
        lock(&self.snapshot).clone()
    }

    fn update<R>(&self, f: impl FnOnce(&mut ExecutionSnapshot) -> R) -> R {
        f(&mut lock(&self.snapshot))
    }

    fn emit(&self, kind: EventKind) {
        self.sink.emit(ExecutionEvent::new(self.id.clone(), kind));
    }

    /// Releases the session and flushes the sink. Safe to call repeatedly;
    /// failures are logged and never escalate.
    async fn cleanup(&self) {
        let session = lock(&self.session).take();
        if let Some(session) = session {
            debug!("[{}] Closing automation session", self.id);
            if let Err(e) = session.close().await {
                warn!("[{}] Failed to close automation session: {}", self.id, e);
            }
        }
        self.sink.flush();
    }
}

/// Control surface of one execution. Cheap to clone.
#[derive(Clone)]
pub struct ExecutorHandle {
    shared: Arc<Shared>,
}

impl ExecutorHandle {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        self.shared.snapshot()
    }

    pub fn status(&self) -> ExecutionStatus {
        lock(&self.shared.snapshot).status
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    fn pause_reason(&self) -> Result<PauseReason, ControlError> {
        let snapshot = lock(&self.shared.snapshot);
        match snapshot.status {
            ExecutionStatus::Paused => Ok(snapshot.pause_reason),
            status if status.is_terminal() => Err(ControlError::Finished),
            _ => Err(ControlError::NotPaused),
        }
    }

    fn send(&self, command: ControlCommand) -> Result<(), ControlError> {
        self.shared
            .commands
            .send(command)
            .map_err(|_| ControlError::Finished)
    }

    /// Resumes a paused execution; breakpoints stay armed.
    pub fn continue_execution(&self) -> Result<(), ControlError> {
        self.pause_reason()?;
        self.send(ControlCommand::Continue)
    }

    /// Resumes, treating the node paused before as completed without
    /// running it. At a post-node pause this is the same as continuing.
    pub fn skip_next_node(&self) -> Result<(), ControlError> {
        self.pause_reason()?;
        self.send(ControlCommand::Skip)
    }

    /// Resumes and suppresses every later breakpoint of this run.
    pub fn disable_breakpoints_and_continue(&self) -> Result<(), ControlError> {
        self.pause_reason()?;
        self.send(ControlCommand::DisableBreakpoints)
    }

    /// Replaces the workflow while paused at a breakpoint.
    ///
    /// The execution stays paused; the next resume continues from the
    /// paused node's position in the re-anchored order.
    pub async fn update_workflow(&self, workflow: Workflow) -> Result<(), ControlError> {
        match self.pause_reason() {
            Ok(PauseReason::Breakpoint) => {}
            Ok(PauseReason::WaitPause) => return Err(MutationError::WaitPause.into()),
            Ok(PauseReason::None) | Err(ControlError::NotPaused) => {
                return Err(MutationError::NotPaused.into())
            }
            Err(e) => return Err(e),
        }

        let (reply, response) = oneshot::channel();
        self.send(ControlCommand::UpdateWorkflow {
            workflow: Box::new(workflow),
            reply,
        })?;

        match response.await {
            Ok(result) => result.map_err(ControlError::from),
            Err(_) => Err(MutationError::NotPaused.into()),
        }
    }

    pub fn set_trace_logging(&self, enabled: bool) {
        self.shared.trace.store(enabled, Ordering::Relaxed);
        self.shared.update(|s| s.trace_logging = enabled);
        info!(
            "[{}] Trace logging {}",
            self.shared.id,
            if enabled { "enabled" } else { "disabled" }
        );
    }

    /// Requests a stop and runs cleanup, whatever the current state.
    ///
    /// Returns true if the execution had not finished yet.
    pub async fn stop(&self) -> bool {
        let was_active = self.shared.update(|s| {
            s.stop_requested = true;
            !s.status.is_terminal()
        });
        info!("[{}] Stop requested", self.shared.id);
        self.shared.cancel.cancel();
        self.shared.cleanup().await;
        was_active
    }
}

/// How the run loop ended.
enum RunEnd {
    Completed,
    Failed(StepError),
    Stopped,
}

/// Runs one workflow.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use flowpilot::automation::{DetachedSession, HandlerRegistry};
/// use flowpilot::execution::{Executor, ExecutorOptions};
/// use flowpilot::monitoring::LogSink;
/// use flowpilot::workflow::load_workflow;
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
/// let workflow = load_workflow("login.json")?;
/// let mut executor = Executor::new(
///     "exec-1",
///     workflow,
///     Arc::new(HandlerRegistry::with_builtins()),
///     Arc::new(LogSink),
///     ExecutorOptions::default(),
/// );
/// executor.start()?;
/// let report = executor.run(Arc::new(DetachedSession::new())).await;
/// println!("Finished with status {}", report.status);
/// # Ok(())
/// # }
/// ```
pub struct Executor {
    workflow: Workflow,
    order: Option<ExecutionOrder>,
    registry: Arc<HandlerRegistry>,
    options: ExecutorOptions,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<ControlCommand>,
    breakpoints_suppressed: bool,
    started: Option<Instant>,
}

impl Executor {
    pub fn new(
        id: impl Into<String>,
        workflow: Workflow,
        registry: Arc<HandlerRegistry>,
        sink: Arc<dyn EventSink>,
        options: ExecutorOptions,
    ) -> Self {
        let id = id.into();
        let (sender, commands) = mpsc::unbounded_channel();

        let mut snapshot = ExecutionSnapshot::new(id.clone(), workflow.name.clone());
        snapshot.batch_id = options.batch_id.clone();
        snapshot.trace_logging = options.trace_logging;

        let shared = Arc::new(Shared {
            id,
            snapshot: Mutex::new(snapshot),
            commands: sender,
            cancel: CancellationToken::new(),
            trace: Arc::new(AtomicBool::new(options.trace_logging)),
            session: Mutex::new(None),
            sink,
        });

        Self {
            workflow,
            order: None,
            registry,
            options,
            shared,
            commands,
            breakpoints_suppressed: false,
            started: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn handle(&self) -> ExecutorHandle {
        ExecutorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        lock(&self.shared.snapshot).status
    }

    /// Validates the workflow, computes the execution order and enters
    /// `Running`.
    ///
    /// An invalid workflow is reported with every defect and the execution
    /// stays `Idle`.
    pub fn start(&mut self) -> Result<(), ValidationErrors> {
        if self.status() != ExecutionStatus::Idle {
            debug!("[{}] Already started", self.id());
            return Ok(());
        }

        let order = ExecutionOrder::compute(&self.workflow).map_err(|errors| {
            warn!(
                "[{}] Workflow '{}' is invalid: {}",
                self.id(),
                self.workflow.name,
                errors
            );
            self.shared.update(|s| s.last_error = Some(errors.to_string()));
            errors
        })?;

        let total_nodes = order.len();
        self.order = Some(order);
        self.started = Some(Instant::now());
        self.shared.update(|s| {
            s.status = ExecutionStatus::Running;
            s.started_at = Some(Utc::now());
        });
        self.shared.emit(EventKind::RunStart {
            workflow: self.workflow.name.clone(),
            total_nodes,
        });
        Ok(())
    }

    /// Drives the run to a terminal status and returns the final snapshot.
    ///
    /// Starts the execution first if [`start`](Self::start) was not called.
    pub async fn run(mut self, session: Arc<dyn AutomationSession>) -> ExecutionSnapshot {
        *lock(&self.shared.session) = Some(Arc::clone(&session));

        let end = if self.status() == ExecutionStatus::Idle && self.start().is_err() {
            let message = self
                .shared
                .update(|s| s.last_error.clone())
                .unwrap_or_else(|| "Workflow is invalid".to_string());
            RunEnd::Failed(StepError::Failed(message))
        } else {
            let ctx = ExecutionContext::new(
                self.shared.id.clone(),
                session,
                self.shared.cancel.clone(),
                Arc::clone(&self.shared.trace),
            );
            self.run_loop(&ctx).await
        };

        self.finish(end).await
    }

    /// Ends the execution with `Error` without running any node, e.g. when
    /// no session could be opened for it.
    pub async fn fail(self, error: StepError) -> ExecutionSnapshot {
        let end = if self.shared.cancel.is_cancelled() {
            RunEnd::Stopped
        } else {
            RunEnd::Failed(error)
        };
        self.finish(end).await
    }

    async fn run_loop(&mut self, ctx: &ExecutionContext) -> RunEnd {
        let registry = Arc::clone(&self.registry);
        let mut index = 0;

        loop {
            let Some(node_id) = self.order_id(index) else {
                return RunEnd::Completed;
            };

            if self.shared.cancel.is_cancelled() {
                return RunEnd::Stopped;
            }

            let Some(mut node) = self.workflow.get_node(&node_id).cloned() else {
                return RunEnd::Failed(StepError::failed(format!(
                    "Node '{}' is missing from the workflow",
                    node_id
                )));
            };
            self.shared
                .update(|s| s.current_node_id = Some(node_id.clone()));

            // Entry points carry no behavior of their own
            if node.is_start() {
                self.record_executed(&node_id);
                index += 1;
                continue;
            }

            if node.bypass {
                debug!("[{}] Bypassing '{}'", self.id(), node_id);
                self.shared.emit(EventKind::StepBypassed { node_id });
                index += 1;
                continue;
            }

            if self.breakpoint_applies(&node, Checkpoint::Pre) {
                let resolution = self
                    .pause(index, PauseReason::Breakpoint, Checkpoint::Pre)
                    .await;
                index = self.position_of(&node_id, index);

                match resolution {
                    PauseResolution::Stopped => return RunEnd::Stopped,
                    PauseResolution::Skip => {
                        self.complete(&node_id, true, Duration::ZERO);
                        index += 1;
                        continue;
                    }
                    PauseResolution::Continue => {
                        if let Some(updated) = self.workflow.get_node(&node_id) {
                            node = updated.clone();
                        }
                    }
                }
            }

            self.shared.emit(EventKind::StepStart {
                node_id: node_id.clone(),
                node_type: node.node_type.clone(),
            });

            let step_started = Instant::now();
            let result = StepRunner::new(&registry, ctx)
                .with_poll_interval(self.options.wait_poll_interval)
                .execute(&node)
                .await;
            let duration = step_started.elapsed();

            if let Err(e) = result {
                if e.is_cancelled() || self.shared.cancel.is_cancelled() {
                    return RunEnd::Stopped;
                }
                self.shared.update(|s| s.last_error = Some(e.to_string()));
                self.shared.emit(EventKind::StepError {
                    node_id,
                    error: e.to_string(),
                });
                return RunEnd::Failed(e);
            }

            if ctx.take_pause_request() {
                let resolution = self
                    .pause(index, PauseReason::WaitPause, Checkpoint::Post)
                    .await;
                if resolution == PauseResolution::Stopped {
                    self.complete(&node_id, false, duration);
                    return RunEnd::Stopped;
                }
            }

            if self.breakpoint_applies(&node, Checkpoint::Post) {
                let resolution = self
                    .pause(index, PauseReason::Breakpoint, Checkpoint::Post)
                    .await;
                index = self.position_of(&node_id, index);
                if resolution == PauseResolution::Stopped {
                    self.complete(&node_id, false, duration);
                    return RunEnd::Stopped;
                }
            }

            self.complete(&node_id, false, duration);
            index += 1;
        }
    }

    fn order_id(&self, index: usize) -> Option<String> {
        self.order
            .as_ref()
            .and_then(|order| order.get(index))
            .map(str::to_string)
    }

    fn position_of(&self, node_id: &str, fallback: usize) -> usize {
        self.order
            .as_ref()
            .and_then(|order| order.position(node_id))
            .unwrap_or(fallback)
    }

    fn breakpoint_applies(&self, node: &Node, checkpoint: Checkpoint) -> bool {
        !self.breakpoints_suppressed && self.options.breakpoints.applies(node, checkpoint)
    }

    fn record_executed(&self, node_id: &str) {
        self.shared.update(|s| {
            if !s.executed_node_ids.iter().any(|id| id == node_id) {
                s.executed_node_ids.push(node_id.to_string());
            }
        });
    }

    fn complete(&self, node_id: &str, skipped: bool, duration: Duration) {
        self.shared.emit(EventKind::StepComplete {
            node_id: node_id.to_string(),
            skipped,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        });
        self.record_executed(node_id);
    }

    /// Blocks until an operator resumes or the execution is stopped.
    ///
    /// There is no timeout; the session stays held while paused.
    async fn pause(&mut self, index: usize, reason: PauseReason, checkpoint: Checkpoint) -> PauseResolution {
        let Some(node_id) = self.order_id(index) else {
            return PauseResolution::Continue;
        };

        // Commands sent before this pause began must not resolve it
        while let Ok(stale) = self.commands.try_recv() {
            reject_stale(stale);
        }

        self.shared.update(|s| {
            s.status = ExecutionStatus::Paused;
            s.paused_node_id = Some(node_id.clone());
            s.pause_reason = reason;
        });
        self.shared.emit(EventKind::Paused {
            node_id: node_id.clone(),
            reason,
            checkpoint,
        });

        let cancel = self.shared.cancel.clone();
        let mut index = index;
        let resolution = loop {
            let command = tokio::select! {
                _ = cancel.cancelled() => None,
                command = self.commands.recv() => command,
            };

            match command {
                None => break PauseResolution::Stopped,
                Some(ControlCommand::Continue) => break PauseResolution::Continue,
                Some(ControlCommand::Skip) if checkpoint == Checkpoint::Pre => {
                    info!("[{}] Skipping '{}'", self.id(), node_id);
                    break PauseResolution::Skip;
                }
                Some(ControlCommand::Skip) => break PauseResolution::Continue,
                Some(ControlCommand::DisableBreakpoints) => {
                    info!("[{}] Breakpoints disabled for the rest of the run", self.id());
                    self.breakpoints_suppressed = true;
                    break PauseResolution::Continue;
                }
                Some(ControlCommand::UpdateWorkflow { workflow, reply }) => {
                    let result = self.apply_update(*workflow, index, reason);
                    if result.is_ok() {
                        index = self.position_of(&node_id, index);
                    }
                    if reply.send(result).is_err() {
                        debug!("[{}] Update caller went away", self.id());
                    }
                }
            }
        };

        if resolution != PauseResolution::Stopped {
            self.shared.update(|s| {
                s.status = ExecutionStatus::Running;
                s.paused_node_id = None;
                s.pause_reason = PauseReason::None;
            });

            let session = lock(&self.shared.session).clone();
            if let Some(session) = session {
                if let Err(e) = session.bring_to_front().await {
                    debug!("[{}] Could not focus session after resume: {}", self.id(), e);
                }
            }
            self.shared.emit(EventKind::Resumed { node_id });
        }

        resolution
    }

    fn apply_update(&mut self, workflow: Workflow, paused_index: usize, reason: PauseReason) -> Result<(), MutationError> {
        if reason == PauseReason::WaitPause {
            return Err(MutationError::WaitPause);
        }
        let order = self.order.as_ref().ok_or(MutationError::NotPaused)?;
        let executed = self.shared.update(|s| s.executed_node_ids.clone());

        let anchored = order.anchored(&workflow, paused_index, &executed).map_err(|e| {
            warn!("[{}] Workflow update rejected ({}): {}", self.shared.id, e.code(), e);
            e
        })?;

        info!(
            "[{}] Workflow updated mid-pause: {} nodes, order v{}",
            self.shared.id,
            workflow.len(),
            anchored.version()
        );
        let version = anchored.version();
        self.workflow = workflow;
        self.order = Some(anchored);
        self.shared.update(|s| s.order_version = version);
        Ok(())
    }

    async fn finish(self, end: RunEnd) -> ExecutionSnapshot {
        let duration_ms = self
            .started
            .map(|t| u64::try_from(t.elapsed().as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);

        let kind = match end {
            RunEnd::Completed => {
                info!("[{}] Completed in {} ms", self.id(), duration_ms);
                self.shared.update(|s| s.status = ExecutionStatus::Completed);
                EventKind::RunComplete { duration_ms }
            }
            RunEnd::Failed(e) => {
                error!("[{}] Failed: {}", self.id(), e);
                let message = e.to_string();
                self.shared.update(|s| {
                    s.status = ExecutionStatus::Error;
                    s.last_error = Some(message.clone());
                });
                EventKind::RunError { error: message }
            }
            RunEnd::Stopped => {
                info!("[{}] Stopped", self.id());
                self.shared.update(|s| {
                    s.status = ExecutionStatus::Stopped;
                    s.stop_requested = true;
                });
                EventKind::RunStopped
            }
        };

        self.shared.update(|s| {
            s.finished_at = Some(Utc::now());
            s.paused_node_id = None;
            s.pause_reason = PauseReason::None;
        });
        self.shared.emit(kind);
        self.shared.cleanup().await;
        self.shared.snapshot()
    }
}

fn reject_stale(command: ControlCommand) {
    match command {
        ControlCommand::UpdateWorkflow { reply, .. } => {
            let _ = reply.send(Err(MutationError::NotPaused));
        }
        other => debug!("Discarding stale command {:?}", other),
    }
}
