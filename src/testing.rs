//! Test fixtures shared by the unit tests of every module.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::automation::{AutomationSession, SessionFactory, StepHandler};
use crate::error::{SessionError, StepError};
use crate::execution::{ExecutionContext, ExecutionStatus, ExecutorHandle};
use crate::lock;
use crate::workflow::{Node, Workflow};

/// Scriptable in-memory session.
#[derive(Debug, Default)]
pub struct FakeSession {
    visible: Mutex<HashMap<String, bool>>,
    scripts: Mutex<HashMap<String, bool>>,
    url: Mutex<String>,
    url_reads: AtomicUsize,
    closes: AtomicUsize,
    fail_close: AtomicBool,
}

impl FakeSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_visible(&self, selector: &str, visible: bool) {
        lock(&self.visible).insert(selector.to_string(), visible);
    }

    pub fn set_url(&self, url: &str) {
        *lock(&self.url) = url.to_string();
    }

    /// Registers a script result; unregistered scripts fail to evaluate.
    pub fn set_script(&self, script: &str, result: bool) {
        lock(&self.scripts).insert(script.to_string(), result);
    }

    pub fn url_reads(&self) -> usize {
        self.url_reads.load(Ordering::SeqCst)
    }

    pub fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }
}

#[async_trait]
impl AutomationSession for FakeSession {
    async fn is_element_visible(&self, selector: &str) -> Result<bool, SessionError> {
        Ok(lock(&self.visible).get(selector).copied().unwrap_or(false))
    }

    async fn current_url(&self) -> Result<String, SessionError> {
        self.url_reads.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.url).clone())
    }

    async fn evaluate_predicate(&self, script: &str, _argument: Option<&Value>) -> Result<bool, SessionError> {
        lock(&self.scripts)
            .get(script)
            .copied()
            .ok_or_else(|| SessionError::Script(format!("unknown script '{}'", script)))
    }

    async fn reload(&self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn bring_to_front(&self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(SessionError::Unavailable("driver crashed".into()));
        }
        Ok(())
    }
}

/// Hands out [`FakeSession`]s and keeps them for inspection.
#[derive(Debug, Default)]
pub struct FakeSessionFactory {
    opened: Mutex<Vec<(String, Arc<FakeSession>)>>,
}

impl FakeSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self) -> Vec<(String, Arc<FakeSession>)> {
        lock(&self.opened).clone()
    }
}

#[async_trait]
impl SessionFactory for FakeSessionFactory {
    async fn open(&self, execution_id: &str) -> Result<Arc<dyn AutomationSession>, SessionError> {
        let session = Arc::new(FakeSession::new());
        lock(&self.opened).push((execution_id.to_string(), Arc::clone(&session)));
        Ok(session)
    }
}

/// Records the node ids it was invoked for.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    calls: Mutex<Vec<String>>,
    result: Value,
    delay: Option<Duration>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn returning(result: Value) -> Self {
        Self {
            result,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl StepHandler for RecordingHandler {
    async fn execute(&self, node: &Node, ctx: &ExecutionContext) -> Result<Value, StepError> {
        lock(&self.calls).push(node.id.clone());
        if let Some(delay) = self.delay {
            ctx.sleep(delay).await?;
        }
        Ok(self.result.clone())
    }
}

/// Fails a fixed number of times, then succeeds.
#[derive(Debug)]
pub struct FailingHandler {
    failures: Option<usize>,
    attempts: AtomicUsize,
}

impl FailingHandler {
    pub fn always() -> Self {
        Self {
            failures: None,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn failing_times(failures: usize) -> Self {
        Self {
            failures: Some(failures),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepHandler for FailingHandler {
    async fn execute(&self, node: &Node, _ctx: &ExecutionContext) -> Result<Value, StepError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        match self.failures {
            None => Err(StepError::failed(format!("{} always fails", node.id))),
            Some(failures) if attempt <= failures => {
                Err(StepError::failed(format!("{} failed attempt {}", node.id, attempt)))
            }
            Some(_) => Ok(Value::Null),
        }
    }
}

pub fn test_context() -> ExecutionContext {
    ExecutionContext::new(
        "test",
        Arc::new(FakeSession::new()),
        CancellationToken::new(),
        Arc::new(AtomicBool::new(false)),
    )
}

/// `start -> ids[0] -> ids[1] -> ...`, every step of type `click`.
pub fn linear_workflow(ids: &[&str]) -> Workflow {
    let mut workflow = Workflow::named("linear").with_node(Node::start("start"));
    let mut previous = "start".to_string();
    for id in ids {
        workflow = workflow.with_node(Node::new(*id, "click")).connect(previous, *id);
        previous = id.to_string();
    }
    workflow
}

/// Polls until the execution reaches `status`; panics after five seconds.
pub async fn wait_for_status(handle: &ExecutorHandle, status: ExecutionStatus) {
    wait_until(|| handle.status() == status).await;
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
