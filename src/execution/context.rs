//! Per-Execution Context
//!
//! Everything a handler may touch during one run: the automation session,
//! a data store keyed by node id, a variable store used for `{{name}}`
//! interpolation, and the run's cancellation token.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::automation::AutomationSession;
use crate::error::StepError;
use crate::lock;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder regex should be valid")
});

/// State shared by the steps of one execution.
pub struct ExecutionContext {
    execution_id: String,
    session: Arc<dyn AutomationSession>,
    data: Mutex<HashMap<String, Value>>,
    variables: Mutex<HashMap<String, Value>>,
    cancel: CancellationToken,
    trace: Arc<AtomicBool>,
    pause_requested: AtomicBool,
}

impl ExecutionContext {
    pub fn new(
        execution_id: impl Into<String>,
        session: Arc<dyn AutomationSession>,
        cancel: CancellationToken,
        trace: Arc<AtomicBool>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            session,
            data: Mutex::new(HashMap::new()),
            variables: Mutex::new(HashMap::new()),
            cancel,
            trace,
            pause_requested: AtomicBool::new(false),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn session(&self) -> &Arc<dyn AutomationSession> {
        &self.session
    }

    pub fn set_data(&self, key: impl Into<String>, value: Value) {
        lock(&self.data).insert(key.into(), value);
    }

    pub fn data(&self, key: &str) -> Option<Value> {
        lock(&self.data).get(key).cloned()
    }

    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        lock(&self.variables).insert(name.into(), value);
    }

    pub fn variable(&self, name: &str) -> Option<Value> {
        lock(&self.variables).get(name).cloned()
    }

    /// Snapshot of the variable store.
    pub fn variables(&self) -> HashMap<String, Value> {
        lock(&self.variables).clone()
    }

    /// Replaces `{{name}}` placeholders with variable values.
    ///
    /// Strings are inserted verbatim, other values as JSON. Unknown names
    /// are left untouched.
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::sync::atomic::AtomicBool;
    /// use flowpilot::automation::DetachedSession;
    /// use flowpilot::execution::ExecutionContext;
    /// use tokio_util::sync::CancellationToken;
    ///
    /// let ctx = ExecutionContext::new(
    ///     "exec-1",
    ///     Arc::new(DetachedSession::new()),
    ///     CancellationToken::new(),
    ///     Arc::new(AtomicBool::new(false)),
    /// );
    /// ctx.set_variable("count", serde_json::json!(3));
    /// assert_eq!(ctx.interpolate("{{count}} of {{total}}"), "3 of {{total}}");
    /// ```
    pub fn interpolate(&self, template: &str) -> String {
        if !template.contains("{{") {
            return template.to_string();
        }

        let variables = lock(&self.variables);
        PLACEHOLDER
            .replace_all(template, |caps: &Captures| match variables.get(&caps[1]) {
                Some(Value::String(text)) => text.clone(),
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }

    /// Asks the executor to enter a wait-pause once the current handler
    /// returns successfully.
    pub fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    /// Consumes a pending pause request.
    pub fn take_pause_request(&self) -> bool {
        self.pause_requested.swap(false, Ordering::SeqCst)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn trace_enabled(&self) -> bool {
        self.trace.load(Ordering::Relaxed)
    }

    /// Sleeps unless the execution is stopped first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), StepError> {
        cancellable_sleep(&self.cancel, duration).await
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("execution_id", &self.execution_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Sleeps for `duration`, returning [`StepError::Cancelled`] as soon as
/// the token fires.
pub async fn cancellable_sleep(cancel: &CancellationToken, duration: Duration) -> Result<(), StepError> {
    if cancel.is_cancelled() {
        return Err(StepError::Cancelled);
    }
    if duration.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(StepError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Drives `operation` unless the token fires first.
pub async fn run_cancellable<T, F>(cancel: &CancellationToken, operation: F) -> Result<T, StepError>
where
    F: Future<Output = Result<T, StepError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StepError::Cancelled),
        result = operation => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_context;
    use serde_json::json;
    use std::time::Instant;

    #[test]
    fn test_data_and_variables() {
        let ctx = test_context();
        ctx.set_data("query-1", json!({ "rows": 2 }));
        ctx.set_variable("name", json!("ada"));

        assert_eq!(ctx.data("query-1"), Some(json!({ "rows": 2 })));
        assert_eq!(ctx.data("missing"), None);
        assert_eq!(ctx.variables().len(), 1);
    }

    #[test]
    fn test_interpolate() {
        let ctx = test_context();
        ctx.set_variable("user", json!("ada"));
        ctx.set_variable("id", json!(42));
        ctx.set_variable("flags", json!({ "beta": true }));

        assert_eq!(ctx.interpolate("plain"), "plain");
        assert_eq!(ctx.interpolate("/users/{{ user }}/{{id}}"), "/users/ada/42");
        assert_eq!(ctx.interpolate("{{flags}}"), r#"{"beta":true}"#);
        assert_eq!(ctx.interpolate("{{missing}}!"), "{{missing}}!");
    }

    #[test]
    fn test_pause_request_is_consumed() {
        let ctx = test_context();
        assert!(!ctx.take_pause_request());
        ctx.request_pause();
        assert!(ctx.take_pause_request());
        assert!(!ctx.take_pause_request());
    }

    #[tokio::test]
    async fn test_sleep_interrupted_by_cancel() {
        let ctx = test_context();
        let token = ctx.cancellation().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let started = Instant::now();
        assert_eq!(ctx.sleep(Duration::from_secs(10)).await, Err(StepError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_run_cancellable() {
        let cancel = CancellationToken::new();
        let done = run_cancellable(&cancel, async { Ok::<_, StepError>(1) }).await;
        assert_eq!(done, Ok(1));

        cancel.cancel();
        let pending = run_cancellable(&cancel, futures_util::future::pending::<Result<i32, StepError>>());
        assert_eq!(pending.await, Err(StepError::Cancelled));
    }
}
