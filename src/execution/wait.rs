//! Wait Coordinator
//!
//! Runs the waits a node declares before or after its handler. Each
//! declared kind (selector, URL, script) becomes one polling task with its
//! own timeout. Tasks run concurrently by default, or one after another in
//! the fixed order selector, URL, script.

use std::time::{Duration, Instant};

use futures_util::future::{join_all, try_join_all};
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::automation::AutomationSession;
use crate::error::StepError;
use crate::workflow::policy::{ElementState, ScriptWait, SelectorWait, UrlWait};
use crate::workflow::{Condition, WaitSpec, WaitStrategy, WaitTiming};

use super::condition::{url_pattern, ConditionEvaluator};
use super::context::cancellable_sleep;
use super::outcome::StepOutcome;
use super::TRACE_TARGET;

/// Default interval between condition polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One declared wait, borrowed from its spec.
#[derive(Debug, Clone, Copy)]
enum WaitTask<'s> {
    Selector(&'s SelectorWait),
    Url(&'s UrlWait),
    Script(&'s ScriptWait),
}

impl WaitTask<'_> {
    fn describe(&self) -> String {
        match self {
            Self::Selector(w) => {
                let state = match w.state {
                    ElementState::Visible => "visible",
                    ElementState::Hidden => "hidden",
                };
                format!("selector '{}' to be {}", w.selector, state)
            }
            Self::Url(w) => format!("URL matching '{}'", w.pattern),
            Self::Script(_) => "script condition".to_string(),
        }
    }

    fn timeout(&self) -> Duration {
        let ms = match self {
            Self::Selector(w) => w.timeout_ms,
            Self::Url(w) => w.timeout_ms,
            Self::Script(w) => w.timeout_ms,
        };
        Duration::from_millis(ms)
    }

    /// Rejects blank declarations and turns the wait into a condition.
    fn condition(&self) -> Result<Condition, String> {
        match self {
            Self::Selector(w) => {
                let selector = w.selector.trim();
                if selector.is_empty() {
                    return Err("selector is empty".to_string());
                }
                Ok(match w.state {
                    ElementState::Visible => Condition::ElementVisible {
                        selector: selector.to_string(),
                    },
                    ElementState::Hidden => Condition::ElementHidden {
                        selector: selector.to_string(),
                    },
                })
            }
            Self::Url(w) => {
                let pattern = w.pattern.trim();
                if pattern.is_empty() {
                    return Err("URL pattern is empty".to_string());
                }
                url_pattern(pattern).map_err(|e| format!("invalid URL pattern '{}': {}", pattern, e))?;
                Ok(Condition::UrlMatches {
                    pattern: pattern.to_string(),
                })
            }
            Self::Script(w) => {
                if w.script.trim().is_empty() {
                    return Err("script is empty".to_string());
                }
                Ok(Condition::Script {
                    script: w.script.clone(),
                })
            }
        }
    }
}

fn tasks(spec: &WaitSpec) -> Vec<WaitTask<'_>> {
    let mut tasks = Vec::with_capacity(3);
    if let Some(w) = &spec.selector {
        tasks.push(WaitTask::Selector(w));
    }
    if let Some(w) = &spec.url {
        tasks.push(WaitTask::Url(w));
    }
    if let Some(w) = &spec.script {
        tasks.push(WaitTask::Script(w));
    }
    tasks
}

/// Executes wait specs against one session.
pub struct WaitCoordinator<'a> {
    session: &'a dyn AutomationSession,
    cancel: &'a CancellationToken,
    poll_interval: Duration,
    trace: bool,
}

impl<'a> WaitCoordinator<'a> {
    pub fn new(session: &'a dyn AutomationSession, cancel: &'a CancellationToken) -> Self {
        Self {
            session,
            cancel,
            poll_interval: DEFAULT_POLL_INTERVAL,
            trace: false,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Runs every wait declared by `spec`.
    pub async fn execute_waits(&self, spec: &WaitSpec) -> StepOutcome<()> {
        let tasks = tasks(spec);
        if tasks.is_empty() {
            return StepOutcome::Success(());
        }

        debug!(
            "Running {} {} wait(s) ({:?})",
            tasks.len(),
            spec.timing,
            spec.strategy
        );

        let errors = match spec.strategy {
            WaitStrategy::Parallel if spec.fail_silently => {
                join_all(tasks.iter().map(|task| self.run(*task, spec.timing)))
                    .await
                    .into_iter()
                    .filter_map(Result::err)
                    .collect()
            }
            WaitStrategy::Parallel => {
                match try_join_all(tasks.iter().map(|task| self.run(*task, spec.timing))).await {
                    Ok(_) => Vec::new(),
                    Err(e) => vec![e],
                }
            }
            WaitStrategy::Sequential => {
                let mut errors = Vec::new();
                for task in &tasks {
                    if let Err(e) = self.run(*task, spec.timing).await {
                        let fatal = !spec.fail_silently || e.is_cancelled();
                        errors.push(e);
                        if fatal {
                            break;
                        }
                    }
                }
                errors
            }
        };

        if let Some(cancelled) = errors.iter().find(|e| e.is_cancelled()) {
            return StepOutcome::Failure(cancelled.clone());
        }

        let mut errors = errors.into_iter();
        match errors.next() {
            None => StepOutcome::Success(()),
            Some(first) => {
                if spec.fail_silently {
                    warn!("Ignoring failed wait: {}", first);
                    for other in errors {
                        warn!("Ignoring failed wait: {}", other);
                    }
                }
                StepOutcome::from_error(first, spec.fail_silently)
            }
        }
    }

    /// Polls one wait until it holds or its timeout elapses.
    async fn run(&self, task: WaitTask<'_>, timing: WaitTiming) -> Result<(), StepError> {
        let wait_error = |message: String| StepError::Wait { timing, message };

        let condition = task.condition().map_err(wait_error)?;
        let evaluator = ConditionEvaluator::new(self.session).with_trace(self.trace);
        let timeout = task.timeout();
        let started = Instant::now();

        loop {
            let check = evaluator.evaluate(&condition, None).await;
            if check.met {
                if self.trace {
                    info!(
                        target: TRACE_TARGET,
                        "{} wait for {} satisfied after {} ms",
                        timing,
                        task.describe(),
                        started.elapsed().as_millis()
                    );
                }
                return Ok(());
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(wait_error(format!(
                    "timed out after {} ms waiting for {} ({})",
                    timeout.as_millis(),
                    task.describe(),
                    check.detail
                )));
            }

            let pause = self.poll_interval.min(timeout - elapsed);
            cancellable_sleep(self.cancel, pause).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSession;
    use std::sync::Arc;

    fn coordinator<'a>(session: &'a FakeSession, cancel: &'a CancellationToken) -> WaitCoordinator<'a> {
        WaitCoordinator::new(session, cancel).with_poll_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_empty_spec_succeeds() {
        let session = FakeSession::new();
        let cancel = CancellationToken::new();
        let outcome = coordinator(&session, &cancel)
            .execute_waits(&WaitSpec::before())
            .await;
        assert_eq!(outcome, StepOutcome::Success(()));
    }

    #[tokio::test]
    async fn test_parallel_waits_all_met() {
        let session = FakeSession::new();
        session.set_visible("#form", true);
        session.set_url("https://app.test/login");
        session.set_script("document.ready", true);
        let cancel = CancellationToken::new();

        let spec = WaitSpec::before()
            .with_selector("#form", 200)
            .with_url("/login", 200)
            .with_script("document.ready", 200);

        let outcome = coordinator(&session, &cancel).execute_waits(&spec).await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_wait_becomes_true_while_polling() {
        let session = Arc::new(FakeSession::new());
        let cancel = CancellationToken::new();
        let toggler = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            toggler.set_visible("#late", true);
        });

        let spec = WaitSpec::after().with_selector("#late", 2_000);
        let outcome = coordinator(&session, &cancel).execute_waits(&spec).await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_timeout_message_is_timing_qualified() {
        let session = FakeSession::new();
        let cancel = CancellationToken::new();
        let spec = WaitSpec::after().with_selector("#missing", 30);

        match coordinator(&session, &cancel).execute_waits(&spec).await {
            StepOutcome::Failure(error) => {
                let message = error.to_string();
                assert!(message.starts_with("Wait after step failed"), "{}", message);
                assert!(message.contains("#missing"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hidden_selector_wait() {
        let session = FakeSession::new();
        let cancel = CancellationToken::new();
        let spec = WaitSpec::before().with_hidden_selector("#spinner", 50);

        assert!(coordinator(&session, &cancel).execute_waits(&spec).await.is_success());
    }

    #[tokio::test]
    async fn test_blank_declarations_are_errors() {
        let session = FakeSession::new();
        let cancel = CancellationToken::new();

        for spec in [
            WaitSpec::before().with_selector("  ", 100),
            WaitSpec::before().with_url("", 100),
            WaitSpec::before().with_script(" ", 100),
        ] {
            let outcome = coordinator(&session, &cancel).execute_waits(&spec).await;
            assert!(outcome.is_failure(), "{:?}", spec);

            let silent = coordinator(&session, &cancel).execute_waits(&spec.silent()).await;
            assert!(silent.is_suppressed());
        }
    }

    #[tokio::test]
    async fn test_sequential_stops_at_first_failure() {
        let session = FakeSession::new();
        session.set_url("https://app.test/home");
        let cancel = CancellationToken::new();
        let spec = WaitSpec::before()
            .with_selector("#missing", 20)
            .with_url("/home", 20)
            .sequential();

        let started = Instant::now();
        let outcome = coordinator(&session, &cancel).execute_waits(&spec).await;
        assert!(outcome.is_failure());
        assert_eq!(session.url_reads(), 0);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_sequential_silent_runs_everything() {
        let session = FakeSession::new();
        session.set_url("https://app.test/home");
        let cancel = CancellationToken::new();
        let spec = WaitSpec::before()
            .with_selector("#missing", 20)
            .with_url("/home", 20)
            .sequential()
            .silent();

        let outcome = coordinator(&session, &cancel).execute_waits(&spec).await;
        assert!(outcome.is_suppressed());
        assert!(session.url_reads() > 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_polling() {
        let session = FakeSession::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let spec = WaitSpec::before().with_selector("#never", 10_000).silent();

        let outcome = coordinator(&session, &cancel).execute_waits(&spec).await;
        assert_eq!(outcome, StepOutcome::Failure(StepError::Cancelled));
    }
}
