//! Retry Coordinator
//!
//! Wraps a step invocation in the node's [`RetryPolicy`]:
//!
//! - **Count**: up to `count + 1` attempts, sleeping the policy delay
//!   between them.
//! - **UntilCondition**: re-runs the operation until its condition holds or
//!   the timeout budget runs out. The condition is authoritative: it is
//!   checked after every attempt, even a failed one.
//!
//! Both return a [`StepOutcome`], leaving propagation to the caller.

use std::future::Future;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::automation::AutomationSession;
use crate::error::StepError;
use crate::workflow::{Condition, RetryPolicy, RetryStrategy};

use super::condition::ConditionEvaluator;
use super::context::cancellable_sleep;
use super::outcome::StepOutcome;
use super::TRACE_TARGET;

/// Lower bound between condition polls when the policy delay is zero.
const MIN_CONDITION_POLL: Duration = Duration::from_millis(10);

/// Applies retry policies for one execution.
pub struct RetryCoordinator<'a> {
    session: &'a dyn AutomationSession,
    cancel: &'a CancellationToken,
    label: &'a str,
    trace: bool,
}

impl<'a> RetryCoordinator<'a> {
    pub fn new(session: &'a dyn AutomationSession, cancel: &'a CancellationToken) -> Self {
        Self {
            session,
            cancel,
            label: "",
            trace: false,
        }
    }

    /// Names the node in log output.
    pub fn for_node(mut self, node_id: &'a str) -> Self {
        self.label = node_id;
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Runs `operation` under `policy`.
    ///
    /// # Example
    ///
    /// ```
    /// use flowpilot::automation::DetachedSession;
    /// use flowpilot::error::StepError;
    /// use flowpilot::execution::{RetryCoordinator, StepOutcome};
    /// use flowpilot::workflow::RetryPolicy;
    /// use tokio_util::sync::CancellationToken;
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let session = DetachedSession::new();
    /// let cancel = CancellationToken::new();
    /// let retry = RetryCoordinator::new(&session, &cancel);
    ///
    /// let mut calls = 0;
    /// let outcome = retry
    ///     .execute_with_retry(&RetryPolicy::count(2, 0).silent(), || {
    ///         calls += 1;
    ///         async { Err(StepError::failed("flaky")) }
    ///     })
    ///     .await;
    ///
    /// assert_eq!(calls, 3);
    /// assert!(matches!(outcome, StepOutcome::Suppressed(_)));
    /// # }
    /// ```
    pub async fn execute_with_retry<F, Fut>(&self, policy: &RetryPolicy, mut operation: F) -> StepOutcome<Value>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value, StepError>>,
    {
        if !policy.enabled {
            return match operation().await {
                Ok(value) => StepOutcome::Success(value),
                Err(e) => StepOutcome::from_error(e, policy.fail_silently),
            };
        }

        let outcome = match policy.strategy {
            RetryStrategy::Count => self.retry_count(policy, &mut operation).await,
            RetryStrategy::UntilCondition => match &policy.condition {
                Some(condition) => self.retry_until(policy, condition, &mut operation).await,
                None => Err(StepError::failed(
                    "Retry strategy 'untilCondition' requires a condition",
                )),
            },
        };

        match outcome {
            Ok(value) => StepOutcome::Success(value),
            Err(e) => {
                if policy.fail_silently && !e.is_cancelled() {
                    warn!("[{}] Retry failed silently: {}", self.label, e);
                }
                StepOutcome::from_error(e, policy.fail_silently)
            }
        }
    }

    async fn retry_count<F, Fut>(&self, policy: &RetryPolicy, operation: &mut F) -> Result<Value, StepError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value, StepError>>,
    {
        let attempts = policy.count.saturating_add(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    "[{}] Retry {}/{} in {} ms",
                    self.label,
                    attempt,
                    policy.count,
                    delay.as_millis()
                );
                cancellable_sleep(self.cancel, delay).await?;
            }

            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!("[{}] Succeeded on attempt {}", self.label, attempt + 1);
                    }
                    return Ok(value);
                }
                Err(StepError::Cancelled) => return Err(StepError::Cancelled),
                Err(e) => {
                    if self.trace {
                        info!(
                            target: TRACE_TARGET,
                            "[{}] attempt {}/{} failed: {}", self.label, attempt + 1, attempts, e
                        );
                    }
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if attempts > 1 => Err(StepError::RetryExhausted {
                attempts,
                last_error: e.to_string(),
            }),
            Some(e) => Err(e),
            None => Err(StepError::failed("Retry made no attempts")),
        }
    }

    async fn retry_until<F, Fut>(
        &self,
        policy: &RetryPolicy,
        condition: &Condition,
        operation: &mut F,
    ) -> Result<Value, StepError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value, StepError>>,
    {
        let evaluator = ConditionEvaluator::new(self.session).with_trace(self.trace);
        let timeout = policy.timeout();
        let started = Instant::now();
        let mut attempt: u32 = 0;

        let last_detail = loop {
            attempt = attempt.saturating_add(1);
            let result = operation().await;
            if let Err(StepError::Cancelled) = result {
                return Err(StepError::Cancelled);
            }

            let check = evaluator.evaluate(condition, result.as_ref().ok()).await;
            if check.met {
                debug!("[{}] Condition met after {} attempt(s)", self.label, attempt);
                return Ok(result.unwrap_or(Value::Null));
            }

            let detail = match &result {
                Ok(_) => check.detail,
                Err(e) => format!("{}; last error: {}", check.detail, e),
            };

            let delay = policy.delay_for_attempt(attempt).max(MIN_CONDITION_POLL);
            if started.elapsed() + delay >= timeout {
                break detail;
            }

            if self.trace {
                info!(
                    target: TRACE_TARGET,
                    "[{}] condition unmet after attempt {} ({}), retrying in {} ms",
                    self.label,
                    attempt,
                    detail,
                    delay.as_millis()
                );
            }
            cancellable_sleep(self.cancel, delay).await?;
        };

        Err(StepError::ConditionTimeout {
            timeout_ms: policy.timeout_ms,
            detail: last_detail,
        })
    }
}
