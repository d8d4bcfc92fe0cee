//! Single Node Dispatch
//!
//! Runs one node: its `before` waits, the handler (wrapped in the retry
//! policy if one is declared), then its `after` waits. The result is
//! stored in the context data store under the node id.

use std::time::Duration;

use log::{debug, warn};
use serde_json::Value;

use crate::automation::HandlerRegistry;
use crate::error::StepError;
use crate::workflow::{Node, WaitTiming};

use super::context::{run_cancellable, ExecutionContext};
use super::outcome::StepOutcome;
use super::retry::RetryCoordinator;
use super::wait::{WaitCoordinator, DEFAULT_POLL_INTERVAL};

/// Dispatches nodes of one execution.
pub struct StepRunner<'a> {
    registry: &'a HandlerRegistry,
    ctx: &'a ExecutionContext,
    poll_interval: Duration,
}

impl<'a> StepRunner<'a> {
    pub fn new(registry: &'a HandlerRegistry, ctx: &'a ExecutionContext) -> Self {
        Self {
            registry,
            ctx,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Waits, handler, waits.
    pub async fn execute(&self, node: &Node) -> Result<Value, StepError> {
        self.run_waits(node, WaitTiming::Before).await?;
        let value = self.dispatch(node).await?;
        self.run_waits(node, WaitTiming::After).await?;

        self.ctx.set_data(node.id.clone(), value.clone());
        Ok(value)
    }

    /// Runs every wait declared for one side of the handler.
    pub async fn run_waits(&self, node: &Node, timing: WaitTiming) -> Result<(), StepError> {
        let coordinator = WaitCoordinator::new(self.ctx.session().as_ref(), self.ctx.cancellation())
            .with_poll_interval(self.poll_interval)
            .with_trace(self.ctx.trace_enabled());

        for spec in node.waits_at(timing) {
            match coordinator.execute_waits(spec).await {
                StepOutcome::Success(()) => {}
                StepOutcome::Suppressed(e) => {
                    warn!("[{}] {} wait failed silently: {}", node.id, timing, e);
                }
                StepOutcome::Failure(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Resolves and invokes the handler.
    ///
    /// A missing handler fails the node even when its retry policy is
    /// silent.
    pub async fn dispatch(&self, node: &Node) -> Result<Value, StepError> {
        let handler = self.registry.resolve(&node.node_type)?;
        let handler = handler.as_ref();
        let ctx = self.ctx;
        let cancel = ctx.cancellation();

        let Some(policy) = &node.retry else {
            debug!("[{}] Dispatching '{}'", node.id, node.node_type);
            return run_cancellable(cancel, handler.execute(node, ctx)).await;
        };

        debug!(
            "[{}] Dispatching '{}' with {:?} retry",
            node.id, node.node_type, policy.strategy
        );
        let outcome = RetryCoordinator::new(ctx.session().as_ref(), cancel)
            .for_node(&node.id)
            .with_trace(ctx.trace_enabled())
            .execute_with_retry(policy, || run_cancellable(cancel, handler.execute(node, ctx)))
            .await;

        match outcome {
            StepOutcome::Success(value) => Ok(value),
            StepOutcome::Suppressed(e) => {
                debug!("[{}] Continuing with empty result after: {}", node.id, e);
                Ok(Value::Null)
            }
            StepOutcome::Failure(e) => Err(e),
        }
    }
}
