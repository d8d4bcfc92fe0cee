//! Built-in Node Types
//!
//! The handful of node types the engine relies on itself. Everything that
//! touches a page (click, type, query, ...) is registered by the host.
//!
//! | type           | behavior                                            |
//! |----------------|-----------------------------------------------------|
//! | `start`, `end` | markers, no effect                                  |
//! | `set-variable` | `config.name = config.value` into the variable store |
//! | `wait`         | `mode: duration` sleeps `ms`; `mode: pause` pauses   |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde_json::{json, Value};

use crate::error::StepError;
use crate::execution::context::ExecutionContext;
use crate::workflow::{Node, START_NODE_TYPE};

use super::handler::{HandlerRegistry, StepHandler};

pub const END_NODE_TYPE: &str = "end";
pub const SET_VARIABLE_NODE_TYPE: &str = "set-variable";
pub const WAIT_NODE_TYPE: &str = "wait";

/// Registers every built-in handler.
pub fn register_builtins(registry: &mut HandlerRegistry) {
    registry.register(START_NODE_TYPE, Arc::new(MarkerHandler));
    registry.register(END_NODE_TYPE, Arc::new(MarkerHandler));
    registry.register(SET_VARIABLE_NODE_TYPE, Arc::new(SetVariableHandler));
    registry.register(WAIT_NODE_TYPE, Arc::new(WaitHandler));
}

/// No-op handler for structural nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkerHandler;

#[async_trait]
impl StepHandler for MarkerHandler {
    async fn execute(&self, node: &Node, _ctx: &ExecutionContext) -> Result<Value, StepError> {
        debug!("Marker node '{}' reached", node.id);
        Ok(Value::Null)
    }
}

/// Stores `config.value` under `config.name`.
///
/// String values are interpolated first, so `"{{user}}@example.com"`
/// picks up an earlier variable.
#[derive(Debug, Default, Clone, Copy)]
pub struct SetVariableHandler;

#[async_trait]
impl StepHandler for SetVariableHandler {
    async fn execute(&self, node: &Node, ctx: &ExecutionContext) -> Result<Value, StepError> {
        let name = node
            .config_str("name")
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                StepError::failed(format!("Node '{}' has no variable name", node.id))
            })?;

        let value = match node.config.get("value") {
            Some(Value::String(text)) => Value::String(ctx.interpolate(text)),
            Some(other) => other.clone(),
            None => Value::Null,
        };

        debug!("Setting variable '{}' = {}", name, value);
        ctx.set_variable(name, value.clone());
        Ok(json!({ name: value }))
    }
}

/// Sleeps for a duration or requests a wait-pause.
#[derive(Debug, Default, Clone, Copy)]
pub struct WaitHandler;

#[async_trait]
impl StepHandler for WaitHandler {
    async fn execute(&self, node: &Node, ctx: &ExecutionContext) -> Result<Value, StepError> {
        match node.config_str("mode").unwrap_or("duration") {
            "duration" => {
                let ms = node.config.get("ms").and_then(Value::as_u64).unwrap_or(0);
                debug!("Node '{}' waiting {} ms", node.id, ms);
                ctx.sleep(Duration::from_millis(ms)).await?;
                Ok(json!({ "waited": ms }))
            }
            "pause" => {
                info!("Node '{}' requested a wait pause", node.id);
                ctx.request_pause();
                Ok(Value::Null)
            }
            other => Err(StepError::failed(format!(
                "Node '{}' has unknown wait mode '{}'",
                node.id, other
            ))),
        }
    }
}
