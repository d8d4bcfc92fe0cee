//! Step Handler Registry
//!
//! Node types form an open set. Each type maps to a [`StepHandler`]
//! registered at startup; the executor resolves the handler by the node's
//! `type` string and fails the node explicitly when nothing is registered.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use serde_json::Value;

use crate::error::StepError;
use crate::execution::context::ExecutionContext;
use crate::workflow::Node;

use super::builtin;

/// Executes one node type.
///
/// The returned value becomes the node's result: it is stored in the
/// context data store under the node id and, for API-based retry
/// conditions, inspected as the response.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, node: &Node, ctx: &ExecutionContext) -> Result<Value, StepError>;
}

/// Maps node types to their handlers.
///
/// # Example
///
/// ```
/// use flowpilot::automation::HandlerRegistry;
///
/// let registry = HandlerRegistry::with_builtins();
/// assert!(registry.contains("start"));
/// assert!(registry.resolve("teleport").is_err());
/// ```
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry pre-loaded with the built-in node types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_builtins(&mut registry);
        registry
    }

    /// Registers a handler, returning the one it replaced.
    pub fn register(
        &mut self,
        node_type: impl Into<String>,
        handler: Arc<dyn StepHandler>,
    ) -> Option<Arc<dyn StepHandler>> {
        let node_type = node_type.into();
        debug!("Registering handler for node type '{}'", node_type);
        self.handlers.insert(node_type, handler)
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_handler(mut self, node_type: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        self.register(node_type, handler);
        self
    }

    pub fn resolve(&self, node_type: &str) -> Result<Arc<dyn StepHandler>, StepError> {
        self.handlers
            .get(node_type)
            .cloned()
            .ok_or_else(|| StepError::NoHandler(node_type.to_string()))
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.handlers.contains_key(node_type)
    }

    /// Registered node types, sorted.
    pub fn node_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("node_types", &self.node_types())
            .finish()
    }
}
