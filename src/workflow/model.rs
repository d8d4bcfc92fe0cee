//! Workflow Data Model
//!
//! Core data structures representing workflow nodes and the edges between
//! them.
//!
//! # Example JSON Format
//!
//! ```json
//! {
//!   "name": "login",
//!   "nodes": [
//!     { "id": "start", "type": "start" },
//!     { "id": "open", "type": "navigate", "config": { "url": "https://example.com" } },
//!     { "id": "submit", "type": "click", "config": { "selector": "#login" },
//!       "breakpoint": true,
//!       "retry": { "count": 2, "delay": 250 } }
//!   ],
//!   "edges": [
//!     { "source": "start", "target": "open" },
//!     { "source": "open", "target": "submit" }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::policy::{RetryPolicy, WaitSpec, WaitTiming};

/// Node type marking a workflow entry point.
pub const START_NODE_TYPE: &str = "start";

/// Edge handles with this prefix carry data into a node property rather
/// than control flow.
pub const DATA_HANDLE_PREFIX: &str = "data";

/// A single typed step in a workflow graph.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique identifier within the workflow
    pub id: String,

    /// Step type resolved against the handler registry (e.g. "click")
    #[serde(rename = "type")]
    pub node_type: String,

    /// Optional human-readable label from the editor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Type-specific configuration, opaque to the engine
    #[serde(default)]
    pub config: Value,

    /// Skip dispatch for this node while keeping it in the graph
    #[serde(default)]
    pub bypass: bool,

    /// Explicit breakpoint marker
    #[serde(default)]
    pub breakpoint: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub waits: Vec<WaitSpec>,
}

impl Node {
    /// Creates a new node with empty configuration.
    ///
    /// # Example
    ///
    /// ```
    /// use flowpilot::workflow::{Node, RetryPolicy};
    ///
    /// let node = Node::new("submit", "click")
    ///     .with_config(serde_json::json!({ "selector": "#login" }))
    ///     .with_retry(RetryPolicy::count(2, 250))
    ///     .with_breakpoint();
    /// assert!(node.breakpoint);
    /// ```
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            node_type: node_type.into().trim().to_string(),
            label: None,
            config: Value::Null,
            bypass: false,
            breakpoint: false,
            retry: None,
            waits: Vec::new(),
        }
    }

    /// Shorthand for a start node.
    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, START_NODE_TYPE)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn bypassed(mut self) -> Self {
        self.bypass = true;
        self
    }

    pub fn with_breakpoint(mut self) -> Self {
        self.breakpoint = true;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_wait(mut self, wait: WaitSpec) -> Self {
        self.waits.push(wait);
        self
    }

    pub fn is_start(&self) -> bool {
        self.node_type == START_NODE_TYPE
    }

    /// Declared waits for one side of the handler, in declaration order.
    pub fn waits_at(&self, timing: WaitTiming) -> impl Iterator<Item = &WaitSpec> {
        self.waits.iter().filter(move |w| w.timing == timing)
    }

    /// Label if present, otherwise the id.
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }

    /// Reads a string field from the node configuration.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

/// A directed connection between two nodes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub source: String,

    pub target: String,

    /// Handle tag; data/property-input edges start with [`DATA_HANDLE_PREFIX`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: None,
            source: source.into(),
            target: target.into(),
            handle: None,
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    /// True unless the edge feeds a property input.
    pub fn is_control_flow(&self) -> bool {
        match &self.handle {
            Some(handle) => !handle.starts_with(DATA_HANDLE_PREFIX),
            None => true,
        }
    }
}

/// A complete workflow graph.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Workflow {
    /// Display name (defaults to the source file stem when loaded)
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub nodes: Vec<Node>,

    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Workflow {
    /// Creates a new empty workflow.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty workflow with a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds a node, rejecting duplicate ids.
    pub fn add_node(&mut self, node: Node) -> Result<(), String> {
        if self.nodes.iter().any(|n| n.id == node.id) {
            return Err(format!("Node '{}' already exists", node.id));
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Builder form of [`add_node`](Self::add_node). A node with the same id
    /// is replaced in place.
    pub fn with_node(mut self, node: Node) -> Self {
        match self.nodes.iter_mut().find(|n| n.id == node.id) {
            Some(existing) => *existing = node,
            None => self.nodes.push(node),
        }
        self
    }

    /// Adds a control-flow edge.
    pub fn connect(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.edges.push(Edge::new(source, target));
        self
    }

    /// Removes a node and every edge touching it.
    pub fn remove_node(&mut self, id: &str) -> Result<Node, String> {
        let index = self
            .nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or_else(|| format!("Node '{}' not found", id))?;

        self.edges.retain(|e| e.source != id && e.target != id);
        Ok(self.nodes.remove(index))
    }

    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn get_node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n.id == id)
    }

    /// Returns the number of nodes in the workflow.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the workflow has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
