//! Execution Order Planning
//!
//! Computes the deterministic, edge-respecting sequence of node ids an
//! execution walks, and re-anchors that sequence when the workflow is
//! replaced mid-run.
//!
//! Every node appears exactly once. For every control-flow edge `a -> b`,
//! `a` precedes `b`; data edges only feed property inputs and never order.
//! Ties are broken by a rank, which for a fresh plan is the node's
//! declaration index.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use log::debug;

use crate::error::{MutationError, ValidationError, ValidationErrors};

use super::model::Workflow;
use super::validator::{validate_structure, validate_workflow};

/// Topologically sorts the workflow using Kahn's algorithm.
///
/// `rank` maps `(node_id, declaration_index)` to a sort key; among the nodes
/// whose predecessors are all placed, the smallest key goes next. Only
/// control-flow edges count. Endpoints that reference unknown nodes are
/// ignored here (the validator reports them).
pub(crate) fn topological_order<F>(workflow: &Workflow, rank: F) -> Result<Vec<String>, ValidationError>
where
    F: Fn(&str, usize) -> (u8, usize),
{
    let index_of: HashMap<&str, usize> = workflow
        .nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; workflow.nodes.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); workflow.nodes.len()];

    for edge in workflow.edges.iter().filter(|e| e.is_control_flow()) {
        if let (Some(&from), Some(&to)) = (
            index_of.get(edge.source.as_str()),
            index_of.get(edge.target.as_str()),
        ) {
            successors[from].push(to);
            in_degree[to] += 1;
        }
    }

    let key = |i: usize| {
        let (class, sub) = rank(workflow.nodes[i].id.as_str(), i);
        Reverse((class, sub, i))
    };

    let mut ready: BinaryHeap<Reverse<(u8, usize, usize)>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(i, _)| key(i))
        .collect();

    let mut sorted = Vec::with_capacity(workflow.nodes.len());

    while let Some(Reverse((_, _, current))) = ready.pop() {
        sorted.push(workflow.nodes[current].id.clone());

        for &next in &successors[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(key(next));
            }
        }
    }

    if sorted.len() != workflow.nodes.len() {
        let stuck = in_degree
            .iter()
            .position(|degree| *degree > 0)
            .map(|i| workflow.nodes[i].id.clone())
            .unwrap_or_default();
        return Err(ValidationError::CyclicDependency(stuck));
    }

    Ok(sorted)
}

/// The validated sequence of node ids for one run.
///
/// Immutable once computed; a mid-run workflow update produces a new order
/// with a higher version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOrder {
    ids: Vec<String>,
    version: u32,
}

impl ExecutionOrder {
    /// Validates the workflow and computes its execution order.
    pub fn compute(workflow: &Workflow) -> Result<Self, ValidationErrors> {
        let ids = validate_workflow(workflow)?;
        debug!("Execution order for '{}': {:?}", workflow.name, ids);
        Ok(Self { ids, version: 0 })
    }

    /// Computes the order for a replacement workflow, anchored at the part of
    /// the run that already happened.
    ///
    /// Nodes visited before `paused_index` keep their relative order and are
    /// placed first whenever the new edges allow it, then the paused node,
    /// then everything else by declaration order. The update is rejected when
    /// the paused node or an executed node disappeared, when an executed node
    /// would now have to run after the paused node, or when a new node would
    /// have to run before it.
    pub fn anchored(
        &self,
        workflow: &Workflow,
        paused_index: usize,
        executed: &[String],
    ) -> Result<Self, MutationError> {
        let errors = validate_structure(workflow);
        if !errors.is_empty() {
            return Err(MutationError::Invalid(ValidationErrors(errors)));
        }

        let paused = self
            .ids
            .get(paused_index)
            .ok_or_else(|| MutationError::PausedNodeRemoved(String::new()))?;

        if !workflow.contains_node(paused) {
            return Err(MutationError::PausedNodeRemoved(paused.clone()));
        }

        if let Some(missing) = executed.iter().find(|id| !workflow.contains_node(id)) {
            return Err(MutationError::HistoryRewritten(missing.clone()));
        }

        let visited: HashMap<&str, usize> = self.ids[..paused_index]
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let ids = topological_order(workflow, |id, index| {
            if let Some(&position) = visited.get(id) {
                (0, position)
            } else if id == paused.as_str() {
                (1, 0)
            } else {
                (2, index)
            }
        })
        .map_err(|e| MutationError::Invalid(ValidationErrors(vec![e])))?;

        let order = Self {
            ids,
            version: self.version + 1,
        };

        let paused_position = order.position(paused).unwrap_or(0);
        for id in executed {
            if order.position(id).map_or(true, |p| p > paused_position) {
                return Err(MutationError::HistoryRewritten(id.clone()));
            }
        }

        if let Some(id) = order.ids[..paused_position]
            .iter()
            .find(|id| !visited.contains_key(id.as_str()))
        {
            return Err(MutationError::InsertedBeforePause {
                node: id.clone(),
                paused: paused.clone(),
            });
        }

        debug!("Re-anchored execution order (v{}): {:?}", order.version, order.ids);
        Ok(order)
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.ids.get(index).map(String::as_str)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.ids.iter().position(|n| n == id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Number of re-anchorings since the first plan.
    pub fn version(&self) -> u32 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{Edge, Node};

    fn diamond() -> Workflow {
        Workflow::named("diamond")
            .with_node(Node::new("join", "click"))
            .with_node(Node::new("left", "click"))
            .with_node(Node::start("start"))
            .with_node(Node::new("right", "click"))
            .connect("start", "left")
            .connect("start", "right")
            .connect("left", "join")
            .connect("right", "join")
    }

    fn assert_respects_edges(workflow: &Workflow, order: &ExecutionOrder) {
        assert_eq!(order.len(), workflow.len());
        for node in &workflow.nodes {
            assert_eq!(order.ids().iter().filter(|id| **id == node.id).count(), 1);
        }
        for edge in workflow.edges.iter().filter(|e| e.is_control_flow()) {
            assert!(
                order.position(&edge.source) < order.position(&edge.target),
                "{} must precede {}",
                edge.source,
                edge.target
            );
        }
    }

    #[test]
    fn test_order_respects_edges() {
        let workflow = diamond();
        let order = ExecutionOrder::compute(&workflow).unwrap();

        assert_respects_edges(&workflow, &order);
        assert_eq!(order.ids(), &["start", "left", "right", "join"]);
        assert_eq!(order.version(), 0);
    }

    #[test]
    fn test_order_is_deterministic() {
        let workflow = diamond();
        let first = ExecutionOrder::compute(&workflow).unwrap();
        for _ in 0..10 {
            assert_eq!(ExecutionOrder::compute(&workflow).unwrap(), first);
        }
    }

    #[test]
    fn test_data_edges_do_not_order() {
        let mut workflow = Workflow::new()
            .with_node(Node::start("start"))
            .with_node(Node::new("consumer", "type"))
            .with_node(Node::new("producer", "query"))
            .connect("start", "consumer");
        workflow
            .edges
            .push(Edge::new("producer", "consumer").with_handle("data-text"));

        let order = ExecutionOrder::compute(&workflow).unwrap();
        assert_eq!(order.ids(), &["start", "consumer", "producer"]);
    }

    #[test]
    fn test_disconnected_nodes_included() {
        let workflow = Workflow::new()
            .with_node(Node::start("start"))
            .with_node(Node::new("island", "click"));

        let order = ExecutionOrder::compute(&workflow).unwrap();
        assert_eq!(order.ids(), &["start", "island"]);
    }

    #[test]
    fn test_compute_rejects_invalid() {
        assert!(ExecutionOrder::compute(&Workflow::new()).is_err());
    }

    fn chain() -> Workflow {
        Workflow::new()
            .with_node(Node::start("start"))
            .with_node(Node::new("a", "click"))
            .with_node(Node::new("b", "click"))
            .with_node(Node::new("c", "click"))
            .connect("start", "a")
            .connect("a", "b")
            .connect("b", "c")
    }

    #[test]
    fn test_anchored_keeps_prefix() {
        let workflow = chain();
        let order = ExecutionOrder::compute(&workflow).unwrap();
        let executed = vec!["start".to_string(), "a".to_string()];

        // Insert "x" between b and c
        let mut updated = chain().with_node(Node::new("x", "click"));
        updated.edges.retain(|e| !(e.source == "b" && e.target == "c"));
        let updated = updated.connect("b", "x").connect("x", "c");

        let anchored = order.anchored(&updated, 2, &executed).unwrap();
        assert_eq!(anchored.ids(), &["start", "a", "b", "x", "c"]);
        assert_eq!(anchored.version(), 1);
        assert_eq!(anchored.position("b"), Some(2));
    }

    #[test]
    fn test_anchored_rejects_removed_history() {
        let order = ExecutionOrder::compute(&chain()).unwrap();
        let executed = vec!["start".to_string(), "a".to_string()];

        let mut updated = chain();
        updated.remove_node("a").unwrap();
        let updated = updated.connect("start", "b");

        let err = order.anchored(&updated, 2, &executed).unwrap_err();
        assert_eq!(err, MutationError::HistoryRewritten("a".to_string()));
    }

    #[test]
    fn test_anchored_rejects_reordered_history() {
        let order = ExecutionOrder::compute(&chain()).unwrap();
        let executed = vec!["start".to_string(), "a".to_string()];

        // Now "a" must come after "b"
        let updated = Workflow::new()
            .with_node(Node::start("start"))
            .with_node(Node::new("a", "click"))
            .with_node(Node::new("b", "click"))
            .with_node(Node::new("c", "click"))
            .connect("start", "b")
            .connect("b", "a")
            .connect("a", "c");

        let err = order.anchored(&updated, 2, &executed).unwrap_err();
        assert_eq!(err, MutationError::HistoryRewritten("a".to_string()));
    }

    #[test]
    fn test_anchored_rejects_node_inserted_before_pause() {
        let order = ExecutionOrder::compute(&chain()).unwrap();
        let executed = vec!["start".to_string(), "a".to_string()];

        // "x" now sits between a and the paused node b
        let mut updated = chain().with_node(Node::new("x", "click"));
        updated.edges.retain(|e| !(e.source == "a" && e.target == "b"));
        let updated = updated.connect("a", "x").connect("x", "b");

        let err = order.anchored(&updated, 2, &executed).unwrap_err();
        assert_eq!(
            err,
            MutationError::InsertedBeforePause {
                node: "x".to_string(),
                paused: "b".to_string(),
            }
        );
        assert_eq!(err.code(), "INSERTED_BEFORE_PAUSE");
    }

    #[test]
    fn test_anchored_rejects_removed_paused_node() {
        let order = ExecutionOrder::compute(&chain()).unwrap();
        let mut updated = chain();
        updated.remove_node("b").unwrap();

        let err = order
            .anchored(&updated, 2, &["start".to_string(), "a".to_string()])
            .unwrap_err();
        assert_eq!(err, MutationError::PausedNodeRemoved("b".to_string()));
    }

    #[test]
    fn test_anchored_rejects_invalid_graph() {
        let order = ExecutionOrder::compute(&chain()).unwrap();
        let updated = chain().connect("c", "ghost");

        let err = order.anchored(&updated, 2, &[]).unwrap_err();
        assert_eq!(err.code(), "INVALID_WORKFLOW");
    }
}
