//! Workflow Validation
//!
//! Provides structural validation for workflow graphs:
//! - Node field validation
//! - Unique ids and a start node
//! - Edge reference integrity
//! - Cycle detection (via the planner's topological sort)
//!
//! Every defect is collected so callers can report them all at once.

use std::collections::HashSet;

use log::debug;

use crate::error::{ValidationError, ValidationErrors};

use super::model::{Node, Workflow};
use super::planner::topological_order;

/// Validates a single node's fields.
fn validate_node(node: &Node) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if node.id.trim().is_empty() {
        errors.push(ValidationError::EmptyNodeId);
        return errors; // Can't validate further without ID
    }

    if node.node_type.trim().is_empty() {
        errors.push(ValidationError::EmptyNodeType(node.id.clone()));
    }

    if node.bypass {
        debug!("Node '{}' is bypassed", node.id);
    }

    errors
}

/// Collects structural defects without checking for cycles.
pub fn validate_structure(workflow: &Workflow) -> Vec<ValidationError> {
    if workflow.nodes.is_empty() {
        return vec![ValidationError::EmptyWorkflow];
    }

    let mut errors = Vec::new();

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for node in &workflow.nodes {
        errors.extend(validate_node(node));

        if !node.id.trim().is_empty() && !seen_ids.insert(node.id.as_str()) {
            errors.push(ValidationError::DuplicateNodeId(node.id.clone()));
        }
    }

    if !workflow.nodes.iter().any(Node::is_start) {
        errors.push(ValidationError::MissingStartNode);
    }

    for edge in &workflow.edges {
        for endpoint in [&edge.source, &edge.target] {
            if !seen_ids.contains(endpoint.as_str()) {
                errors.push(ValidationError::DanglingEdge {
                    from: edge.source.clone(),
                    to: edge.target.clone(),
                    missing: endpoint.clone(),
                });
            }
        }
    }

    errors
}

/// Validates the entire workflow graph.
///
/// Performs the following checks:
/// 1. Workflow is not empty
/// 2. Every node has an id and a type
/// 3. No duplicate node ids
/// 4. At least one start node
/// 5. All edge endpoints reference existing nodes
/// 6. No cyclic dependencies among control-flow edges
///
/// Returns the declaration-order topological sort on success.
pub fn validate_workflow(workflow: &Workflow) -> Result<Vec<String>, ValidationErrors> {
    debug!(
        "Validating workflow '{}' with {} nodes, {} edges",
        workflow.name,
        workflow.nodes.len(),
        workflow.edges.len()
    );

    let errors = validate_structure(workflow);
    if !errors.is_empty() {
        return Err(ValidationErrors(errors));
    }

    // Topological sort (detects cycles); declaration order as tie-break
    let order =
        topological_order(workflow, |_, index| (2, index)).map_err(|e| ValidationErrors(vec![e]))?;

    debug!("Workflow '{}' validated", workflow.name);
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::Edge;

    fn minimal() -> Workflow {
        Workflow::new().with_node(Node::start("start"))
    }

    #[test]
    fn test_minimal_workflow_is_valid() {
        assert!(validate_workflow(&minimal()).is_ok());
    }

    #[test]
    fn test_empty_workflow_rejected() {
        let errors = validate_workflow(&Workflow::new()).unwrap_err();
        assert_eq!(errors.0, vec![ValidationError::EmptyWorkflow]);
    }

    #[test]
    fn test_missing_start_node_rejected() {
        let workflow = Workflow::new().with_node(Node::new("a", "click"));
        let errors = validate_workflow(&workflow).unwrap_err();
        assert!(errors.contains(&ValidationError::MissingStartNode));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut workflow = minimal();
        workflow.nodes.push(Node::new("a", "click"));
        workflow.nodes.push(Node::new("a", "type"));

        let errors = validate_workflow(&workflow).unwrap_err();
        assert!(errors.contains(&ValidationError::DuplicateNodeId("a".to_string())));
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let workflow = minimal().connect("start", "ghost");
        let errors = validate_workflow(&workflow).unwrap_err();

        assert_eq!(
            errors.0,
            vec![ValidationError::DanglingEdge {
                from: "start".to_string(),
                to: "ghost".to_string(),
                missing: "ghost".to_string(),
            }]
        );
    }

    #[test]
    fn test_all_defects_collected() {
        let mut workflow = Workflow::new();
        workflow.nodes.push(Node::new("a", ""));
        workflow.nodes.push(Node::new("", "click"));
        workflow.edges.push(Edge::new("x", "a"));

        let errors = validate_workflow(&workflow).unwrap_err();
        assert!(errors.contains(&ValidationError::EmptyNodeType("a".to_string())));
        assert!(errors.contains(&ValidationError::EmptyNodeId));
        assert!(errors.contains(&ValidationError::MissingStartNode));
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_cycle_rejected() {
        let workflow = minimal()
            .with_node(Node::new("a", "click"))
            .with_node(Node::new("b", "click"))
            .connect("start", "a")
            .connect("a", "b")
            .connect("b", "a");

        let errors = validate_workflow(&workflow).unwrap_err();
        assert!(matches!(errors.0[0], ValidationError::CyclicDependency(_)));
    }

    #[test]
    fn test_self_loop_rejected() {
        let workflow = minimal().connect("start", "start");
        assert!(validate_workflow(&workflow).is_err());
    }

    #[test]
    fn test_data_back_edge_is_not_a_cycle() {
        let mut workflow = minimal()
            .with_node(Node::new("read", "query"))
            .with_node(Node::new("fill", "type"))
            .connect("start", "read")
            .connect("read", "fill");
        workflow
            .edges
            .push(Edge::new("fill", "read").with_handle("data-value"));

        let order = validate_workflow(&workflow).unwrap();
        assert_eq!(order, vec!["start", "read", "fill"]);
    }

    #[test]
    fn test_data_edge_endpoints_checked() {
        let mut workflow = minimal();
        workflow
            .edges
            .push(Edge::new("ghost", "start").with_handle("data-text"));

        let errors = validate_workflow(&workflow).unwrap_err();
        assert!(matches!(errors.0[0], ValidationError::DanglingEdge { .. }));
    }
}
