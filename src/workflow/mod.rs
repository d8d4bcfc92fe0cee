//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, loading,
//! validating and ordering automation workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Node, Edge, Workflow)
//! - [`policy`]: Retry and wait policies attached to nodes
//! - [`parser`]: JSON/YAML loading from files, folders or memory
//! - [`validator`]: Graph integrity checks
//! - [`planner`]: Execution order computation and re-anchoring

pub mod model;
pub mod parser;
pub mod planner;
pub mod policy;
pub mod validator;

pub use model::{Edge, Node, Workflow, START_NODE_TYPE};
pub use parser::{load_source, load_workflow, LoadedWorkflow, WorkflowSource};
pub use planner::ExecutionOrder;
pub use policy::{
    Condition, DelayStrategy, ElementState, MatchOperator, RetryPolicy, RetryStrategy,
    WaitSpec, WaitStrategy, WaitTiming,
};
pub use validator::validate_workflow;
