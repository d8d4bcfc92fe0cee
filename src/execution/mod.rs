//! Workflow Execution Module
//!
//! Runs one workflow against one automation session, node by node, with
//! retry and wait policies, breakpoints and mid-pause workflow edits.
//!
//! # Architecture
//!
//! - [`executor`]: the per-run state machine and its control handle
//! - [`step`]: dispatch of a single node (waits, handler, waits)
//! - [`retry`]: count- and condition-based retry of a handler call
//! - [`wait`]: selector, URL and script waits around a handler
//! - [`condition`]: evaluation of retry conditions
//! - [`context`]: per-run data, variables and cancellation
//! - [`control`]: breakpoint policy and operator commands
//! - [`state`]: status and the serializable snapshot

pub mod condition;
pub mod context;
pub mod control;
pub mod executor;
pub mod outcome;
pub mod retry;
pub mod state;
pub mod step;
pub mod wait;

/// Log target of verbose per-poll diagnostics, enabled per execution.
pub const TRACE_TARGET: &str = "flowpilot::trace";

pub use condition::{ConditionCheck, ConditionEvaluator};
pub use context::ExecutionContext;
pub use control::{BreakpointCheckpoint, BreakpointScope, BreakpointSettings};
pub use executor::{Executor, ExecutorHandle, ExecutorOptions};
pub use outcome::StepOutcome;
pub use retry::RetryCoordinator;
pub use state::{Checkpoint, ExecutionSnapshot, ExecutionStatus, PauseReason};
pub use step::StepRunner;
pub use wait::WaitCoordinator;
