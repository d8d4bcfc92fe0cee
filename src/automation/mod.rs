//! Automation Collaborators
//!
//! Contracts between the engine and the outside world:
//!
//! - [`session`]: the live automation session and its factory
//! - [`handler`]: node-type handlers and their registry
//! - [`builtin`]: the node types the engine ships with
//! - [`debug_slot`]: single-owner sessions for interactive tools

pub mod builtin;
pub mod debug_slot;
pub mod handler;
pub mod session;

pub use debug_slot::{DebugSessionKind, DebugSessionSlot, DebugSessionToken};
pub use handler::{HandlerRegistry, StepHandler};
pub use session::{AutomationSession, DetachedSession, DetachedSessionFactory, SessionFactory};
