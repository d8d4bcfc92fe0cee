//! FlowPilot - Browser Automation Workflow Engine
//!
//! Runs declarative automation workflows (graphs of typed nodes) against a
//! live automation session, one node at a time, with retries, wait
//! conditions, breakpoints and mid-pause editing. Many workflows can be
//! scheduled together as batches under global and per-batch limits.
//!
//! # Architecture
//!
//! - [`workflow`]: Workflow definitions, loading, validation and ordering
//! - [`automation`]: Session and node-handler contracts, built-in nodes
//! - [`execution`]: The per-workflow executor and its control surface
//! - [`batch`]: The execution manager, batch model and history store
//! - [`monitoring`]: Execution events and timelines
//! - [`config`]: Engine settings from file and environment
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use flowpilot::automation::{DetachedSessionFactory, HandlerRegistry};
//! use flowpilot::batch::{BatchOptions, ExecutionManager};
//! use flowpilot::config::EngineConfig;
//! use flowpilot::monitoring::LogSink;
//! use flowpilot::workflow::WorkflowSource;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = ExecutionManager::new(
//!         EngineConfig::default(),
//!         Arc::new(HandlerRegistry::with_builtins()),
//!         Arc::new(DetachedSessionFactory),
//!         Arc::new(LogSink),
//!         None,
//!     );
//!
//!     let source = WorkflowSource::Folder("workflows".into());
//!     let batch_id = manager
//!         .start_batch_execution(source, BatchOptions::new().workers(4))
//!         .await?;
//!     let batch = manager.wait_for_batch(&batch_id).await?;
//!     println!("{} completed, {} failed", batch.counts.completed, batch.counts.failed);
//!     Ok(())
//! }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod automation;
pub mod batch;
pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod workflow;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use batch::ExecutionManager;
pub use config::EngineConfig;
pub use execution::{ExecutionSnapshot, ExecutionStatus, Executor};
pub use workflow::{load_workflow, Node, Workflow};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "FlowPilot";

/// Locks a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(APP_NAME, "FlowPilot");
    }

    #[test]
    fn test_lock_recovers_from_poison() {
        let mutex = std::sync::Arc::new(Mutex::new(1));
        let poisoned = std::sync::Arc::clone(&mutex);
        let _ = std::thread::spawn(move || {
            let _guard = poisoned.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert!(mutex.is_poisoned());
        *lock(&mutex) += 1;
        assert_eq!(*lock(&mutex), 2);
    }
}
