//! Batch Scheduling Module
//!
//! Runs many workflows under shared concurrency limits and keeps their
//! history.
//!
//! # Components
//!
//! - [`model`]: Batch records, counters, filters and pagination
//! - [`store`]: Persistence of batches and execution records
//! - [`manager`]: The process-wide execution manager

pub mod manager;
pub mod model;
pub mod store;

pub use manager::ExecutionManager;
pub use model::{
    Batch, BatchCounts, BatchFilter, BatchOptions, BatchPage, BatchStatus, Page, RejectedWorkflow,
    SourceType, StopCounts,
};
pub use store::{BatchStore, FileBatchStore, MemoryBatchStore};
