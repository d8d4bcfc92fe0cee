//! Monitoring Module
//!
//! Observability for running executions.
//!
//! # Components
//!
//! - [`events`]: Execution event model and sinks (log, memory, channel)
//! - [`timeline`]: Per-node timing and ASCII Gantt charts

pub mod events;
pub mod timeline;

pub use events::{
    ChannelSink, EventKind, EventSink, ExecutionEvent, FanoutSink, LogSink, MemorySink, NullSink,
};
pub use timeline::{ExecutionTimeline, MarkType, TimelineSink};
