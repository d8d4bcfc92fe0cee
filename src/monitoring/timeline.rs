//! Execution Timeline
//!
//! Records when each node of an execution starts and finishes, and renders
//! an ASCII Gantt chart of the run. [`TimelineSink`] builds one timeline per
//! execution straight from the event stream.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::lock;

use super::events::{EventKind, EventSink, ExecutionEvent};

/// Chart width in characters.
const CHART_WIDTH: f64 = 50.0;

/// Type of timeline mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkType {
    Started,
    Completed,
    Failed,
    /// Marked complete by an operator without running
    Skipped,
    Bypassed,
}

/// A single mark in the timeline.
#[derive(Debug, Clone)]
pub struct TimelineMark {
    pub node_id: String,
    pub mark: MarkType,
    pub timestamp: Instant,
}

/// Start and end of one node, relative to the run start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSpan {
    pub start_ms: u128,
    pub end_ms: u128,
    pub failed: bool,
}

impl NodeSpan {
    pub fn duration_ms(&self) -> u128 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// Timeline of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    marks: Vec<TimelineMark>,
    start_time: Instant,
    end_time: Option<Instant>,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            marks: Vec::new(),
            start_time: Instant::now(),
            end_time: None,
        }
    }

    pub fn mark(&mut self, node_id: impl Into<String>, mark: MarkType) {
        self.marks.push(TimelineMark {
            node_id: node_id.into(),
            mark,
            timestamp: Instant::now(),
        });
    }

    /// Freezes the chart's time axis.
    pub fn finish(&mut self) {
        self.end_time.get_or_insert_with(Instant::now);
    }

    pub fn marks(&self) -> &[TimelineMark] {
        &self.marks
    }

    pub fn elapsed(&self) -> Duration {
        self.end_time
            .unwrap_or_else(Instant::now)
            .duration_since(self.start_time)
    }

    /// Nodes that ran, in start order.
    pub fn spans(&self) -> Vec<(String, NodeSpan)> {
        let mut open: HashMap<&str, u128> = HashMap::new();
        let mut spans: Vec<(String, NodeSpan)> = Vec::new();

        for mark in &self.marks {
            let at = mark.timestamp.duration_since(self.start_time).as_millis();
            match mark.mark {
                MarkType::Started => {
                    open.insert(mark.node_id.as_str(), at);
                }
                MarkType::Completed | MarkType::Failed => {
                    if let Some(start_ms) = open.remove(mark.node_id.as_str()) {
                        spans.push((
                            mark.node_id.clone(),
                            NodeSpan {
                                start_ms,
                                end_ms: at,
                                failed: mark.mark == MarkType::Failed,
                            },
                        ));
                    }
                }
                MarkType::Skipped | MarkType::Bypassed => {}
            }
        }

        spans.sort_by_key(|(_, span)| span.start_ms);
        spans
    }

    /// Node ids that never ran because they were bypassed or skipped.
    pub fn not_run(&self) -> Vec<&str> {
        self.marks
            .iter()
            .filter(|m| matches!(m.mark, MarkType::Skipped | MarkType::Bypassed))
            .map(|m| m.node_id.as_str())
            .collect()
    }

    /// Renders an ASCII Gantt chart; failed nodes are drawn with `x`.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }

        let scale = CHART_WIDTH / total_time as f64;

        for (node_id, span) in self.spans() {
            let start_pos = (span.start_ms as f64 * scale) as usize;
            let width = (span.duration_ms() as f64 * scale).max(1.0) as usize;
            let fill = if span.failed { "x" } else { "#" };

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&fill.repeat(width));

            output.push_str(&format!(
                "{:12} |{:width$}| ({} ms)\n",
                truncate(&node_id, 12),
                bar,
                span.duration_ms(),
                width = CHART_WIDTH as usize
            ));
        }

        for node_id in self.not_run() {
            output.push_str(&format!("{:12} (not run)\n", truncate(node_id, 12)));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or shortens a label to exactly `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

/// Event sink that keeps a timeline per execution.
#[derive(Debug, Default)]
pub struct TimelineSink {
    timelines: Mutex<HashMap<String, ExecutionTimeline>>,
}

impl TimelineSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeline(&self, execution_id: &str) -> Option<ExecutionTimeline> {
        lock(&self.timelines).get(execution_id).cloned()
    }

    pub fn gantt_chart(&self, execution_id: &str) -> Option<String> {
        lock(&self.timelines)
            .get(execution_id)
            .map(ExecutionTimeline::gantt_chart)
    }

    /// Drops the timeline of a finished execution.
    pub fn remove(&self, execution_id: &str) -> Option<ExecutionTimeline> {
        lock(&self.timelines).remove(execution_id)
    }
}

impl EventSink for TimelineSink {
    fn emit(&self, event: ExecutionEvent) {
        let mut timelines = lock(&self.timelines);
        if let EventKind::RunStart { .. } = event.kind {
            timelines.insert(event.execution_id.clone(), ExecutionTimeline::new());
            return;
        }

        let timeline = timelines.entry(event.execution_id).or_default();
        match event.kind {
            EventKind::StepStart { node_id, .. } => timeline.mark(node_id, MarkType::Started),
            EventKind::StepComplete {
                node_id,
                skipped: true,
                ..
            } => timeline.mark(node_id, MarkType::Skipped),
            EventKind::StepComplete { node_id, .. } => timeline.mark(node_id, MarkType::Completed),
            EventKind::StepError { node_id, .. } => timeline.mark(node_id, MarkType::Failed),
            EventKind::StepBypassed { node_id } => timeline.mark(node_id, MarkType::Bypassed),
            kind if kind.is_terminal() => timeline.finish(),
            _ => {}
        }
    }
}
