//! Batch Data Model
//!
//! A batch groups executions started together from one source under a
//! shared `workers` cap. Its counters always satisfy
//! `completed + running + queued + failed == total_workflows`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::WorkflowSource;

/// Lifecycle of a batch.
///
/// A batch whose members failed still ends `Completed`; only an operator
/// stop ends it `Stopped`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum BatchStatus {
    Queued,
    Running,
    Completed,
    Stopped,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Stopped)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// Where the batch's workflows came from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum SourceType {
    Folder,
    Files,
    Workflows,
}

impl From<&WorkflowSource> for SourceType {
    fn from(source: &WorkflowSource) -> Self {
        match source {
            WorkflowSource::Folder(_) => Self::Folder,
            WorkflowSource::Files(_) => Self::Files,
            WorkflowSource::Workflows(_) => Self::Workflows,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Folder => "folder",
            Self::Files => "files",
            Self::Workflows => "workflows",
        };
        write!(f, "{}", name)
    }
}

/// Progress counters of one batch.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BatchCounts {
    pub total_workflows: usize,
    pub valid_workflows: usize,
    pub invalid_workflows: usize,
    pub completed: usize,
    pub running: usize,
    pub queued: usize,
    /// Errored, stopped and cancelled members plus invalid workflows
    pub failed: usize,
}

impl BatchCounts {
    /// Seeds counters for a new batch; invalid workflows count as failed.
    pub fn seeded(valid: usize, invalid: usize) -> Self {
        Self {
            total_workflows: valid + invalid,
            valid_workflows: valid,
            invalid_workflows: invalid,
            queued: valid,
            failed: invalid,
            ..Self::default()
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.completed + self.running + self.queued + self.failed == self.total_workflows
    }

    /// Nothing left running or waiting.
    pub fn is_settled(&self) -> bool {
        self.running == 0 && self.queued == 0
    }

    pub(crate) fn admit(&mut self) {
        self.queued = self.queued.saturating_sub(1);
        self.running += 1;
    }

    pub(crate) fn finish(&mut self, succeeded: bool) {
        self.running = self.running.saturating_sub(1);
        if succeeded {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
    }

    pub(crate) fn cancel_queued(&mut self, cancelled: usize) {
        self.queued = self.queued.saturating_sub(cancelled);
        self.failed += cancelled;
    }
}

/// A workflow that could not join its batch.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RejectedWorkflow {
    pub source: String,
    pub errors: Vec<String>,
}

/// Persisted batch record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: String,
    pub source_type: SourceType,
    /// Ids of the valid members, in admission order
    pub execution_ids: Vec<String>,
    pub workers: usize,
    pub priority: i32,
    pub counts: BatchCounts,
    pub status: BatchStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    /// Per-file override data supplied with the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedWorkflow>,
}

impl Batch {
    /// Ends the batch with `status` unless it already ended.
    pub(crate) fn close(&mut self, status: BatchStatus) {
        if !self.status.is_terminal() {
            self.status = status;
            self.end_time = Some(Utc::now());
        }
    }
}

/// Options of a batch request.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Max concurrently running members; the engine default when absent
    pub workers: Option<usize>,
    /// Higher runs first when batches compete for pool slots
    pub priority: i32,
    /// Overrides the type derived from the source
    pub source_type: Option<SourceType>,
    pub output_path: Option<String>,
    pub overrides: Option<Value>,
}

impl BatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn source_type(mut self, source_type: SourceType) -> Self {
        self.source_type = Some(source_type);
        self
    }

    pub fn output_path(mut self, path: impl Into<String>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn overrides(mut self, overrides: Value) -> Self {
        self.overrides = Some(overrides);
        self
    }
}

/// History filter; `None` fields match everything.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchFilter {
    pub status: Option<BatchStatus>,
    pub source_type: Option<SourceType>,
}

impl BatchFilter {
    pub fn status(mut self, status: BatchStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn source_type(mut self, source_type: SourceType) -> Self {
        self.source_type = Some(source_type);
        self
    }

    pub fn matches(&self, batch: &Batch) -> bool {
        self.status.map_or(true, |s| s == batch.status)
            && self.source_type.map_or(true, |t| t == batch.source_type)
    }
}

/// Offset pagination.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }
}

/// One page of batch history, newest first.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BatchPage {
    pub batches: Vec<Batch>,
    /// Matching batches across all pages
    pub total: usize,
}

impl BatchPage {
    /// Filters, sorts newest first and slices.
    pub fn paginate(batches: impl IntoIterator<Item = Batch>, filter: &BatchFilter, page: Page) -> Self {
        let mut matching: Vec<Batch> = batches.into_iter().filter(|b| filter.matches(b)).collect();
        matching.sort_by(|a, b| b.start_time.cmp(&a.start_time).then_with(|| a.id.cmp(&b.id)));

        let total = matching.len();
        let batches = matching.into_iter().skip(page.offset).take(page.limit).collect();
        Self { batches, total }
    }
}

/// Effect of a stop request.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StopCounts {
    pub running_stopped: usize,
    pub queued_cancelled: usize,
}

impl StopCounts {
    pub fn stopped_executions(&self) -> usize {
        self.running_stopped + self.queued_cancelled
    }
}

impl std::ops::AddAssign for StopCounts {
    fn add_assign(&mut self, other: Self) {
        self.running_stopped += other.running_stopped;
        self.queued_cancelled += other.queued_cancelled;
    }
}

#[cfg(test)]
pub(crate) fn sample_batch(id: &str, status: BatchStatus, source_type: SourceType) -> Batch {
    Batch {
        id: id.to_string(),
        source_type,
        execution_ids: Vec::new(),
        workers: 2,
        priority: 0,
        counts: BatchCounts::seeded(1, 0),
        status,
        start_time: Utc::now(),
        end_time: None,
        output_path: None,
        overrides: None,
        rejected: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_counts_stay_consistent() {
        let mut counts = BatchCounts::seeded(3, 1);
        assert!(counts.is_consistent());
        assert_eq!(counts.failed, 1);

        counts.admit();
        counts.admit();
        assert!(counts.is_consistent());
        counts.finish(true);
        counts.finish(false);
        counts.cancel_queued(1);

        assert!(counts.is_consistent());
        assert!(counts.is_settled());
        assert_eq!((counts.completed, counts.failed), (1, 3));
    }

    #[test]
    fn test_close_keeps_first_terminal_status() {
        let mut batch = sample_batch("b", BatchStatus::Running, SourceType::Files);
        batch.close(BatchStatus::Stopped);
        batch.close(BatchStatus::Completed);

        assert_eq!(batch.status, BatchStatus::Stopped);
        assert!(batch.end_time.is_some());
    }

    #[test]
    fn test_paginate_filters_and_sorts() {
        let mut old = sample_batch("old", BatchStatus::Completed, SourceType::Folder);
        old.start_time = old.start_time - Duration::hours(1);
        let new = sample_batch("new", BatchStatus::Completed, SourceType::Folder);
        let other = sample_batch("other", BatchStatus::Stopped, SourceType::Files);

        let filter = BatchFilter::default().status(BatchStatus::Completed);
        let page = BatchPage::paginate(vec![old, new, other], &filter, Page::new(0, 1));

        assert_eq!(page.total, 2);
        assert_eq!(page.batches.len(), 1);
        assert_eq!(page.batches[0].id, "new");
    }

    #[test]
    fn test_batch_serializes_camel_case() {
        let batch = sample_batch("b1", BatchStatus::Queued, SourceType::Workflows);
        let json = serde_json::to_value(&batch).unwrap();

        assert_eq!(json["sourceType"], "workflows");
        assert_eq!(json["counts"]["totalWorkflows"], 1);
        assert!(json.get("outputPath").is_none());
    }

    #[test]
    fn test_stop_counts() {
        let mut total = StopCounts::default();
        total += StopCounts { running_stopped: 1, queued_cancelled: 2 };
        total += StopCounts { running_stopped: 1, queued_cancelled: 0 };
        assert_eq!(total.stopped_executions(), 4);
    }
}
