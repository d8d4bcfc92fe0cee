//! Execution Manager
//!
//! Process-wide owner of every execution, standalone or batched.
//!
//! # Admission
//!
//! Batch members share one global pool of `max_concurrent` slots. Whenever
//! a slot frees up, the next member admitted is the FIFO head of the
//! highest-priority batch that is still below its own `workers` cap; equal
//! priorities go to the batch created first. Standalone executions start
//! immediately and never take a pool slot.
//!
//! # Accounting
//!
//! Counters change under a single lock, so
//! `completed + running + queued + failed == total_workflows` holds for
//! every observer. Invalid workflows, errored members and stopped or
//! cancelled members all count as `failed`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::automation::{HandlerRegistry, SessionFactory};
use crate::config::EngineConfig;
use crate::error::{ControlError, SchedulerError, StepError};
use crate::execution::{ExecutionSnapshot, ExecutionStatus, Executor, ExecutorHandle, ExecutorOptions};
use crate::lock;
use crate::monitoring::EventSink;
use crate::workflow::{load_source, LoadedWorkflow, Workflow, WorkflowSource};

use super::model::{
    Batch, BatchCounts, BatchFilter, BatchOptions, BatchPage, BatchStatus, Page, RejectedWorkflow,
    SourceType, StopCounts,
};
use super::store::BatchStore;

/// Scheduler of standalone and batched executions. Cheap to clone.
#[derive(Clone)]
pub struct ExecutionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: EngineConfig,
    registry: Arc<HandlerRegistry>,
    sessions: Arc<dyn SessionFactory>,
    sink: Arc<dyn EventSink>,
    store: Option<Arc<dyn BatchStore>>,
    state: Mutex<SchedulerState>,
    /// Serializes store writes so the latest counters always land last
    persist: tokio::sync::Mutex<()>,
    changed: Notify,
}

#[derive(Default)]
struct SchedulerState {
    executions: HashMap<String, ExecutorHandle>,
    batches: HashMap<String, BatchEntry>,
    /// Terminal snapshots the store did not take
    finished: HashMap<String, ExecutionSnapshot>,
    next_seq: u64,
    pool_in_use: usize,
}

struct BatchEntry {
    batch: Batch,
    seq: u64,
    queue: VecDeque<QueuedExecution>,
    running: HashSet<String>,
    stop_requested: bool,
}

impl BatchEntry {
    fn can_admit(&self) -> bool {
        !self.stop_requested && !self.queue.is_empty() && self.running.len() < self.batch.workers
    }

    /// Closes the batch once nothing is left to run.
    fn settle(&mut self) {
        if self.batch.counts.is_settled() {
            let status = if self.stop_requested {
                BatchStatus::Stopped
            } else {
                BatchStatus::Completed
            };
            self.batch.close(status);
        }
    }
}

struct QueuedExecution {
    id: String,
    workflow: Workflow,
}

impl QueuedExecution {
    fn snapshot(&self, batch_id: &str) -> ExecutionSnapshot {
        let mut snapshot = ExecutionSnapshot::new(self.id.clone(), self.workflow.name.clone());
        snapshot.batch_id = Some(batch_id.to_string());
        snapshot
    }
}

fn next_batch(batches: &HashMap<String, BatchEntry>) -> Option<String> {
    batches
        .values()
        .filter(|entry| entry.can_admit())
        .max_by(|a, b| {
            a.batch
                .priority
                .cmp(&b.batch.priority)
                .then_with(|| b.seq.cmp(&a.seq))
        })
        .map(|entry| entry.batch.id.clone())
}

impl Inner {
    /// Fills free pool slots from the queues. Returns the batches whose
    /// counters changed.
    fn admit_queued(self: &Arc<Self>, state: &mut SchedulerState) -> Vec<String> {
        let mut touched = Vec::new();

        while state.pool_in_use < self.config.max_concurrent {
            let Some(batch_id) = next_batch(&state.batches) else {
                break;
            };
            let Some(entry) = state.batches.get_mut(&batch_id) else {
                break;
            };
            let Some(queued) = entry.queue.pop_front() else {
                break;
            };

            entry.running.insert(queued.id.clone());
            entry.batch.counts.admit();
            if entry.batch.status == BatchStatus::Queued {
                entry.batch.status = BatchStatus::Running;
            }
            state.pool_in_use += 1;

            debug!("Batch {}: admitting execution {}", batch_id, queued.id);
            let options = self.config.executor_options().in_batch(batch_id.clone());
            let executor = self.executor(queued.id.clone(), queued.workflow, options);
            let handle = self.spawn(executor);
            state.executions.insert(queued.id, handle);

            if !touched.contains(&batch_id) {
                touched.push(batch_id);
            }
        }
        touched
    }

    fn executor(&self, id: String, workflow: Workflow, options: ExecutorOptions) -> Executor {
        Executor::new(
            id,
            workflow,
            Arc::clone(&self.registry),
            Arc::clone(&self.sink),
            options,
        )
    }

    /// Runs an executor on its own task. Must be called with the state
    /// lock held so the handle is registered before the task can finish.
    fn spawn(self: &Arc<Self>, executor: Executor) -> ExecutorHandle {
        let handle = executor.handle();
        let inner = Arc::clone(self);

        tokio::spawn(async move {
            let id = executor.id().to_string();
            let report = match inner.sessions.open(&id).await {
                Ok(session) => executor.run(session).await,
                Err(e) => {
                    error!("[{}] Could not open automation session: {}", id, e);
                    executor.fail(StepError::Session(e)).await
                }
            };
            inner.on_finished(report).await;
        });

        handle
    }

    async fn on_finished(self: &Arc<Self>, report: ExecutionSnapshot) {
        debug!("[{}] Finished with status {}", report.id, report.status);
        let stored = self.persist_execution(&report).await;

        let touched = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            state.executions.remove(&report.id);
            if !stored {
                state.finished.insert(report.id.clone(), report.clone());
            }

            let mut touched = Vec::new();
            if let Some(batch_id) = &report.batch_id {
                if let Some(entry) = state.batches.get_mut(batch_id) {
                    if entry.running.remove(&report.id) {
                        entry
                            .batch
                            .counts
                            .finish(report.status == ExecutionStatus::Completed);
                        state.pool_in_use = state.pool_in_use.saturating_sub(1);
                    }
                    entry.settle();
                    if entry.batch.status.is_terminal() {
                        info!(
                            "Batch {} {}: {} completed, {} failed of {}",
                            batch_id,
                            entry.batch.status,
                            entry.batch.counts.completed,
                            entry.batch.counts.failed,
                            entry.batch.counts.total_workflows
                        );
                    }
                    touched.push(batch_id.clone());
                }
            }

            for batch_id in self.admit_queued(state) {
                if !touched.contains(&batch_id) {
                    touched.push(batch_id);
                }
            }
            touched
        };

        for batch_id in touched {
            self.persist_progress(&batch_id).await;
        }
        self.changed.notify_waiters();
    }

    fn batch(&self, batch_id: &str) -> Option<Batch> {
        lock(&self.state)
            .batches
            .get(batch_id)
            .map(|entry| entry.batch.clone())
    }

    /// In-memory view of a live, queued or retained execution.
    fn live_snapshot(&self, execution_id: &str) -> Option<ExecutionSnapshot> {
        let state = lock(&self.state);
        if let Some(handle) = state.executions.get(execution_id) {
            return Some(handle.snapshot());
        }
        let queued = state.batches.iter().find_map(|(batch_id, entry)| {
            entry
                .queue
                .iter()
                .find(|q| q.id == execution_id)
                .map(|q| q.snapshot(batch_id))
        });
        queued.or_else(|| state.finished.get(execution_id).cloned())
    }

    fn is_pending(&self, execution_id: &str) -> bool {
        let state = lock(&self.state);
        state.executions.contains_key(execution_id)
            || state
                .batches
                .values()
                .any(|entry| entry.queue.iter().any(|q| q.id == execution_id))
    }

    /// Returns false when the record must be kept in memory instead.
    async fn persist_execution(&self, record: &ExecutionSnapshot) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        match store.save_execution(record).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to persist execution {}: {}", record.id, e);
                false
            }
        }
    }

    async fn persist_new_batch(&self, batch_id: &str) {
        let Some(store) = &self.store else {
            return;
        };
        let _guard = self.persist.lock().await;
        let Some(batch) = self.batch(batch_id) else {
            return;
        };
        if let Err(e) = store.save_batch(&batch).await {
            warn!("Failed to persist batch {}: {}", batch_id, e);
        }
    }

    async fn persist_progress(&self, batch_id: &str) {
        let Some(store) = &self.store else {
            return;
        };
        let _guard = self.persist.lock().await;
        let Some(batch) = self.batch(batch_id) else {
            return;
        };
        if let Err(e) = store
            .update_batch_progress(batch_id, &batch.counts, batch.status)
            .await
        {
            warn!("Failed to persist progress of batch {}: {}", batch_id, e);
        }
    }

    /// Records a queued member that was cancelled before it ever started.
    async fn record_cancelled(&self, batch_id: &str, queued: &QueuedExecution) {
        let mut snapshot = queued.snapshot(batch_id);
        snapshot.status = ExecutionStatus::Stopped;
        snapshot.stop_requested = true;
        snapshot.finished_at = Some(Utc::now());

        if !self.persist_execution(&snapshot).await {
            lock(&self.state).finished.insert(snapshot.id.clone(), snapshot);
        }
    }
}

impl ExecutionManager {
    /// Creates a manager. Without a store, history lives only in memory.
    pub fn new(
        config: EngineConfig,
        registry: Arc<HandlerRegistry>,
        sessions: Arc<dyn SessionFactory>,
        sink: Arc<dyn EventSink>,
        store: Option<Arc<dyn BatchStore>>,
    ) -> Self {
        if store.is_none() {
            warn!("No batch store available; history will not survive a restart");
        }
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                sessions,
                sink,
                store,
                state: Mutex::new(SchedulerState::default()),
                persist: tokio::sync::Mutex::new(()),
                changed: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Crash recovery: batches persisted as running or queued by a previous
    /// process are marked stopped. Returns how many were reclassified.
    pub async fn initialize(&self) -> usize {
        let Some(store) = &self.inner.store else {
            return 0;
        };

        let page = match store
            .get_batches(&BatchFilter::default(), Page::new(0, usize::MAX))
            .await
        {
            Ok(page) => page,
            Err(e) => {
                warn!("Batch store unavailable during recovery: {}", e);
                return 0;
            }
        };

        let mut recovered = 0;
        for batch in page.batches {
            let interrupted = matches!(batch.status, BatchStatus::Running | BatchStatus::Queued);
            if !interrupted || self.inner.batch(&batch.id).is_some() {
                continue;
            }
            match store.mark_batch_stopped(&batch.id).await {
                Ok(()) => {
                    info!("Marked interrupted batch {} as stopped", batch.id);
                    recovered += 1;
                }
                Err(e) => warn!("Failed to mark batch {} stopped: {}", batch.id, e),
            }
        }
        recovered
    }

    /// Validates and starts one workflow outside any batch.
    ///
    /// A malformed workflow is rejected synchronously and never runs.
    pub fn start_single_execution(
        &self,
        workflow: Workflow,
        options: Option<ExecutorOptions>,
    ) -> Result<String, SchedulerError> {
        let id = Uuid::new_v4().to_string();
        let options = options.unwrap_or_else(|| self.inner.config.executor_options());

        let mut executor = self.inner.executor(id.clone(), workflow, options);
        executor.start()?;

        let mut state = lock(&self.inner.state);
        let handle = self.inner.spawn(executor);
        state.executions.insert(id.clone(), handle);

        info!("Started execution {}", id);
        Ok(id)
    }

    /// Loads every workflow of a source and starts them as one batch.
    pub async fn start_batch_execution(
        &self,
        source: WorkflowSource,
        options: BatchOptions,
    ) -> Result<String, SchedulerError> {
        let source_type = options
            .source_type
            .unwrap_or_else(|| SourceType::from(&source));
        let loaded = load_source(&source).map_err(|e| SchedulerError::Source(e.to_string()))?;
        self.start_loaded_batch(loaded, source_type, options).await
    }

    /// Starts a batch from already loaded workflows.
    ///
    /// Invalid entries are recorded and counted as failed; only valid ones
    /// receive execution ids.
    pub async fn start_loaded_batch(
        &self,
        loaded: Vec<LoadedWorkflow>,
        source_type: SourceType,
        options: BatchOptions,
    ) -> Result<String, SchedulerError> {
        if loaded.is_empty() {
            return Err(SchedulerError::EmptyBatch);
        }

        let batch_id = Uuid::new_v4().to_string();
        let mut queue = VecDeque::new();
        let mut rejected = Vec::new();

        for item in loaded {
            match item {
                LoadedWorkflow {
                    workflow: Some(workflow),
                    errors,
                    ..
                } if errors.is_empty() => queue.push_back(QueuedExecution {
                    id: Uuid::new_v4().to_string(),
                    workflow,
                }),
                LoadedWorkflow { source, errors, .. } => {
                    warn!("Batch {}: '{}' is invalid: {}", batch_id, source, errors.join("; "));
                    rejected.push(RejectedWorkflow { source, errors });
                }
            }
        }

        let workers = options
            .workers
            .unwrap_or(self.inner.config.default_workers)
            .max(1);
        let batch = Batch {
            id: batch_id.clone(),
            source_type,
            execution_ids: queue.iter().map(|q| q.id.clone()).collect(),
            workers,
            priority: options.priority,
            counts: BatchCounts::seeded(queue.len(), rejected.len()),
            status: BatchStatus::Queued,
            start_time: Utc::now(),
            end_time: None,
            output_path: options.output_path,
            overrides: options.overrides,
            rejected,
        };

        info!(
            "Batch {}: {} workflows ({} valid, {} invalid), workers={}, priority={}",
            batch_id,
            batch.counts.total_workflows,
            batch.counts.valid_workflows,
            batch.counts.invalid_workflows,
            workers,
            batch.priority
        );

        let touched = {
            let mut guard = lock(&self.inner.state);
            let state = &mut *guard;
            let seq = state.next_seq;
            state.next_seq += 1;

            let mut entry = BatchEntry {
                batch,
                seq,
                queue,
                running: HashSet::new(),
                stop_requested: false,
            };
            entry.settle();
            state.batches.insert(batch_id.clone(), entry);
            self.inner.admit_queued(state)
        };

        self.inner.persist_new_batch(&batch_id).await;
        for other in touched.iter().filter(|id| **id != batch_id) {
            self.inner.persist_progress(other).await;
        }
        self.inner.changed.notify_waiters();
        Ok(batch_id)
    }

    fn handle(&self, execution_id: &str) -> Result<ExecutorHandle, SchedulerError> {
        if let Some(handle) = lock(&self.inner.state).executions.get(execution_id) {
            return Ok(handle.clone());
        }
        if self.inner.is_pending(execution_id) {
            return Err(ControlError::NotPaused.into());
        }
        Err(SchedulerError::ExecutionNotFound(execution_id.to_string()))
    }

    pub fn continue_execution(&self, execution_id: &str) -> Result<(), SchedulerError> {
        Ok(self.handle(execution_id)?.continue_execution()?)
    }

    pub fn skip_next_node(&self, execution_id: &str) -> Result<(), SchedulerError> {
        Ok(self.handle(execution_id)?.skip_next_node()?)
    }

    pub fn disable_breakpoint_and_continue(&self, execution_id: &str) -> Result<(), SchedulerError> {
        Ok(self.handle(execution_id)?.disable_breakpoints_and_continue()?)
    }

    pub async fn update_workflow(&self, execution_id: &str, workflow: Workflow) -> Result<(), SchedulerError> {
        Ok(self.handle(execution_id)?.update_workflow(workflow).await?)
    }

    pub fn set_trace_logging(&self, execution_id: &str, enabled: bool) -> Result<(), SchedulerError> {
        self.handle(execution_id)?.set_trace_logging(enabled);
        Ok(())
    }

    /// Stops a running execution or cancels a queued one.
    pub async fn stop_execution(&self, execution_id: &str) -> Result<StopCounts, SchedulerError> {
        enum Target {
            Live(ExecutorHandle),
            Queued(String, QueuedExecution),
        }

        let target = {
            let mut guard = lock(&self.inner.state);
            let state = &mut *guard;
            match state.executions.get(execution_id) {
                Some(handle) => Some(Target::Live(handle.clone())),
                None => state.batches.iter_mut().find_map(|(batch_id, entry)| {
                    let position = entry.queue.iter().position(|q| q.id == execution_id)?;
                    let queued = entry.queue.remove(position)?;
                    entry.batch.counts.cancel_queued(1);
                    entry.settle();
                    Some(Target::Queued(batch_id.clone(), queued))
                }),
            }
        };

        let counts = match target {
            Some(Target::Live(handle)) => StopCounts {
                running_stopped: usize::from(handle.stop().await),
                queued_cancelled: 0,
            },
            Some(Target::Queued(batch_id, queued)) => {
                info!("Cancelled queued execution {}", execution_id);
                self.inner.record_cancelled(&batch_id, &queued).await;
                self.inner.persist_progress(&batch_id).await;
                StopCounts {
                    running_stopped: 0,
                    queued_cancelled: 1,
                }
            }
            None => {
                self.get_execution_status(execution_id).await?;
                StopCounts::default()
            }
        };

        self.inner.changed.notify_waiters();
        Ok(counts)
    }

    /// Cancels every queued member and stops every running one.
    pub async fn stop_batch(&self, batch_id: &str) -> Result<StopCounts, SchedulerError> {
        let stopping = {
            let mut guard = lock(&self.inner.state);
            let state = &mut *guard;
            state.batches.get_mut(batch_id).map(|entry| {
                entry.stop_requested = true;
                let cancelled: Vec<QueuedExecution> = entry.queue.drain(..).collect();
                entry.batch.counts.cancel_queued(cancelled.len());
                entry.settle();

                let handles: Vec<ExecutorHandle> = entry
                    .running
                    .iter()
                    .filter_map(|id| state.executions.get(id).cloned())
                    .collect();
                (cancelled, handles)
            })
        };

        let Some((cancelled, handles)) = stopping else {
            self.get_batch_status(batch_id).await?;
            return Ok(StopCounts::default());
        };

        for queued in &cancelled {
            self.inner.record_cancelled(batch_id, queued).await;
        }

        let mut counts = StopCounts {
            running_stopped: 0,
            queued_cancelled: cancelled.len(),
        };
        for handle in handles {
            if handle.stop().await {
                counts.running_stopped += 1;
            }
        }

        info!(
            "Batch {} stop: {} running stopped, {} queued cancelled",
            batch_id, counts.running_stopped, counts.queued_cancelled
        );
        self.inner.persist_progress(batch_id).await;
        self.inner.changed.notify_waiters();
        Ok(counts)
    }

    /// Stops every batch and every standalone execution.
    pub async fn stop_all(&self) -> StopCounts {
        let (batch_ids, singles) = {
            let state = lock(&self.inner.state);
            let batch_ids: Vec<String> = state
                .batches
                .values()
                .filter(|entry| !entry.batch.status.is_terminal())
                .map(|entry| entry.batch.id.clone())
                .collect();
            let singles: Vec<ExecutorHandle> = state
                .executions
                .values()
                .filter(|handle| handle.snapshot().batch_id.is_none())
                .cloned()
                .collect();
            (batch_ids, singles)
        };

        let mut total = StopCounts::default();
        for batch_id in batch_ids {
            match self.stop_batch(&batch_id).await {
                Ok(counts) => total += counts,
                Err(e) => warn!("Failed to stop batch {}: {}", batch_id, e),
            }
        }
        for handle in singles {
            if handle.stop().await {
                total.running_stopped += 1;
            }
        }

        info!("Stopped all: {} executions", total.stopped_executions());
        self.inner.changed.notify_waiters();
        total
    }

    /// Live state of an execution, or its persisted record once released.
    pub async fn get_execution_status(&self, execution_id: &str) -> Result<ExecutionSnapshot, SchedulerError> {
        if let Some(snapshot) = self.inner.live_snapshot(execution_id) {
            return Ok(snapshot);
        }
        if let Some(store) = &self.inner.store {
            if let Some(record) = store.get_execution(execution_id).await? {
                return Ok(record);
            }
        }
        Err(SchedulerError::ExecutionNotFound(execution_id.to_string()))
    }

    pub async fn get_batch_status(&self, batch_id: &str) -> Result<Batch, SchedulerError> {
        if let Some(batch) = self.inner.batch(batch_id) {
            return Ok(batch);
        }
        if let Some(store) = &self.inner.store {
            if let Some(batch) = store.get_batch(batch_id).await? {
                return Ok(batch);
            }
        }
        Err(SchedulerError::BatchNotFound(batch_id.to_string()))
    }

    /// Snapshots of a batch's members, in admission order.
    pub async fn get_batch_executions(&self, batch_id: &str) -> Result<Vec<ExecutionSnapshot>, SchedulerError> {
        let Some(batch) = self.inner.batch(batch_id) else {
            return match &self.inner.store {
                Some(store) => Ok(store.get_batch_executions(batch_id).await?),
                None => Err(SchedulerError::BatchNotFound(batch_id.to_string())),
            };
        };

        let mut snapshots = Vec::with_capacity(batch.execution_ids.len());
        for id in &batch.execution_ids {
            match self.get_execution_status(id).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => debug!("Batch {}: no record of {}: {}", batch_id, id, e),
            }
        }
        Ok(snapshots)
    }

    pub fn active_executions(&self) -> Vec<ExecutionSnapshot> {
        lock(&self.inner.state)
            .executions
            .values()
            .map(ExecutorHandle::snapshot)
            .collect()
    }

    /// Batch history, newest first. Falls back to the batches of this
    /// process when there is no store.
    pub async fn get_batch_history(&self, filter: &BatchFilter, page: Page) -> Result<BatchPage, SchedulerError> {
        match &self.inner.store {
            Some(store) => Ok(store.get_batches(filter, page).await?),
            None => {
                let batches: Vec<Batch> = lock(&self.inner.state)
                    .batches
                    .values()
                    .map(|entry| entry.batch.clone())
                    .collect();
                Ok(BatchPage::paginate(batches, filter, page))
            }
        }
    }

    /// Forgets finished batches. Active batches and their member records are kept.
    pub async fn clear_history(&self) -> Result<usize, SchedulerError> {
        let (removed, active) = {
            let mut state = lock(&self.inner.state);
            let before = state.batches.len();
            state
                .batches
                .retain(|_, entry| !entry.batch.status.is_terminal());
            let active: Vec<String> = state.batches.keys().cloned().collect();
            state.finished.retain(|_, record| {
                matches!(&record.batch_id, Some(batch_id) if active.contains(batch_id))
            });
            (before - active.len(), active)
        };

        let Some(store) = &self.inner.store else {
            return Ok(removed);
        };
        let cleared = {
            let _guard = self.inner.persist.lock().await;
            store.clear_all_batches(&active).await?
        };
        info!("Cleared batch history ({} batches)", cleared);
        Ok(cleared)
    }

    /// Resolves once the execution has finished.
    pub async fn wait_for_execution(&self, execution_id: &str) -> Result<ExecutionSnapshot, SchedulerError> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.inner.is_pending(execution_id) {
                return self.get_execution_status(execution_id).await;
            }
            notified.await;
        }
    }

    /// Resolves once the batch has reached a terminal status.
    pub async fn wait_for_batch(&self, batch_id: &str) -> Result<Batch, SchedulerError> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.inner.batch(batch_id) {
                Some(batch) if batch.status.is_terminal() => return Ok(batch),
                Some(_) => notified.await,
                None => return self.get_batch_status(batch_id).await,
            }
        }
    }
}
