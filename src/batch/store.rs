//! Batch Persistence
//!
//! Durable bookkeeping for batches and finished executions. The scheduler
//! treats the store as best effort: every call may fail and the engine
//! keeps running without history.
//!
//! [`FileBatchStore`] keeps one pretty-printed JSON document per record:
//!
//! ```text
//! <data_dir>/batches/<batch id>.json
//! <data_dir>/executions/<execution id>.json
//! ```

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;

use crate::error::StoreError;
use crate::execution::ExecutionSnapshot;
use crate::lock;

use super::model::{Batch, BatchCounts, BatchFilter, BatchPage, BatchStatus, Page};

/// Persistence contract of the scheduler.
#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn save_batch(&self, batch: &Batch) -> Result<(), StoreError>;

    /// Stores the latest snapshot of an execution.
    async fn save_execution(&self, record: &ExecutionSnapshot) -> Result<(), StoreError>;

    /// Updates counters and status of a stored batch; sets its end time
    /// once the status is terminal.
    async fn update_batch_progress(
        &self,
        batch_id: &str,
        counts: &BatchCounts,
        status: BatchStatus,
    ) -> Result<(), StoreError>;

    async fn get_batch(&self, batch_id: &str) -> Result<Option<Batch>, StoreError>;

    async fn get_batches(&self, filter: &BatchFilter, page: Page) -> Result<BatchPage, StoreError>;

    async fn get_batch_executions(&self, batch_id: &str) -> Result<Vec<ExecutionSnapshot>, StoreError>;

    async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionSnapshot>, StoreError>;

    async fn mark_batch_stopped(&self, batch_id: &str) -> Result<(), StoreError>;

    /// Deletes every batch not listed in `keep`, with the records of its
    /// members. Returns the number of batches removed.
    async fn clear_all_batches(&self, keep: &[String]) -> Result<usize, StoreError>;
}

fn apply_progress(batch: &mut Batch, counts: &BatchCounts, status: BatchStatus) {
    batch.counts = *counts;
    batch.status = status;
    if status.is_terminal() && batch.end_time.is_none() {
        batch.end_time = Some(Utc::now());
    }
}

fn missing_batch(batch_id: &str) -> StoreError {
    StoreError::Unavailable(format!("batch '{}' is not stored", batch_id))
}

/// Keeps everything in memory; history is lost with the process.
#[derive(Debug, Default)]
pub struct MemoryBatchStore {
    batches: Mutex<HashMap<String, Batch>>,
    executions: Mutex<HashMap<String, ExecutionSnapshot>>,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchStore for MemoryBatchStore {
    async fn save_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        lock(&self.batches).insert(batch.id.clone(), batch.clone());
        Ok(())
    }

    async fn save_execution(&self, record: &ExecutionSnapshot) -> Result<(), StoreError> {
        lock(&self.executions).insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update_batch_progress(
        &self,
        batch_id: &str,
        counts: &BatchCounts,
        status: BatchStatus,
    ) -> Result<(), StoreError> {
        let mut batches = lock(&self.batches);
        let batch = batches.get_mut(batch_id).ok_or_else(|| missing_batch(batch_id))?;
        apply_progress(batch, counts, status);
        Ok(())
    }

    async fn get_batch(&self, batch_id: &str) -> Result<Option<Batch>, StoreError> {
        Ok(lock(&self.batches).get(batch_id).cloned())
    }

    async fn get_batches(&self, filter: &BatchFilter, page: Page) -> Result<BatchPage, StoreError> {
        let batches: Vec<Batch> = lock(&self.batches).values().cloned().collect();
        Ok(BatchPage::paginate(batches, filter, page))
    }

    async fn get_batch_executions(&self, batch_id: &str) -> Result<Vec<ExecutionSnapshot>, StoreError> {
        let mut records: Vec<ExecutionSnapshot> = lock(&self.executions)
            .values()
            .filter(|r| r.batch_id.as_deref() == Some(batch_id))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionSnapshot>, StoreError> {
        Ok(lock(&self.executions).get(execution_id).cloned())
    }

    async fn mark_batch_stopped(&self, batch_id: &str) -> Result<(), StoreError> {
        let mut batches = lock(&self.batches);
        let batch = batches.get_mut(batch_id).ok_or_else(|| missing_batch(batch_id))?;
        batch.close(BatchStatus::Stopped);
        Ok(())
    }

    async fn clear_all_batches(&self, keep: &[String]) -> Result<usize, StoreError> {
        let removed = {
            let mut batches = lock(&self.batches);
            let before = batches.len();
            batches.retain(|id, _| keep.contains(id));
            before - batches.len()
        };
        lock(&self.executions).retain(|_, r| match &r.batch_id {
            Some(batch_id) => keep.contains(batch_id),
            None => true,
        });
        Ok(removed)
    }
}

/// JSON files under a data directory.
#[derive(Debug, Clone)]
pub struct FileBatchStore {
    batches_dir: PathBuf,
    executions_dir: PathBuf,
}

impl FileBatchStore {
    /// Opens the store, creating its directories.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref();
        let store = Self {
            batches_dir: data_dir.join("batches"),
            executions_dir: data_dir.join("executions"),
        };
        fs::create_dir_all(&store.batches_dir).await?;
        fs::create_dir_all(&store.executions_dir).await?;

        info!("Batch store opened at {}", data_dir.display());
        Ok(store)
    }

    fn batch_path(&self, batch_id: &str) -> PathBuf {
        self.batches_dir.join(format!("{}.json", file_stem(batch_id)))
    }

    fn execution_path(&self, execution_id: &str) -> PathBuf {
        self.executions_dir.join(format!("{}.json", file_stem(execution_id)))
    }

    async fn load_batch(&self, batch_id: &str) -> Result<Batch, StoreError> {
        read_json(&self.batch_path(batch_id))
            .await?
            .ok_or_else(|| missing_batch(batch_id))
    }
}

/// Keeps ids from escaping the store directory.
fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Writes through a temporary file so readers never see partial JSON.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).await?;
    fs::rename(&tmp, path).await?;
    debug!("Saved {}", path.display());
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Reads every record of a directory, skipping unreadable ones.
async fn read_all<T: DeserializeOwned>(dir: &Path) -> Result<Vec<(PathBuf, T)>, StoreError> {
    let mut records = Vec::new();
    let mut entries = fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match read_json(&path).await {
            Ok(Some(record)) => records.push((path, record)),
            Ok(None) => {}
            Err(e) => warn!("Skipping unreadable record {}: {}", path.display(), e),
        }
    }
    Ok(records)
}

#[async_trait]
impl BatchStore for FileBatchStore {
    async fn save_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        write_json(&self.batch_path(&batch.id), batch).await
    }

    async fn save_execution(&self, record: &ExecutionSnapshot) -> Result<(), StoreError> {
        write_json(&self.execution_path(&record.id), record).await
    }

    async fn update_batch_progress(
        &self,
        batch_id: &str,
        counts: &BatchCounts,
        status: BatchStatus,
    ) -> Result<(), StoreError> {
        let mut batch = self.load_batch(batch_id).await?;
        apply_progress(&mut batch, counts, status);
        self.save_batch(&batch).await
    }

    async fn get_batch(&self, batch_id: &str) -> Result<Option<Batch>, StoreError> {
        read_json(&self.batch_path(batch_id)).await
    }

    async fn get_batches(&self, filter: &BatchFilter, page: Page) -> Result<BatchPage, StoreError> {
        let batches = read_all::<Batch>(&self.batches_dir)
            .await?
            .into_iter()
            .map(|(_, batch)| batch);
        Ok(BatchPage::paginate(batches, filter, page))
    }

    async fn get_batch_executions(&self, batch_id: &str) -> Result<Vec<ExecutionSnapshot>, StoreError> {
        let mut records: Vec<ExecutionSnapshot> = read_all::<ExecutionSnapshot>(&self.executions_dir)
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .filter(|r| r.batch_id.as_deref() == Some(batch_id))
            .collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionSnapshot>, StoreError> {
        read_json(&self.execution_path(execution_id)).await
    }

    async fn mark_batch_stopped(&self, batch_id: &str) -> Result<(), StoreError> {
        let mut batch = self.load_batch(batch_id).await?;
        batch.close(BatchStatus::Stopped);
        self.save_batch(&batch).await
    }

    async fn clear_all_batches(&self, keep: &[String]) -> Result<usize, StoreError> {
        let mut removed = 0;
        for (path, batch) in read_all::<Batch>(&self.batches_dir).await? {
            if !keep.contains(&batch.id) {
                fs::remove_file(&path).await?;
                removed += 1;
            }
        }

        for (path, record) in read_all::<ExecutionSnapshot>(&self.executions_dir).await? {
            if matches!(&record.batch_id, Some(batch_id) if !keep.contains(batch_id)) {
                fs::remove_file(&path).await?;
            }
        }

        info!("Cleared {} batches from history", removed);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::model::{sample_batch, SourceType};
    use crate::execution::ExecutionStatus;
    use tempfile::tempdir;

    fn record(id: &str, batch_id: Option<&str>) -> ExecutionSnapshot {
        let mut record = ExecutionSnapshot::new(id, "wf");
        record.batch_id = batch_id.map(str::to_string);
        record.status = ExecutionStatus::Completed;
        record
    }

    async fn exercise(store: &dyn BatchStore) {
        let batch = sample_batch("b1", BatchStatus::Running, SourceType::Folder);
        store.save_batch(&batch).await.unwrap();
        store.save_execution(&record("e1", Some("b1"))).await.unwrap();
        store.save_execution(&record("e2", None)).await.unwrap();

        let mut counts = batch.counts;
        counts.admit();
        counts.finish(true);
        store
            .update_batch_progress("b1", &counts, BatchStatus::Completed)
            .await
            .unwrap();

        let stored = store.get_batch("b1").await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Completed);
        assert_eq!(stored.counts.completed, 1);
        assert!(stored.end_time.is_some());

        let members = store.get_batch_executions("b1").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id, "e1");

        let page = store
            .get_batches(&BatchFilter::default().source_type(SourceType::Folder), Page::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);

        assert_eq!(store.clear_all_batches(&[]).await.unwrap(), 1);
        assert!(store.get_batch("b1").await.unwrap().is_none());
        assert!(store.get_execution("e1").await.unwrap().is_none());
        assert!(store.get_execution("e2").await.unwrap().is_some());
    }

    async fn exercise_clear_keeps_live(store: &dyn BatchStore) {
        for id in ["done", "live"] {
            store
                .save_batch(&sample_batch(id, BatchStatus::Running, SourceType::Files))
                .await
                .unwrap();
        }
        store.save_execution(&record("d1", Some("done"))).await.unwrap();
        store.save_execution(&record("l1", Some("live"))).await.unwrap();

        assert_eq!(store.clear_all_batches(&["live".to_string()]).await.unwrap(), 1);
        assert!(store.get_batch("done").await.unwrap().is_none());
        assert!(store.get_execution("d1").await.unwrap().is_none());
        assert!(store.get_batch("live").await.unwrap().is_some());
        assert_eq!(store.get_batch_executions("live").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_keeps_listed_batches() {
        exercise_clear_keeps_live(&MemoryBatchStore::new()).await;

        let dir = tempdir().unwrap();
        let store = FileBatchStore::open(dir.path()).await.unwrap();
        exercise_clear_keeps_live(&store).await;
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryBatchStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store() {
        let dir = tempdir().unwrap();
        let store = FileBatchStore::open(dir.path()).await.unwrap();
        exercise(&store).await;
        assert!(dir.path().join("batches").is_dir());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileBatchStore::open(dir.path()).await.unwrap();
            let batch = sample_batch("b1", BatchStatus::Running, SourceType::Files);
            store.save_batch(&batch).await.unwrap();
        }

        let store = FileBatchStore::open(dir.path()).await.unwrap();
        store.mark_batch_stopped("b1").await.unwrap();
        let batch = store.get_batch("b1").await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Stopped);
    }

    #[tokio::test]
    async fn test_progress_on_unknown_batch_fails() {
        let store = MemoryBatchStore::new();
        let result = store
            .update_batch_progress("ghost", &BatchCounts::default(), BatchStatus::Running)
            .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_file_store_skips_corrupt_records() {
        let dir = tempdir().unwrap();
        let store = FileBatchStore::open(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("batches").join("bad.json"), "{ not json").unwrap();
        store
            .save_batch(&sample_batch("ok", BatchStatus::Completed, SourceType::Files))
            .await
            .unwrap();

        let page = store.get_batches(&BatchFilter::default(), Page::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert!(file_stem("../etc/passwd").chars().all(|c| c != '/' && c != '.'));
    }
}
