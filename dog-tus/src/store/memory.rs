use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::UploadStore;
use crate::{TaskId, TusError, TusResult, UploadId, UploadRecord};

/// In-memory store for tests and short-lived processes
#[derive(Debug, Clone, Default)]
pub struct MemoryUploadStore {
    /// Records indexed by upload id
    records: Arc<RwLock<HashMap<UploadId, UploadRecord>>>,

    /// Task id -> owning upload
    tasks: Arc<RwLock<HashMap<TaskId, UploadId>>>,
}

impl MemoryUploadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl UploadStore for MemoryUploadStore {
    async fn save(&self, record: &UploadRecord) -> TusResult<()> {
        self.records.write().insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, id: &UploadId) -> TusResult<UploadRecord> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| TusError::NotFound(id.to_string()))
    }

    async fn remove(&self, id: &UploadId) -> bool {
        self.records.write().remove(id);
        self.tasks.write().retain(|_, owner| owner != id);
        true
    }

    async fn contains(&self, id: &UploadId) -> TusResult<bool> {
        Ok(self.records.read().contains_key(id))
    }

    async fn list_ids(&self) -> TusResult<HashSet<UploadId>> {
        Ok(self.records.read().keys().cloned().collect())
    }

    async fn map_task(&self, task: &TaskId, upload: &UploadId) -> TusResult<()> {
        self.tasks.write().insert(task.clone(), upload.clone());
        Ok(())
    }

    async fn lookup_upload(&self, task: &TaskId) -> TusResult<Option<UploadId>> {
        Ok(self.tasks.read().get(task).cloned())
    }

    async fn unmap_task(&self, task: &TaskId) -> TusResult<()> {
        self.tasks.write().remove(task);
        Ok(())
    }

    async fn tasks_for(&self, upload: &UploadId) -> TusResult<Vec<TaskId>> {
        Ok(self
            .tasks
            .read()
            .iter()
            .filter(|(_, owner)| *owner == upload)
            .map(|(task, _)| task.clone())
            .collect())
    }
}
