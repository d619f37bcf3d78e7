//! Persistent upload records plus the task → upload correlation map.

mod file;
mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::{TaskId, TusResult, UploadId, UploadRecord};

pub use file::FileUploadStore;
pub use memory::MemoryUploadStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteUploadStore;

/// Storage for upload records and task mappings
///
/// Implementations serialize their own writes; a `save` that returns `Ok` is
/// durable.
#[async_trait]
pub trait UploadStore: Send + Sync {
    /// Insert or replace the record under `record.id`
    async fn save(&self, record: &UploadRecord) -> TusResult<()>;

    /// Load a record, `NotFound` if absent
    async fn load(&self, id: &UploadId) -> TusResult<UploadRecord>;

    /// Remove a record and every task mapping pointing at it
    ///
    /// Returns true when the record is gone afterwards (including when it was
    /// never there) and false on a storage failure.
    async fn remove(&self, id: &UploadId) -> bool;

    async fn contains(&self, id: &UploadId) -> TusResult<bool>;

    async fn list_ids(&self) -> TusResult<HashSet<UploadId>>;

    /// A fresh identifier not used by any stored record
    async fn generate_id(&self) -> TusResult<UploadId> {
        loop {
            let id = UploadId::new();
            if !self.contains(&id).await? {
                return Ok(id);
            }
        }
    }

    async fn map_task(&self, task: &TaskId, upload: &UploadId) -> TusResult<()>;

    async fn lookup_upload(&self, task: &TaskId) -> TusResult<Option<UploadId>>;

    async fn unmap_task(&self, task: &TaskId) -> TusResult<()>;

    /// Every task currently mapped to `upload`
    async fn tasks_for(&self, upload: &UploadId) -> TusResult<Vec<TaskId>>;
}
