use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::UploadStore;
use crate::{TaskId, TusError, TusResult, UploadId, UploadRecord};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    uploads: BTreeMap<UploadId, UploadRecord>,
    #[serde(default)]
    tasks: BTreeMap<TaskId, UploadId>,
}

/// Store persisted as one JSON document
///
/// Every mutation rewrites the document through a temporary file followed by
/// fsync and rename, so a crash leaves either the old or the new version.
#[derive(Debug)]
pub struct FileUploadStore {
    path: PathBuf,
    doc: Mutex<StoreDocument>,
}

impl FileUploadStore {
    /// Open the store at `path`, starting empty if the file does not exist
    pub async fn open<P: AsRef<Path>>(path: P) -> TusResult<Self> {
        let path = path.as_ref().to_path_buf();
        let doc = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == ErrorKind::NotFound => StoreDocument::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), "Opened upload store");
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, doc: &StoreDocument) -> TusResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(TusError::storage)?;
            }
        }

        let raw = serde_json::to_vec_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp).await.map_err(TusError::storage)?;
        file.write_all(&raw).await.map_err(TusError::storage)?;
        file.sync_all().await.map_err(TusError::storage)?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await.map_err(TusError::storage)?;

        // The rename itself lives in the directory entry
        #[cfg(unix)]
        {
            let dir = match self.path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            let dir = tokio::fs::File::open(dir).await.map_err(TusError::storage)?;
            dir.sync_all().await.map_err(TusError::storage)?;
        }
        Ok(())
    }

    /// Apply `change` to a copy, persist it, then make it current
    async fn mutate<F>(&self, change: F) -> TusResult<()>
    where
        F: FnOnce(&mut StoreDocument) + Send,
    {
        let mut doc = self.doc.lock().await;
        let mut next = doc.clone();
        change(&mut next);
        self.persist(&next).await?;
        *doc = next;
        Ok(())
    }
}

#[async_trait]
impl UploadStore for FileUploadStore {
    async fn save(&self, record: &UploadRecord) -> TusResult<()> {
        let record = record.clone();
        self.mutate(move |doc| {
            doc.uploads.insert(record.id.clone(), record);
        })
        .await
    }

    async fn load(&self, id: &UploadId) -> TusResult<UploadRecord> {
        self.doc
            .lock()
            .await
            .uploads
            .get(id)
            .cloned()
            .ok_or_else(|| TusError::NotFound(id.to_string()))
    }

    async fn remove(&self, id: &UploadId) -> bool {
        let result = self
            .mutate(|doc| {
                doc.uploads.remove(id);
                doc.tasks.retain(|_, owner| owner != id);
            })
            .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(upload_id = %id, error = %e, "Failed to remove upload record");
                false
            }
        }
    }

    async fn contains(&self, id: &UploadId) -> TusResult<bool> {
        Ok(self.doc.lock().await.uploads.contains_key(id))
    }

    async fn list_ids(&self) -> TusResult<HashSet<UploadId>> {
        Ok(self.doc.lock().await.uploads.keys().cloned().collect())
    }

    async fn map_task(&self, task: &TaskId, upload: &UploadId) -> TusResult<()> {
        let (task, upload) = (task.clone(), upload.clone());
        self.mutate(move |doc| {
            doc.tasks.insert(task, upload);
        })
        .await
    }

    async fn lookup_upload(&self, task: &TaskId) -> TusResult<Option<UploadId>> {
        Ok(self.doc.lock().await.tasks.get(task).cloned())
    }

    async fn unmap_task(&self, task: &TaskId) -> TusResult<()> {
        if !self.doc.lock().await.tasks.contains_key(task) {
            return Ok(());
        }
        self.mutate(|doc| {
            doc.tasks.remove(task);
        })
        .await
    }

    async fn tasks_for(&self, upload: &UploadId) -> TusResult<Vec<TaskId>> {
        Ok(self
            .doc
            .lock()
            .await
            .tasks
            .iter()
            .filter(|(_, owner)| *owner == upload)
            .map(|(task, _)| task.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SourceLocator, UploadState};

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uploads.json");

        let id = {
            let store = FileUploadStore::open(&path).await.unwrap();
            let id = store.generate_id().await.unwrap();
            let mut record = UploadRecord::new(id.clone(), SourceLocator::Memory, 10)
                .with_remote_url("http://localhost/files/1");
            record.offset = 4;
            record.transition(UploadState::UploadingFile);
            store.save(&record).await.unwrap();
            store.map_task(&TaskId::from("task_1"), &id).await.unwrap();
            id
        };

        let reopened = FileUploadStore::open(&path).await.unwrap();
        let record = reopened.load(&id).await.unwrap();
        assert_eq!(record.offset, 4);
        assert_eq!(record.state, UploadState::UploadingFile);
        assert_eq!(reopened.lookup_upload(&TaskId::from("task_1")).await.unwrap(), Some(id.clone()));
        assert!(!path.with_extension("json.tmp").exists());

        assert!(reopened.remove(&id).await);
        let again = FileUploadStore::open(&path).await.unwrap();
        assert!(again.list_ids().await.unwrap().is_empty());
        assert_eq!(again.lookup_upload(&TaskId::from("task_1")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_document_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uploads.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();
        assert!(matches!(FileUploadStore::open(&path).await, Err(TusError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uploads.json");
        let store = FileUploadStore::open(&path).await.unwrap();
        let record = UploadRecord::new(UploadId::from("upl_1"), SourceLocator::Memory, 3);
        store.save(&record).await.unwrap();

        // A directory where the temp file should go makes the next write fail
        tokio::fs::create_dir(path.with_extension("json.tmp")).await.unwrap();
        let second = UploadRecord::new(UploadId::from("upl_2"), SourceLocator::Memory, 3);
        assert!(matches!(store.save(&second).await, Err(TusError::Storage(_))));
        assert!(!store.contains(&second.id).await.unwrap());
        assert!(store.contains(&record.id).await.unwrap());
    }
}
