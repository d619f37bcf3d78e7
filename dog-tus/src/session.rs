use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::protocol::{self, ServerInfo, TusRequest};
use crate::source::{self, BufferSource, ChunkSource, FileSource, StagedSource};
use crate::store::UploadStore;
use crate::transport::{TaskKind, TaskRunner, Transport, TransportEvent};
use crate::upload::{ResumableUpload, UploadDelegate};
use crate::{
    StringMap, TaskId, TusConfig, TusError, TusResult, UploadEvent, UploadId, UploadRecord,
};

/// Orchestrates every upload of one process
///
/// Owns the transport, the store and the set of live uploads, and routes
/// transport completions back to the upload that issued them. Cloning is
/// cheap; clones share the same session.
#[derive(Clone)]
pub struct UploadSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: TusConfig,
    store: Arc<dyn UploadStore>,
    runner: TaskRunner,
    uploads: RwLock<HashMap<UploadId, ResumableUpload>>,

    /// Serializes task map writes
    task_map: Mutex<()>,

    event_broadcaster: broadcast::Sender<UploadEvent>,
    me: Weak<SessionInner>,
}

impl UploadSession {
    /// Create a session; must be called from within a tokio runtime
    pub fn new(
        config: TusConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn UploadStore>,
    ) -> TusResult<Self> {
        config.validate()?;
        let (event_broadcaster, _) = broadcast::channel(config.event_capacity);
        let (tx, mut rx) = mpsc::unbounded_channel::<TransportEvent>();

        let inner = Arc::new_cyclic(|me| SessionInner {
            runner: TaskRunner::new(transport, tx),
            config,
            store,
            uploads: RwLock::new(HashMap::new()),
            task_map: Mutex::new(()),
            event_broadcaster,
            me: me.clone(),
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.route(event).await;
            }
            debug!("Upload session event loop finished");
        });

        info!(endpoint = %inner.config.endpoint, "Upload session started");
        Ok(Self { inner })
    }

    /// Session speaking HTTP through reqwest
    #[cfg(feature = "http-client")]
    pub fn with_http(config: TusConfig, store: Arc<dyn UploadStore>) -> TusResult<Self> {
        let transport = crate::transport::ReqwestTransport::new(&config)?;
        Self::new(config, Arc::new(transport), store)
    }

    pub fn config(&self) -> &TusConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn UploadStore> {
        &self.inner.store
    }

    /// Register a new upload for `source`; call `resume` on it to start
    #[instrument(skip(self, source, headers, metadata), fields(length = source.len()))]
    pub async fn create(
        &self,
        source: Arc<dyn ChunkSource>,
        headers: StringMap,
        metadata: StringMap,
    ) -> TusResult<ResumableUpload> {
        let id = self.inner.store.generate_id().await?;
        let record = UploadRecord::new(id, source.locator(), source.len())
            .with_headers(headers)
            .with_metadata(metadata);
        self.register(record, source).await
    }

    /// Upload a file, adding `filename` metadata when absent
    pub async fn create_from_file<P: AsRef<Path>>(
        &self,
        path: P,
        headers: StringMap,
        mut metadata: StringMap,
    ) -> TusResult<ResumableUpload> {
        let path = path.as_ref();
        let source = FileSource::new(path).await?;
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            metadata
                .entry("filename".to_string())
                .or_insert_with(|| name.to_string());
        }
        self.create(Arc::new(source), headers, metadata).await
    }

    /// Upload a byte buffer
    ///
    /// With a staging directory configured the bytes are written to disk
    /// first so the upload can be restored after a restart.
    pub async fn create_from_bytes(
        &self,
        data: Bytes,
        headers: StringMap,
        metadata: StringMap,
    ) -> TusResult<ResumableUpload> {
        let source: Arc<dyn ChunkSource> = match &self.inner.config.staging_dir {
            Some(dir) => Arc::new(StagedSource::from_bytes(dir, &data).await?),
            None => Arc::new(BufferSource::new(data)),
        };
        self.create(source, headers, metadata).await
    }

    /// Continue an upload the server already created at `url`
    pub async fn create_with_upload_url(
        &self,
        url: &str,
        source: Arc<dyn ChunkSource>,
        headers: StringMap,
        metadata: StringMap,
    ) -> TusResult<ResumableUpload> {
        let url = protocol::resolve_location(&self.inner.config.endpoint, url)?;
        let id = self.inner.store.generate_id().await?;
        let record = UploadRecord::new(id, source.locator(), source.len())
            .with_headers(headers)
            .with_metadata(metadata)
            .with_remote_url(url);
        self.register(record, source).await
    }

    async fn register(&self, record: UploadRecord, source: Arc<dyn ChunkSource>) -> TusResult<ResumableUpload> {
        if !source.open().await {
            return Err(TusError::source_unavailable(record.id.as_str(), "source could not be opened"));
        }
        self.inner.store.save(&record).await?;

        let (id, length) = (record.id.clone(), record.length);
        let upload = self.inner.resident(record, source);
        self.inner.publish(UploadEvent::Created {
            upload_id: id.clone(),
            length,
            at: Utc::now(),
        });
        info!(upload_id = %id, length, "Upload created");
        Ok(upload)
    }

    /// Rebuild a stored upload; returns the live one if already resident
    pub async fn restore_upload(&self, id: &UploadId) -> TusResult<ResumableUpload> {
        self.inner.restore(id).await
    }

    /// Rebuild every stored upload whose source is still available
    ///
    /// Uploads that cannot be restored are logged and skipped.
    #[instrument(skip(self))]
    pub async fn restore_all_uploads(&self) -> TusResult<Vec<ResumableUpload>> {
        let mut ids: Vec<UploadId> = self.inner.store.list_ids().await?.into_iter().collect();
        ids.sort();

        let mut restored = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.inner.restore(id).await {
                Ok(upload) => restored.push(upload),
                Err(e) => warn!(upload_id = %id, error = %e, "Skipping upload that cannot be restored"),
            }
        }
        for upload in self.uploads() {
            if !ids.contains(upload.id()) {
                restored.push(upload);
            }
        }

        info!(restored = restored.len(), stored = ids.len(), "Restored uploads");
        Ok(restored)
    }

    /// Cancel every live upload; returns how many were cancelled
    pub async fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for upload in self.uploads() {
            match upload.cancel().await {
                Ok(()) => cancelled += 1,
                Err(e) => debug!(upload_id = %upload.id(), error = %e, "Upload not cancelled"),
            }
        }
        cancelled
    }

    /// Stop every live upload; returns how many had a request in flight
    pub async fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for upload in self.uploads() {
            if upload.stop().await {
                stopped += 1;
            }
        }
        stopped
    }

    /// Resume every idle live upload; returns the ones that started
    pub async fn resume_all(&self) -> Vec<ResumableUpload> {
        let mut resumed = Vec::new();
        for upload in self.uploads() {
            match upload.resume().await {
                Ok(()) => resumed.push(upload),
                Err(e) => debug!(upload_id = %upload.id(), error = %e, "Upload not resumed"),
            }
        }
        resumed
    }

    pub fn upload(&self, id: &UploadId) -> Option<ResumableUpload> {
        self.inner.uploads.read().get(id).cloned()
    }

    pub fn uploads(&self) -> Vec<ResumableUpload> {
        let mut uploads: Vec<ResumableUpload> = self.inner.uploads.read().values().cloned().collect();
        uploads.sort_by(|a, b| a.id().cmp(b.id()));
        uploads
    }

    /// Ask the server which protocol versions and extensions it supports
    pub async fn server_info(&self) -> TusResult<ServerInfo> {
        let request = protocol::options_request(&self.inner.config);
        let response = self.inner.runner.transport().send(request).await?;
        ServerInfo::from_response(&response)
    }

    /// Receive lifecycle events for every upload of this session
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.inner.event_broadcaster.subscribe()
    }

    /// Deliver a transport completion
    ///
    /// The session's own tasks are routed automatically; call this for
    /// completions of requests issued by an earlier process.
    pub async fn handle_transport_event(&self, event: TransportEvent) {
        self.inner.route(event).await;
    }
}

impl SessionInner {
    fn resident(&self, record: UploadRecord, source: Arc<dyn ChunkSource>) -> ResumableUpload {
        let delegate: Weak<dyn UploadDelegate> = self.me.clone();
        let mut uploads = self.uploads.write();
        uploads
            .entry(record.id.clone())
            .or_insert_with(|| ResumableUpload::new(record, source, self.config.chunk_size, delegate))
            .clone()
    }

    async fn restore(&self, id: &UploadId) -> TusResult<ResumableUpload> {
        let live = self.uploads.read().get(id).cloned();
        if let Some(upload) = live {
            return Ok(upload);
        }
        let record = self.store.load(id).await?;
        let source = source::reattach(id, &record.source, record.length).await?;
        debug!(upload_id = %id, state = %record.state, offset = record.offset, "Restored upload");
        Ok(self.resident(record, source))
    }

    async fn route(&self, event: TransportEvent) {
        let task = event.task_id.clone();
        let owner = match self.store.lookup_upload(&task).await {
            Ok(Some(owner)) => owner,
            Ok(None) => {
                debug!(task_id = %task, kind = event.kind.name(), "Discarding completion of unknown task");
                return;
            }
            Err(e) => {
                warn!(task_id = %task, error = %e, "Failed to look up task owner");
                return;
            }
        };

        let upload = match self.restore(&owner).await {
            Ok(upload) => upload,
            Err(e) => {
                warn!(upload_id = %owner, task_id = %task, error = %e, "Dropping completion for unrestorable upload");
                self.release_task(&task).await;
                return;
            }
        };

        upload.handle_event(event).await;
        self.release_task(&task).await;
    }
}

#[async_trait]
impl UploadDelegate for SessionInner {
    fn config(&self) -> &TusConfig {
        &self.config
    }

    async fn dispatch(
        &self,
        upload: &UploadId,
        kind: TaskKind,
        request: TusRequest,
        delay: Duration,
    ) -> TusResult<TaskId> {
        let task = TaskId::new();
        {
            let _guard = self.task_map.lock().await;
            self.store.map_task(&task, upload).await?;
        }
        self.runner.spawn(task.clone(), kind, request, delay);
        Ok(task)
    }

    fn cancel_task(&self, task: &TaskId) -> bool {
        self.runner.cancel(task)
    }

    async fn release_task(&self, task: &TaskId) {
        let _guard = self.task_map.lock().await;
        if let Err(e) = self.store.unmap_task(task).await {
            warn!(task_id = %task, error = %e, "Failed to release task mapping");
        }
    }

    async fn task_owner(&self, task: &TaskId) -> Option<UploadId> {
        self.store.lookup_upload(task).await.ok().flatten()
    }

    async fn tasks_of(&self, upload: &UploadId) -> Vec<TaskId> {
        self.store.tasks_for(upload).await.unwrap_or_default()
    }

    async fn save_record(&self, record: &UploadRecord) -> TusResult<()> {
        self.store.save(record).await
    }

    async fn remove_record(&self, upload: &UploadId) -> bool {
        let removed = {
            let _guard = self.task_map.lock().await;
            self.store.remove(upload).await
        };
        if removed {
            self.uploads.write().remove(upload);
        }
        removed
    }

    fn publish(&self, event: UploadEvent) {
        // No subscribers is fine
        let _ = self.event_broadcaster.send(event);
    }
}
