//! The per-upload protocol state machine.
//!
//! A `ResumableUpload` drives one source through
//! `CreatingFile → CheckingFile → UploadingFile → Complete`, issuing at most
//! one request at a time through its `UploadDelegate`. Every transition is
//! persisted before listeners hear about it, so a restarted process can pick
//! the upload up from the store and accept a completion for a request the
//! previous process issued.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::protocol::{self, TusRequest, TusResponse};
use crate::source::ChunkSource;
use crate::transport::{TaskKind, TransportEvent};
use crate::{TaskId, TusConfig, TusError, TusResult, UploadEvent, UploadId, UploadRecord, UploadState};

/// Progress listener: `(bytes_sent, bytes_total)`
pub type ProgressListener = Arc<dyn Fn(u64, u64) + Send + Sync>;
/// Result listener: the final upload URL
pub type ResultListener = Arc<dyn Fn(&str) + Send + Sync>;
/// Failure listener
pub type FailureListener = Arc<dyn Fn(&TusError) + Send + Sync>;

/// What an upload needs from whoever orchestrates it
#[async_trait]
pub trait UploadDelegate: Send + Sync {
    fn config(&self) -> &TusConfig;

    /// Start `request` as a task owned by `upload` after `delay`
    async fn dispatch(
        &self,
        upload: &UploadId,
        kind: TaskKind,
        request: TusRequest,
        delay: Duration,
    ) -> TusResult<TaskId>;

    /// Abort a running task; returns whether one was running
    fn cancel_task(&self, task: &TaskId) -> bool;

    /// Forget the task → upload mapping
    async fn release_task(&self, task: &TaskId);

    async fn task_owner(&self, task: &TaskId) -> Option<UploadId>;

    /// Tasks still mapped to `upload`
    async fn tasks_of(&self, upload: &UploadId) -> Vec<TaskId>;

    async fn save_record(&self, record: &UploadRecord) -> TusResult<()>;

    /// Drop the record from the store and the live set
    async fn remove_record(&self, upload: &UploadId) -> bool;

    fn publish(&self, event: UploadEvent);
}

#[derive(Default, Clone)]
struct Listeners {
    progress: Option<ProgressListener>,
    result: Option<ResultListener>,
    failure: Option<FailureListener>,
}

enum Notice {
    Progress(u64, u64),
    Finished(String),
    Failed(TusError),
}

#[derive(Debug, Clone)]
struct Outstanding {
    task: TaskId,
    kind: TaskKind,
}

struct UploadCore {
    record: UploadRecord,
    source: Arc<dyn ChunkSource>,
    chunk_size: u64,
    outstanding: Option<Outstanding>,
    cancelled: bool,
}

impl UploadCore {
    /// Whether a completion of `kind` belongs to the request the current state issues
    fn expects(&self, kind: &TaskKind) -> bool {
        match (self.record.state, kind) {
            (UploadState::CreatingFile, TaskKind::Create) => true,
            (UploadState::CheckingFile, TaskKind::Check) => true,
            (UploadState::UploadingFile, TaskKind::Patch { offset, .. }) => *offset == self.record.offset,
            _ => false,
        }
    }
}

struct UploadInner {
    id: UploadId,
    length: u64,
    core: Mutex<UploadCore>,
    listeners: RwLock<Listeners>,
    delegate: Weak<dyn UploadDelegate>,
}

/// Handle to one resumable upload; clones share the same upload
#[derive(Clone)]
pub struct ResumableUpload {
    inner: Arc<UploadInner>,
}

impl fmt::Debug for ResumableUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumableUpload")
            .field("id", &self.inner.id)
            .field("length", &self.inner.length)
            .finish()
    }
}

impl ResumableUpload {
    pub(crate) fn new(
        record: UploadRecord,
        source: Arc<dyn ChunkSource>,
        chunk_size: u64,
        delegate: Weak<dyn UploadDelegate>,
    ) -> Self {
        Self {
            inner: Arc::new(UploadInner {
                id: record.id.clone(),
                length: record.length,
                core: Mutex::new(UploadCore {
                    record,
                    source,
                    chunk_size,
                    outstanding: None,
                    cancelled: false,
                }),
                listeners: RwLock::new(Listeners::default()),
                delegate,
            }),
        }
    }

    pub fn id(&self) -> &UploadId {
        &self.inner.id
    }

    /// Declared length of the upload
    pub fn length(&self) -> u64 {
        self.inner.length
    }

    pub async fn state(&self) -> UploadState {
        self.inner.core.lock().await.record.state
    }

    /// Last offset the server confirmed
    pub async fn offset(&self) -> u64 {
        self.inner.core.lock().await.record.offset
    }

    pub async fn remote_url(&self) -> Option<String> {
        self.inner.core.lock().await.record.remote_url.clone()
    }

    /// Copy of the current record
    pub async fn record(&self) -> UploadRecord {
        self.inner.core.lock().await.record.clone()
    }

    /// True when no request is outstanding
    pub async fn is_idle(&self) -> bool {
        self.inner.core.lock().await.outstanding.is_none()
    }

    pub async fn is_complete(&self) -> bool {
        self.inner.core.lock().await.record.state.is_terminal()
    }

    pub async fn is_cancelled(&self) -> bool {
        self.inner.core.lock().await.cancelled
    }

    pub async fn chunk_size(&self) -> u64 {
        self.inner.core.lock().await.chunk_size
    }

    /// Change the PATCH size; only allowed while idle
    pub async fn set_chunk_size(&self, bytes: u64) -> TusResult<()> {
        if bytes == 0 {
            return Err(TusError::Config("chunk size must be greater than zero".to_string()));
        }
        let mut core = self.inner.core.lock().await;
        if core.outstanding.is_some() {
            return Err(TusError::NotIdle);
        }
        core.chunk_size = bytes;
        Ok(())
    }

    pub fn on_progress<F>(&self, listener: F)
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        self.inner.listeners.write().progress = Some(Arc::new(listener));
    }

    pub fn on_result<F>(&self, listener: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.listeners.write().result = Some(Arc::new(listener));
    }

    pub fn on_failure<F>(&self, listener: F)
    where
        F: Fn(&TusError) + Send + Sync + 'static,
    {
        self.inner.listeners.write().failure = Some(Arc::new(listener));
    }

    fn delegate(&self) -> TusResult<Arc<dyn UploadDelegate>> {
        self.inner
            .delegate
            .upgrade()
            .ok_or_else(|| TusError::Config("upload session has been dropped".to_string()))
    }

    /// Issue the request for the current state
    ///
    /// Later failures are reported through the failure listener; a manual
    /// resume starts a fresh retry budget.
    #[instrument(skip(self), fields(upload_id = %self.inner.id))]
    pub async fn resume(&self) -> TusResult<()> {
        let delegate = self.delegate()?;
        let notices = {
            let mut core = self.inner.core.lock().await;
            if core.cancelled {
                return Err(TusError::AlreadyCancelled);
            }
            if core.record.state.is_terminal() {
                return Err(TusError::AlreadyComplete);
            }
            if core.outstanding.is_some() {
                return Err(TusError::NotIdle);
            }

            // Completions for tasks issued before a restart can no longer be adopted
            for task in delegate.tasks_of(&self.inner.id).await {
                delegate.release_task(&task).await;
            }

            debug!(state = %core.record.state, offset = core.record.offset, "Resuming upload");
            core.record.retry_count = 0;
            self.advance(&mut core, delegate.as_ref(), Duration::ZERO).await
        };
        self.notify(notices);
        Ok(())
    }

    /// Abort the outstanding request, keeping state and record
    ///
    /// Returns whether a request was actually stopped.
    #[instrument(skip(self), fields(upload_id = %self.inner.id))]
    pub async fn stop(&self) -> bool {
        let Ok(delegate) = self.delegate() else {
            return false;
        };
        let mut core = self.inner.core.lock().await;
        match core.outstanding.take() {
            Some(outstanding) => {
                delegate.cancel_task(&outstanding.task);
                delegate.release_task(&outstanding.task).await;
                delegate.publish(UploadEvent::Stopped {
                    upload_id: self.inner.id.clone(),
                    at: Utc::now(),
                });
                debug!(task_id = %outstanding.task, kind = outstanding.kind.name(), "Stopped upload");
                true
            }
            None => false,
        }
    }

    /// Alias for `stop`
    pub async fn pause(&self) -> bool {
        self.stop().await
    }

    /// Stop for good: abort the request, delete the record and close the source
    #[instrument(skip(self), fields(upload_id = %self.inner.id))]
    pub async fn cancel(&self) -> TusResult<()> {
        let delegate = self.delegate()?;
        let mut core = self.inner.core.lock().await;
        if core.cancelled {
            return Err(TusError::AlreadyCancelled);
        }
        if core.record.state.is_terminal() {
            return Err(TusError::AlreadyComplete);
        }

        if let Some(outstanding) = core.outstanding.take() {
            delegate.cancel_task(&outstanding.task);
            delegate.release_task(&outstanding.task).await;
        }
        // The upload stays usable until its record is really gone
        if !delegate.remove_record(&self.inner.id).await {
            warn!(offset = core.record.offset, "Failed to remove record of cancelled upload");
            return Err(TusError::Storage(format!(
                "failed to remove record for cancelled upload {}",
                self.inner.id
            )));
        }
        core.cancelled = true;
        core.source.close().await;

        delegate.publish(UploadEvent::Cancelled {
            upload_id: self.inner.id.clone(),
            at: Utc::now(),
        });
        info!(offset = core.record.offset, "Upload cancelled");
        Ok(())
    }

    /// Apply a transport completion; returns whether the upload accepted it
    pub(crate) async fn handle_event(&self, event: TransportEvent) -> bool {
        let Ok(delegate) = self.delegate() else {
            return false;
        };
        let notices = {
            let mut core = self.inner.core.lock().await;
            match &core.outstanding {
                Some(outstanding) if outstanding.task == event.task_id => {}
                Some(_) => {
                    debug!(upload_id = %self.inner.id, task_id = %event.task_id, "Discarding stale completion");
                    return false;
                }
                None => {
                    // Adopt a completion issued by an earlier process, if it still matches
                    let owned = delegate.task_owner(&event.task_id).await.as_ref() == Some(&self.inner.id);
                    if core.cancelled || !owned || !core.expects(&event.kind) {
                        debug!(upload_id = %self.inner.id, task_id = %event.task_id, "Discarding unexpected completion");
                        return false;
                    }
                    debug!(upload_id = %self.inner.id, task_id = %event.task_id, "Adopting completion");
                }
            }
            core.outstanding = None;

            match event.outcome {
                Ok(response) => self.on_response(&mut core, delegate.as_ref(), event.kind, response).await,
                Err(error) => self.on_error(&mut core, delegate.as_ref(), error).await,
            }
        };
        self.notify(notices);
        true
    }

    async fn on_response(
        &self,
        core: &mut UploadCore,
        delegate: &dyn UploadDelegate,
        kind: TaskKind,
        response: TusResponse,
    ) -> Vec<Notice> {
        let parsed = match kind {
            TaskKind::Create => self.created(core, delegate, &response),
            TaskKind::Check => self.checked(core, &response),
            TaskKind::Patch { offset, length } => self.patched(core, &response, offset, length),
        };
        let next = match parsed {
            Ok(next) => next,
            Err(error) => return self.on_error(core, delegate, error).await,
        };

        let advanced = matches!(kind, TaskKind::Patch { .. }) && next.offset > core.record.offset;
        if let Err(error) = self.commit(core, delegate, next).await {
            return self.fail(core, delegate, error);
        }

        let mut notices = Vec::new();
        if advanced {
            let (sent, total) = (core.record.offset, core.record.length);
            debug!(upload_id = %self.inner.id, bytes_sent = sent, bytes_total = total, "Chunk confirmed");
            delegate.publish(UploadEvent::Progress {
                upload_id: self.inner.id.clone(),
                bytes_sent: sent,
                bytes_total: total,
                at: Utc::now(),
            });
            notices.push(Notice::Progress(sent, total));
        }
        notices.extend(self.advance(core, delegate, Duration::ZERO).await);
        notices
    }

    fn created(
        &self,
        core: &UploadCore,
        delegate: &dyn UploadDelegate,
        response: &TusResponse,
    ) -> TusResult<UploadRecord> {
        if !response.is_success() {
            return Err(protocol::status_error(response.status, &delegate.config().endpoint));
        }
        let location = response
            .location()
            .ok_or_else(|| TusError::malformed("creation response has no Location header"))?;
        let url = protocol::resolve_location(&delegate.config().endpoint, location)?;

        info!(upload_id = %self.inner.id, url = %url, "Remote upload created");
        let mut next = core.record.clone();
        next.remote_url = Some(url);
        next.offset = 0;
        next.retry_count = 0;
        next.transition(UploadState::CheckingFile);
        Ok(next)
    }

    fn checked(&self, core: &UploadCore, response: &TusResponse) -> TusResult<UploadRecord> {
        if !response.is_success() {
            let url = core.record.remote_url.as_deref().unwrap_or_default();
            return Err(protocol::status_error(response.status, url));
        }
        let offset = response.offset()?;
        let local = core.record.length;
        if let Some(remote) = response.length()? {
            if remote != local {
                return Err(TusError::LengthMismatch { local, remote });
            }
        }
        if offset > local {
            return Err(TusError::LengthMismatch { local, remote: offset });
        }

        let mut next = core.record.clone();
        if offset > next.offset {
            next.retry_count = 0;
        }
        next.offset = offset;
        next.transition(UploadState::UploadingFile);
        Ok(next)
    }

    fn patched(
        &self,
        core: &UploadCore,
        response: &TusResponse,
        offset: u64,
        length: u64,
    ) -> TusResult<UploadRecord> {
        let expected = offset + length;
        if response.status == 409 {
            let actual = response.offset().unwrap_or(offset);
            return Err(TusError::ProtocolMismatch { expected, actual });
        }
        if !response.is_success() {
            let url = core.record.remote_url.as_deref().unwrap_or_default();
            return Err(protocol::status_error(response.status, url));
        }
        let actual = response.offset()?;
        if actual != expected {
            return Err(TusError::ProtocolMismatch { expected, actual });
        }

        let mut next = core.record.clone();
        next.offset = actual;
        next.retry_count = 0;
        next.transition(UploadState::UploadingFile);
        Ok(next)
    }

    /// Persist `next` and make it current only if the write succeeded
    async fn commit(
        &self,
        core: &mut UploadCore,
        delegate: &dyn UploadDelegate,
        next: UploadRecord,
    ) -> TusResult<()> {
        delegate.save_record(&next).await?;
        core.record = next;
        Ok(())
    }

    async fn on_error(&self, core: &mut UploadCore, delegate: &dyn UploadDelegate, error: TusError) -> Vec<Notice> {
        if error.is_retryable() && core.record.retry_count < delegate.config().max_retries {
            let mut next = core.record.clone();
            next.retry_count += 1;
            if matches!(error, TusError::ProtocolMismatch { .. }) {
                next.transition(UploadState::CheckingFile);
            }
            if let Err(storage) = self.commit(core, delegate, next).await {
                return self.fail(core, delegate, storage);
            }

            let attempt = core.record.retry_count;
            let delay = delegate.config().backoff_for(attempt);
            warn!(
                upload_id = %self.inner.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying request"
            );
            delegate.publish(UploadEvent::Retrying {
                upload_id: self.inner.id.clone(),
                attempt,
                error: error.to_string(),
                at: Utc::now(),
            });
            return self.advance(core, delegate, delay).await;
        }

        if matches!(error, TusError::RemoteNotFound { .. }) {
            // Next manual resume creates a new remote upload
            let mut next = core.record.clone();
            next.remote_url = None;
            next.offset = 0;
            next.retry_count = 0;
            next.transition(UploadState::CreatingFile);
            if let Err(storage) = self.commit(core, delegate, next).await {
                warn!(upload_id = %self.inner.id, error = %storage, "Failed to reset vanished upload");
            }
        }
        self.fail(core, delegate, error)
    }

    fn fail(&self, core: &UploadCore, delegate: &dyn UploadDelegate, error: TusError) -> Vec<Notice> {
        warn!(
            upload_id = %self.inner.id,
            state = %core.record.state,
            offset = core.record.offset,
            error = %error,
            "Upload failed"
        );
        delegate.publish(UploadEvent::Failed {
            upload_id: self.inner.id.clone(),
            error: error.to_string(),
            at: Utc::now(),
        });
        vec![Notice::Failed(error)]
    }

    /// Issue the request the current state calls for
    async fn advance(&self, core: &mut UploadCore, delegate: &dyn UploadDelegate, delay: Duration) -> Vec<Notice> {
        let config = delegate.config();
        let issued = match core.record.state {
            UploadState::Complete => Err(TusError::AlreadyComplete),
            UploadState::CreatingFile => Ok((TaskKind::Create, protocol::creation_request(config, &core.record))),
            UploadState::CheckingFile => match core.record.remote_url.clone() {
                Some(url) => Ok((TaskKind::Check, protocol::offset_request(config, &core.record, &url))),
                None => {
                    core.record.transition(UploadState::CreatingFile);
                    Ok((TaskKind::Create, protocol::creation_request(config, &core.record)))
                }
            },
            UploadState::UploadingFile => {
                if core.record.is_finished() {
                    return self.finish(core, delegate).await;
                }
                self.next_chunk(core, config).await
            }
        };

        let (kind, request) = match issued {
            Ok(issued) => issued,
            Err(error) => return self.fail(core, delegate, error),
        };
        match delegate.dispatch(&self.inner.id, kind, request, delay).await {
            Ok(task) => {
                debug!(upload_id = %self.inner.id, task_id = %task, kind = kind.name(), "Request dispatched");
                core.outstanding = Some(Outstanding { task, kind });
                Vec::new()
            }
            Err(error) => self.fail(core, delegate, error),
        }
    }

    async fn next_chunk(&self, core: &UploadCore, config: &TusConfig) -> TusResult<(TaskKind, TusRequest)> {
        let url = core
            .record
            .remote_url
            .clone()
            .ok_or_else(|| TusError::malformed("upload has no remote URL"))?;
        if !core.source.open().await {
            return Err(TusError::source_unavailable(self.inner.id.as_str(), "source could not be opened"));
        }

        let offset = core.record.offset;
        let chunk = core.source.read(offset, core.chunk_size).await?;
        if chunk.is_empty() {
            return Err(TusError::source_unavailable(
                self.inner.id.as_str(),
                format!("source ended at {} of {} bytes", offset, core.record.length),
            ));
        }
        let kind = TaskKind::Patch {
            offset,
            length: chunk.len() as u64,
        };
        Ok((kind, protocol::chunk_request(config, &core.record, &url, offset, chunk)))
    }

    async fn finish(&self, core: &mut UploadCore, delegate: &dyn UploadDelegate) -> Vec<Notice> {
        core.record.transition(UploadState::Complete);
        let url = core.record.remote_url.clone().unwrap_or_default();

        if !delegate.remove_record(&self.inner.id).await {
            if let Err(e) = delegate.save_record(&core.record).await {
                warn!(upload_id = %self.inner.id, error = %e, "Failed to persist completed upload");
            }
        }
        core.source.close().await;

        info!(upload_id = %self.inner.id, url = %url, bytes = core.record.length, "Upload complete");
        delegate.publish(UploadEvent::Completed {
            upload_id: self.inner.id.clone(),
            location: url.clone(),
            at: Utc::now(),
        });
        vec![Notice::Finished(url)]
    }

    /// Run listeners outside the upload lock
    fn notify(&self, notices: Vec<Notice>) {
        if notices.is_empty() {
            return;
        }
        let listeners = self.inner.listeners.read().clone();
        for notice in notices {
            match notice {
                Notice::Progress(sent, total) => {
                    if let Some(listener) = &listeners.progress {
                        listener(sent, total);
                    }
                }
                Notice::Finished(url) => {
                    if let Some(listener) = &listeners.result {
                        listener(&url);
                    }
                }
                Notice::Failed(error) => {
                    if let Some(listener) = &listeners.failure {
                        listener(&error);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::BufferSource;
    use crate::{SourceLocator, StringMap};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Recorder {
        config: TusConfig,
        dispatched: parking_lot::Mutex<Vec<(TaskId, TaskKind, TusRequest)>>,
        saved: parking_lot::Mutex<Vec<UploadRecord>>,
        tasks: parking_lot::Mutex<HashMap<TaskId, UploadId>>,
        removed: parking_lot::Mutex<Vec<UploadId>>,
        fail_saves: AtomicBool,
        fail_removes: AtomicBool,
    }

    impl Recorder {
        fn last(&self) -> (TaskId, TaskKind, TusRequest) {
            self.dispatched.lock().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl UploadDelegate for Recorder {
        fn config(&self) -> &TusConfig {
            &self.config
        }

        async fn dispatch(
            &self,
            upload: &UploadId,
            kind: TaskKind,
            request: TusRequest,
            _delay: Duration,
        ) -> TusResult<TaskId> {
            let task = TaskId::new();
            self.tasks.lock().insert(task.clone(), upload.clone());
            self.dispatched.lock().push((task.clone(), kind, request));
            Ok(task)
        }

        fn cancel_task(&self, _task: &TaskId) -> bool {
            true
        }

        async fn release_task(&self, task: &TaskId) {
            self.tasks.lock().remove(task);
        }

        async fn task_owner(&self, task: &TaskId) -> Option<UploadId> {
            self.tasks.lock().get(task).cloned()
        }

        async fn tasks_of(&self, upload: &UploadId) -> Vec<TaskId> {
            self.tasks
                .lock()
                .iter()
                .filter(|(_, owner)| *owner == upload)
                .map(|(task, _)| task.clone())
                .collect()
        }

        async fn save_record(&self, record: &UploadRecord) -> TusResult<()> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(TusError::Storage("disk full".to_string()));
            }
            self.saved.lock().push(record.clone());
            Ok(())
        }

        async fn remove_record(&self, upload: &UploadId) -> bool {
            if self.fail_removes.load(Ordering::SeqCst) {
                return false;
            }
            self.removed.lock().push(upload.clone());
            true
        }

        fn publish(&self, _event: UploadEvent) {}
    }

    fn upload(delegate: &Arc<Recorder>, data: &'static [u8], chunk: u64) -> ResumableUpload {
        let record = UploadRecord::new(UploadId::new(), SourceLocator::Memory, data.len() as u64)
            .with_metadata(StringMap::from([("filename".to_string(), "a.bin".to_string())]));
        let weak: Weak<dyn UploadDelegate> = Arc::downgrade(delegate) as Weak<dyn UploadDelegate>;
        ResumableUpload::new(record, Arc::new(BufferSource::new(data)), chunk, weak)
    }

    fn created() -> TusResponse {
        TusResponse::new(201).with_header("Location", "/files/abc")
    }

    fn offset(status: u16, offset: u64) -> TusResponse {
        TusResponse::new(status).with_header("Upload-Offset", offset.to_string())
    }

    async fn complete(upload: &ResumableUpload, recorder: &Recorder, response: TusResponse) -> bool {
        let (task, kind, _) = recorder.last();
        upload.handle_event(TransportEvent::new(task, kind, Ok(response))).await
    }

    #[tokio::test]
    async fn test_walks_every_state_to_completion() {
        let recorder = Arc::new(Recorder::default());
        let upload = upload(&recorder, b"0123456789", 4);
        let urls = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = urls.clone();
        upload.on_result(move |url| seen.lock().push(url.to_string()));

        upload.resume().await.unwrap();
        assert_eq!(recorder.last().1, TaskKind::Create);
        assert!(!upload.is_idle().await);

        assert!(complete(&upload, &recorder, created()).await);
        assert_eq!(upload.state().await, UploadState::CheckingFile);
        assert_eq!(upload.remote_url().await.as_deref(), Some("http://localhost:1080/files/abc"));
        assert_eq!(recorder.last().1, TaskKind::Check);

        assert!(complete(&upload, &recorder, offset(200, 0)).await);
        assert_eq!(recorder.last().1, TaskKind::Patch { offset: 0, length: 4 });
        assert!(complete(&upload, &recorder, offset(204, 4)).await);
        assert_eq!(recorder.last().1, TaskKind::Patch { offset: 4, length: 4 });
        assert!(complete(&upload, &recorder, offset(204, 8)).await);
        assert_eq!(recorder.last().1, TaskKind::Patch { offset: 8, length: 2 });
        assert!(complete(&upload, &recorder, offset(204, 10)).await);

        assert!(upload.is_complete().await);
        assert!(upload.is_idle().await);
        assert_eq!(urls.lock().as_slice(), ["http://localhost:1080/files/abc"]);
        assert_eq!(recorder.removed.lock().len(), 1);
        assert!(matches!(upload.resume().await, Err(TusError::AlreadyComplete)));
        assert!(matches!(upload.cancel().await, Err(TusError::AlreadyComplete)));
    }

    #[tokio::test]
    async fn test_failed_save_keeps_pre_write_state() {
        let recorder = Arc::new(Recorder::default());
        let upload = upload(&recorder, b"abcdef", 3);
        let failures = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = failures.clone();
        upload.on_failure(move |e| seen.lock().push(e.clone()));

        upload.resume().await.unwrap();
        complete(&upload, &recorder, created()).await;
        complete(&upload, &recorder, offset(200, 0)).await;

        recorder.fail_saves.store(true, Ordering::SeqCst);
        complete(&upload, &recorder, offset(204, 3)).await;
        assert!(matches!(failures.lock()[0], TusError::Storage(_)));
        assert_eq!(upload.offset().await, 0);
        assert!(upload.is_idle().await);

        recorder.fail_saves.store(false, Ordering::SeqCst);
        upload.resume().await.unwrap();
        assert_eq!(recorder.last().1, TaskKind::Patch { offset: 0, length: 3 });
    }

    #[tokio::test]
    async fn test_failed_removal_keeps_upload_cancellable() {
        let recorder = Arc::new(Recorder::default());
        let upload = upload(&recorder, b"abcdef", 3);
        upload.resume().await.unwrap();
        complete(&upload, &recorder, created()).await;

        recorder.fail_removes.store(true, Ordering::SeqCst);
        assert!(matches!(upload.cancel().await, Err(TusError::Storage(_))));
        assert!(!upload.is_cancelled().await);
        assert!(upload.is_idle().await);
        assert!(recorder.removed.lock().is_empty());

        recorder.fail_removes.store(false, Ordering::SeqCst);
        upload.cancel().await.unwrap();
        assert!(upload.is_cancelled().await);
        assert_eq!(recorder.removed.lock().as_slice(), [upload.id().clone()]);
        assert!(matches!(upload.cancel().await, Err(TusError::AlreadyCancelled)));
        assert!(matches!(upload.resume().await, Err(TusError::AlreadyCancelled)));
    }

    #[tokio::test]
    async fn test_source_ending_early_fails_instead_of_sending_empty_chunks() {
        struct Shrunk;

        #[async_trait]
        impl ChunkSource for Shrunk {
            fn len(&self) -> u64 {
                6
            }
            async fn open(&self) -> bool {
                true
            }
            async fn read(&self, _offset: u64, _max_size: u64) -> TusResult<bytes::Bytes> {
                Ok(bytes::Bytes::new())
            }
            async fn close(&self) {}
            fn locator(&self) -> SourceLocator {
                SourceLocator::Memory
            }
        }

        let recorder = Arc::new(Recorder::default());
        let record = UploadRecord::new(UploadId::new(), SourceLocator::Memory, 6);
        let weak: Weak<dyn UploadDelegate> = Arc::downgrade(&recorder) as Weak<dyn UploadDelegate>;
        let upload = ResumableUpload::new(record, Arc::new(Shrunk), 3, weak);
        let failures = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = failures.clone();
        upload.on_failure(move |e| seen.lock().push(e.clone()));

        upload.resume().await.unwrap();
        complete(&upload, &recorder, created()).await;
        complete(&upload, &recorder, offset(200, 0)).await;

        assert!(matches!(failures.lock().as_slice(), [TusError::SourceUnavailable { .. }]));
        assert!(upload.is_idle().await);
        assert_eq!(upload.offset().await, 0);
        assert_eq!(recorder.dispatched.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_adopts_only_mapped_matching_completions() {
        let recorder = Arc::new(Recorder::default());
        let upload = upload(&recorder, b"abcdef", 3);
        upload.resume().await.unwrap();
        complete(&upload, &recorder, created()).await;
        complete(&upload, &recorder, offset(200, 0)).await;

        // Simulate a process that lost track of its outstanding request
        let (task, kind, _) = recorder.last();
        assert!(upload.stop().await);
        assert!(!upload.stop().await);
        let unmapped = TransportEvent::new(task.clone(), kind, Ok(offset(204, 3)));
        assert!(!upload.handle_event(unmapped).await);

        recorder.tasks.lock().insert(task.clone(), upload.id().clone());
        let wrong_kind = TransportEvent::new(task.clone(), TaskKind::Check, Ok(offset(200, 3)));
        assert!(!upload.handle_event(wrong_kind).await);

        let adopted = TransportEvent::new(task, kind, Ok(offset(204, 3)));
        assert!(upload.handle_event(adopted).await);
        assert_eq!(upload.offset().await, 3);
    }

    #[tokio::test]
    async fn test_vanished_upload_resets_to_creation() {
        let recorder = Arc::new(Recorder::default());
        let upload = upload(&recorder, b"abcdef", 3);
        upload.resume().await.unwrap();
        complete(&upload, &recorder, created()).await;
        complete(&upload, &recorder, TusResponse::new(404)).await;

        assert!(upload.is_idle().await);
        let record = upload.record().await;
        assert_eq!(record.state, UploadState::CreatingFile);
        assert!(record.remote_url.is_none());

        upload.resume().await.unwrap();
        assert_eq!(recorder.last().1, TaskKind::Create);
    }

    #[tokio::test]
    async fn test_length_mismatch_is_terminal() {
        let recorder = Arc::new(Recorder::default());
        let upload = upload(&recorder, b"abcdef", 3);
        let failures = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = failures.clone();
        upload.on_failure(move |e| seen.lock().push(e.clone()));

        upload.resume().await.unwrap();
        complete(&upload, &recorder, created()).await;
        complete(&upload, &recorder, offset(200, 0).with_header("Upload-Length", "7")).await;

        assert!(matches!(failures.lock()[0], TusError::LengthMismatch { local: 6, remote: 7 }));
        assert_eq!(recorder.dispatched.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_chunk_size_only_changes_while_idle() {
        let recorder = Arc::new(Recorder::default());
        let upload = upload(&recorder, b"abcdef", 3);
        upload.set_chunk_size(2).await.unwrap();
        assert_eq!(upload.chunk_size().await, 2);

        upload.resume().await.unwrap();
        assert!(matches!(upload.set_chunk_size(5).await, Err(TusError::NotIdle)));
        assert!(matches!(upload.resume().await, Err(TusError::NotIdle)));
        assert!(matches!(upload.set_chunk_size(0).await, Err(TusError::Config(_))));
    }
}
