#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use dog_tus::protocol::Method;
use dog_tus::{
    ResumableUpload, Transport, TusConfig, TusError, TusRequest, TusResponse, TusResult,
};

pub const ENDPOINT: &str = "http://tus.test/files/";

/// Config with a tiny backoff so retries do not slow the tests down
pub fn test_config(chunk_size: u64) -> TusConfig {
    TusConfig::new(ENDPOINT)
        .with_chunk_size(chunk_size)
        .with_retry_backoff(Duration::from_millis(1), Duration::from_millis(5))
}

/// What a scripted fault does to a request
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// The request never reaches the server
    Transport,
    /// The server answers with this status and does nothing
    Status(u16),
    /// The server drops the PATCH body and reports its unchanged offset
    DropBody,
}

#[derive(Debug)]
struct Script {
    method: Method,
    skip: usize,
    times: u32,
    fault: Fault,
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: String,
    pub offset: Option<u64>,
    pub body_len: u64,
}

#[derive(Debug, Default)]
struct RemoteUpload {
    length: u64,
    data: Vec<u8>,
}

#[derive(Default)]
struct ServerState {
    uploads: HashMap<String, RemoteUpload>,
    next_id: u64,
    requests: Vec<RecordedRequest>,
    scripts: Vec<Script>,
    latency: Duration,
}

/// In-memory tus server speaking through the `Transport` trait
#[derive(Default)]
pub struct MockTusServer {
    state: Mutex<ServerState>,
}

impl MockTusServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Let `skip` matching requests through, then apply `fault` to the next `times`
    pub fn inject(&self, method: Method, skip: usize, times: u32, fault: Fault) {
        self.state.lock().scripts.push(Script {
            method,
            skip,
            times,
            fault,
        });
    }

    /// Delay every response by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    pub fn count(&self, method: Method) -> usize {
        self.state.lock().requests.iter().filter(|r| r.method == method).count()
    }

    /// Offsets of every PATCH, in order
    pub fn patch_offsets(&self) -> Vec<u64> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.method == Method::Patch)
            .filter_map(|r| r.offset)
            .collect()
    }

    /// Bytes the server holds for `url`
    pub fn received(&self, url: &str) -> Option<Vec<u8>> {
        self.state.lock().uploads.get(url).map(|u| u.data.clone())
    }

    /// Forget an upload, as an expiring server would
    pub fn lose(&self, url: &str) {
        self.state.lock().uploads.remove(url);
    }

    /// Apply bytes directly, as if a PATCH had been received but never answered
    pub fn append(&self, url: &str, bytes: &[u8]) {
        if let Some(upload) = self.state.lock().uploads.get_mut(url) {
            upload.data.extend_from_slice(bytes);
        }
    }

    fn scripted(state: &mut ServerState, method: Method) -> Option<Fault> {
        for script in state.scripts.iter_mut().filter(|s| s.method == method) {
            if script.skip > 0 {
                script.skip -= 1;
                return None;
            }
            if script.times > 0 {
                script.times -= 1;
                return Some(script.fault);
            }
        }
        None
    }

    fn handle(&self, request: TusRequest) -> TusResult<TusResponse> {
        let mut state = self.state.lock();
        let offset = request.header_value("Upload-Offset").and_then(|v| v.parse().ok());
        state.requests.push(RecordedRequest {
            method: request.method,
            url: request.url.clone(),
            offset,
            body_len: request.body_len(),
        });

        let fault = Self::scripted(&mut state, request.method);
        match fault {
            Some(Fault::Transport) => return Err(TusError::transport("injected connection reset")),
            Some(Fault::Status(status)) => return Ok(TusResponse::new(status)),
            _ => {}
        }
        if request.header_value("Tus-Resumable") != Some("1.0.0") {
            return Ok(TusResponse::new(412));
        }

        match request.method {
            Method::Options => Ok(TusResponse::new(204)
                .with_header("Tus-Resumable", "1.0.0")
                .with_header("Tus-Version", "1.0.0")
                .with_header("Tus-Extension", "creation")),
            Method::Post => {
                let Some(length) = request.header_value("Upload-Length").and_then(|v| v.parse().ok()) else {
                    return Ok(TusResponse::new(400));
                };
                state.next_id += 1;
                let path = format!("/files/{}", state.next_id);
                state.uploads.insert(
                    format!("http://tus.test{}", path),
                    RemoteUpload {
                        length,
                        data: Vec::new(),
                    },
                );
                Ok(TusResponse::new(201).with_header("Location", path))
            }
            Method::Head => match state.uploads.get(&request.url) {
                Some(upload) => Ok(TusResponse::new(200)
                    .with_header("Upload-Offset", upload.data.len().to_string())
                    .with_header("Upload-Length", upload.length.to_string())),
                None => Ok(TusResponse::new(404)),
            },
            Method::Patch => {
                let Some(upload) = state.uploads.get_mut(&request.url) else {
                    return Ok(TusResponse::new(404));
                };
                let current = upload.data.len() as u64;
                if request.header_value("Content-Type") != Some("application/offset+octet-stream") {
                    return Ok(TusResponse::new(415));
                }
                if offset != Some(current) {
                    return Ok(TusResponse::new(409).with_header("Upload-Offset", current.to_string()));
                }
                if !matches!(fault, Some(Fault::DropBody)) {
                    if let Some(body) = &request.body {
                        upload.data.extend_from_slice(body);
                    }
                }
                Ok(TusResponse::new(204).with_header("Upload-Offset", upload.data.len().to_string()))
            }
        }
    }
}

#[async_trait]
impl Transport for MockTusServer {
    async fn send(&self, request: TusRequest) -> TusResult<TusResponse> {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.handle(request)
    }
}

/// Terminal outcome of one upload run
#[derive(Debug)]
pub enum Outcome {
    Finished(String),
    Failed(TusError),
}

/// Everything the listeners of one upload heard
pub struct Observer {
    pub progress: Arc<Mutex<Vec<(u64, u64)>>>,
    outcomes: mpsc::UnboundedReceiver<Outcome>,
}

impl Observer {
    pub fn attach(upload: &ResumableUpload) -> Self {
        let progress = Arc::new(Mutex::new(Vec::new()));
        let (tx, outcomes) = mpsc::unbounded_channel();

        let seen = progress.clone();
        upload.on_progress(move |sent, total| seen.lock().push((sent, total)));
        let results = tx.clone();
        upload.on_result(move |url| {
            let _ = results.send(Outcome::Finished(url.to_string()));
        });
        upload.on_failure(move |error| {
            let _ = tx.send(Outcome::Failed(error.clone()));
        });

        Self { progress, outcomes }
    }

    /// Wait for the next terminal outcome
    pub async fn outcome(&mut self) -> Outcome {
        tokio::time::timeout(Duration::from_secs(5), self.outcomes.recv())
            .await
            .expect("Timeout waiting for upload outcome")
            .expect("Listener channel closed")
    }

    pub async fn finished(&mut self) -> String {
        match self.outcome().await {
            Outcome::Finished(url) => url,
            Outcome::Failed(error) => panic!("upload failed: {}", error),
        }
    }

    pub async fn failed(&mut self) -> TusError {
        match self.outcome().await {
            Outcome::Failed(error) => error,
            Outcome::Finished(url) => panic!("upload unexpectedly finished at {}", url),
        }
    }

    /// True if no outcome arrives within `wait`
    pub async fn quiet_for(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.outcomes.recv()).await.is_err()
    }

    pub fn progress(&self) -> Vec<(u64, u64)> {
        self.progress.lock().clone()
    }
}

/// Deterministic test payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
