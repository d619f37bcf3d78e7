//! HTTP capability and the task runner that turns requests into
//! identifiable background tasks.

#[cfg(feature = "http-client")]
pub mod http;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::protocol::{TusRequest, TusResponse};
use crate::{TaskId, TusResult};

#[cfg(feature = "http-client")]
pub use http::ReqwestTransport;

/// Anything that can perform a single HTTP exchange
///
/// Implementations report connection failures and timeouts as
/// `TusError::Transport`; any HTTP status, including errors, is returned as a
/// response so the state machine can classify it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TusRequest) -> TusResult<TusResponse>;
}

/// What a task was issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// `POST` creating the remote upload
    Create,
    /// `HEAD` asking for the remote offset
    Check,
    /// `PATCH` of `length` bytes starting at `offset`
    Patch { offset: u64, length: u64 },
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Check => "check",
            Self::Patch { .. } => "patch",
        }
    }
}

/// Completion of a transport task
#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub outcome: TusResult<TusResponse>,
}

impl TransportEvent {
    pub fn new(task_id: TaskId, kind: TaskKind, outcome: TusResult<TusResponse>) -> Self {
        Self {
            task_id,
            kind,
            outcome,
        }
    }
}

/// Runs requests on the tokio runtime and reports completions on a channel
pub(crate) struct TaskRunner {
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<TransportEvent>,
    running: Arc<Mutex<HashMap<TaskId, AbortHandle>>>,
}

impl TaskRunner {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            transport,
            events,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Start `request` after `delay`; its completion arrives as a `TransportEvent`
    pub(crate) fn spawn(&self, task_id: TaskId, kind: TaskKind, request: TusRequest, delay: Duration) {
        let transport = self.transport.clone();
        let events = self.events.clone();
        let running = self.running.clone();
        let id = task_id.clone();

        // Held until the handle is registered so a fast task cannot deregister first
        let mut guard = self.running.lock();
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            debug!(task_id = %id, method = request.method.as_str(), url = %request.url, "sending request");
            let outcome = transport.send(request).await;
            running.lock().remove(&id);
            let _ = events.send(TransportEvent::new(id, kind, outcome));
        });
        guard.insert(task_id, handle.abort_handle());
    }

    /// Abort a task; no event is delivered for it afterwards
    pub(crate) fn cancel(&self, task_id: &TaskId) -> bool {
        match self.running.lock().remove(task_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn running(&self) -> usize {
        self.running.lock().len()
    }
}
