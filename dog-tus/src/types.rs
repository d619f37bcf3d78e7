use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// String map used for request headers and upload metadata
pub type StringMap = BTreeMap<String, String>;

/// Unique identifier for a logical upload
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UploadId(pub String);

impl UploadId {
    /// Generate a new random upload ID
    pub fn new() -> Self {
        Self(format!("upl_{}", Uuid::new_v4().simple()))
    }

    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UploadId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifier of a transport task (one HTTP request in flight)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a new unique task ID
    pub fn new() -> Self {
        Self(format!("task_{}", Uuid::new_v4().simple()))
    }

    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Protocol state of an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UploadState {
    /// Waiting for the server to create the upload resource
    CreatingFile,
    /// Asking the server for its current offset
    CheckingFile,
    /// Sending chunks
    UploadingFile,
    /// Server holds every byte
    Complete,
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete)
    }

    /// Get the state name as a string
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreatingFile => "creating",
            Self::CheckingFile => "checking",
            Self::UploadingFile => "uploading",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where the bytes of an upload come from, in a form that survives a restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceLocator {
    /// A caller-owned file
    File { path: PathBuf },
    /// A file materialized by the client; removed once the upload ends
    Staged { path: PathBuf },
    /// Bytes that only live in memory and cannot be restored
    Memory,
}

impl SourceLocator {
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::File { path } | Self::Staged { path } => Some(path),
            Self::Memory => None,
        }
    }

    pub fn is_restorable(&self) -> bool {
        !matches!(self, Self::Memory)
    }
}

/// Persisted form of an upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: UploadId,
    pub remote_url: Option<String>,
    pub source: SourceLocator,

    /// Declared length sent in `Upload-Length`
    pub length: u64,

    pub headers: StringMap,
    pub metadata: StringMap,

    pub retry_count: u32,
    pub state: UploadState,

    /// Bytes the server has confirmed
    pub offset: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadRecord {
    /// Create a record in the initial state
    pub fn new(id: UploadId, source: SourceLocator, length: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            remote_url: None,
            source,
            length,
            headers: StringMap::new(),
            metadata: StringMap::new(),
            retry_count: 0,
            state: UploadState::CreatingFile,
            offset: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_headers(mut self, headers: StringMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_metadata(mut self, metadata: StringMap) -> Self {
        self.metadata = metadata;
        self
    }

    /// Start from an upload URL the server already handed out
    pub fn with_remote_url<S: Into<String>>(mut self, url: S) -> Self {
        self.remote_url = Some(url.into());
        self.state = UploadState::CheckingFile;
        self
    }

    /// Move to a new state and touch the timestamp
    pub fn transition(&mut self, state: UploadState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    pub fn remaining(&self) -> u64 {
        self.length.saturating_sub(self.offset)
    }

    pub fn is_finished(&self) -> bool {
        self.offset == self.length
    }
}

/// Lifecycle events published by a session for every upload it tracks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UploadEvent {
    Created {
        upload_id: UploadId,
        length: u64,
        at: DateTime<Utc>,
    },

    Progress {
        upload_id: UploadId,
        bytes_sent: u64,
        bytes_total: u64,
        at: DateTime<Utc>,
    },

    Retrying {
        upload_id: UploadId,
        attempt: u32,
        error: String,
        at: DateTime<Utc>,
    },

    Completed {
        upload_id: UploadId,
        location: String,
        at: DateTime<Utc>,
    },

    Failed {
        upload_id: UploadId,
        error: String,
        at: DateTime<Utc>,
    },

    Stopped {
        upload_id: UploadId,
        at: DateTime<Utc>,
    },

    Cancelled {
        upload_id: UploadId,
        at: DateTime<Utc>,
    },
}

impl UploadEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Progress { .. } => "progress",
            Self::Retrying { .. } => "retrying",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Stopped { .. } => "stopped",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// Get the upload ID from any event
    pub fn upload_id(&self) -> &UploadId {
        match self {
            Self::Created { upload_id, .. } => upload_id,
            Self::Progress { upload_id, .. } => upload_id,
            Self::Retrying { upload_id, .. } => upload_id,
            Self::Completed { upload_id, .. } => upload_id,
            Self::Failed { upload_id, .. } => upload_id,
            Self::Stopped { upload_id, .. } => upload_id,
            Self::Cancelled { upload_id, .. } => upload_id,
        }
    }
}
