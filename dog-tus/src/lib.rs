//! # dog-tus: Resumable tus uploads for DogRS
//!
//! `dog-tus` is a client for the [tus](https://tus.io) 1.0 resumable upload
//! protocol. It splits a byte source into chunks, verifies every chunk
//! against the server's offset, persists enough state to pick an upload up
//! again after a restart, and runs many uploads concurrently.
//!
//! ## Key Features
//!
//! - **Resumable**: every confirmed offset is persisted before listeners hear about it
//! - **Restart-safe**: completions for requests issued by an earlier process are matched back to their upload
//! - **Source agnostic**: files, in-memory buffers and staged copies look the same to the state machine
//! - **Store agnostic**: memory, JSON file or SQLite (`sqlite` feature) behind one trait
//! - **Transport agnostic**: reqwest by default, anything implementing `Transport` otherwise
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dog_tus::prelude::*;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> TusResult<()> {
//! let store = Arc::new(FileUploadStore::open("uploads.json").await?);
//! let session = UploadSession::with_http(TusConfig::new("http://localhost:1080/files/"), store)?;
//!
//! let upload = session
//!     .create_from_file("movie.mp4", StringMap::new(), StringMap::new())
//!     .await?;
//! upload.on_progress(|sent, total| println!("{}/{}", sent, total));
//! upload.on_result(|url| println!("done: {}", url));
//! upload.resume().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  UploadSession   │  ← owns transport, store and live uploads
//! ├──────────────────┤
//! │ ResumableUpload  │  ← per-upload state machine
//! ├──────────────────┤
//! │ UploadStore      │  ← records + task → upload map
//! │ ChunkSource      │  ← offset-addressable bytes
//! └──────────────────┘
//! ```
//!
//! On launch, call `restore_all_uploads` and `resume_all` to continue
//! whatever the previous run left behind.

mod config;
mod error;
pub mod protocol;
mod session;
pub mod source;
pub mod store;
pub mod transport;
mod types;
pub mod upload;

pub use config::{TusConfig, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_RETRIES, TUS_VERSION};
pub use error::{TusError, TusResult};
pub use protocol::{ServerInfo, TusRequest, TusResponse};
pub use session::UploadSession;
pub use source::{BufferSource, ChunkSource, FileSource, StagedSource};
pub use store::{FileUploadStore, MemoryUploadStore, UploadStore};
#[cfg(feature = "sqlite")]
pub use store::SqliteUploadStore;
pub use transport::{TaskKind, Transport, TransportEvent};
#[cfg(feature = "http-client")]
pub use transport::ReqwestTransport;
pub use types::{SourceLocator, StringMap, TaskId, UploadEvent, UploadId, UploadRecord, UploadState};
pub use upload::{ResumableUpload, UploadDelegate};

/// Install a `fmt` subscriber filtered by `RUST_LOG`
#[cfg(feature = "tracing-basic")]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        ChunkSource, FileUploadStore, MemoryUploadStore, ResumableUpload, StringMap, TusConfig,
        TusError, TusResult, UploadId, UploadSession, UploadState, UploadStore,
    };
}
