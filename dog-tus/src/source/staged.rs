use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ChunkSource, FileSource};
use crate::{SourceLocator, TusResult};

/// A file the client materialized itself, removed again on `close`
///
/// Used for exported media assets and for byte buffers that have to outlive
/// the process.
#[derive(Debug)]
pub struct StagedSource {
    inner: FileSource,
}

impl StagedSource {
    /// Copy `reader` into a new uniquely named file under `dir`
    pub async fn materialize<R>(dir: &Path, mut reader: R) -> TusResult<Self>
    where
        R: AsyncRead + Unpin + Send,
    {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("staged_{}", Uuid::new_v4().simple()));

        let mut file = tokio::fs::File::create(&path).await?;
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        debug!(path = %path.display(), bytes = written, "Materialized staged source");
        Self::attach(path).await
    }

    pub async fn from_bytes(dir: &Path, data: &[u8]) -> TusResult<Self> {
        Self::materialize(dir, data).await
    }

    /// Adopt an already staged file, e.g. after a restart
    pub async fn attach<P: AsRef<Path>>(path: P) -> TusResult<Self> {
        Ok(Self {
            inner: FileSource::new(path).await?,
        })
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }
}

#[async_trait]
impl ChunkSource for StagedSource {
    fn len(&self) -> u64 {
        self.inner.len()
    }

    async fn open(&self) -> bool {
        self.inner.open().await
    }

    async fn read(&self, offset: u64, max_size: u64) -> TusResult<Bytes> {
        self.inner.read(offset, max_size).await
    }

    async fn close(&self) {
        self.inner.close().await;
        match tokio::fs::remove_file(self.inner.path()).await {
            Ok(()) => debug!(path = %self.inner.path().display(), "Removed staged source"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.inner.path().display(), error = %e, "Failed to remove staged source"),
        }
    }

    fn locator(&self) -> SourceLocator {
        SourceLocator::Staged {
            path: PathBuf::from(self.inner.path()),
        }
    }
}
