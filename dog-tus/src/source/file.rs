use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::warn;

use super::{check_offset, ChunkSource};
use crate::{SourceLocator, TusError, TusResult};

/// Source over a file on disk; the length is captured when it is built
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    length: u64,
    file: Mutex<Option<File>>,
}

impl FileSource {
    pub async fn new<P: AsRef<Path>>(path: P) -> TusResult<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(TusError::Config(format!("{} is not a regular file", path.display())));
        }
        Ok(Self {
            path,
            length: metadata.len(),
            file: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ChunkSource for FileSource {
    fn len(&self) -> u64 {
        self.length
    }

    async fn open(&self) -> bool {
        let mut file = self.file.lock().await;
        if file.is_some() {
            return true;
        }
        match File::open(&self.path).await {
            Ok(opened) => {
                *file = Some(opened);
                true
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to open upload source");
                false
            }
        }
    }

    async fn read(&self, offset: u64, max_size: u64) -> TusResult<Bytes> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(TusError::ClosedSource)?;
        check_offset(offset, self.length)?;

        let want = max_size.min(self.length - offset);
        let mut buf = Vec::with_capacity(want as usize);
        file.seek(SeekFrom::Start(offset)).await?;
        (&mut *file).take(want).read_to_end(&mut buf).await?;
        if (buf.len() as u64) < want {
            return Err(TusError::source_unavailable(
                self.path.display().to_string(),
                format!("file shrank: read {} of {} bytes at offset {}", buf.len(), want, offset),
            ));
        }
        Ok(Bytes::from(buf))
    }

    async fn close(&self) {
        self.file.lock().await.take();
    }

    fn locator(&self) -> SourceLocator {
        SourceLocator::File {
            path: self.path.clone(),
        }
    }
}
