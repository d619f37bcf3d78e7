//! Offset-addressable byte sources an upload reads its chunks from.
//!
//! Every variant answers the same four questions (how long, is it usable,
//! give me bytes at an offset, where do you live) so the upload state
//! machine never needs to know which one it holds.

mod buffer;
mod file;
mod staged;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{SourceLocator, TusError, TusResult, UploadId};

pub use buffer::BufferSource;
pub use file::FileSource;
pub use staged::StagedSource;

/// A fixed-length byte source read in chunks
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Total length, fixed at construction
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the source readable; idempotent. Returns whether it is usable.
    async fn open(&self) -> bool;

    /// Read up to `max_size` bytes starting at `offset`
    ///
    /// Returns fewer bytes only at the end of the source, `ClosedSource` when
    /// the source is not open and `InvalidOffset` when `offset > len()`.
    async fn read(&self, offset: u64, max_size: u64) -> TusResult<Bytes>;

    /// Release the underlying resource; safe to call repeatedly
    async fn close(&self);

    /// Persistable description used to rebuild the source after a restart
    fn locator(&self) -> SourceLocator;
}

pub(crate) fn check_offset(offset: u64, length: u64) -> TusResult<()> {
    if offset > length {
        return Err(TusError::InvalidOffset { offset, length });
    }
    Ok(())
}

/// Rebuild the source a persisted record points at
///
/// Fails with `SourceUnavailable` if the file is gone, its length no longer
/// matches `expected_len`, or the bytes only ever lived in memory.
pub async fn reattach(
    id: &UploadId,
    locator: &SourceLocator,
    expected_len: u64,
) -> TusResult<Arc<dyn ChunkSource>> {
    let source: Arc<dyn ChunkSource> = match locator {
        SourceLocator::Memory => {
            return Err(TusError::source_unavailable(
                id.as_str(),
                "in-memory source did not survive the restart",
            ))
        }
        SourceLocator::File { path } => Arc::new(
            FileSource::new(path)
                .await
                .map_err(|e| TusError::source_unavailable(id.as_str(), e.to_string()))?,
        ),
        SourceLocator::Staged { path } => Arc::new(
            StagedSource::attach(path)
                .await
                .map_err(|e| TusError::source_unavailable(id.as_str(), e.to_string()))?,
        ),
    };

    if source.len() != expected_len {
        return Err(TusError::source_unavailable(
            id.as_str(),
            format!("expected {} bytes, found {}", expected_len, source.len()),
        ));
    }
    if !source.open().await {
        return Err(TusError::source_unavailable(id.as_str(), "source could not be opened"));
    }
    Ok(source)
}
