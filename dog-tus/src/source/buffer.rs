use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use super::{check_offset, ChunkSource};
use crate::{SourceLocator, TusError, TusResult};

/// Source over bytes held in memory
///
/// Cannot be restored after a restart; use `StagedSource::from_bytes` when
/// the upload must survive one.
#[derive(Debug)]
pub struct BufferSource {
    data: Bytes,
    open: AtomicBool,
}

impl BufferSource {
    pub fn new<B: Into<Bytes>>(data: B) -> Self {
        Self {
            data: data.into(),
            open: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl ChunkSource for BufferSource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    async fn open(&self) -> bool {
        self.open.store(true, Ordering::SeqCst);
        true
    }

    async fn read(&self, offset: u64, max_size: u64) -> TusResult<Bytes> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TusError::ClosedSource);
        }
        check_offset(offset, self.len())?;

        let start = offset as usize;
        let end = offset.saturating_add(max_size).min(self.len()) as usize;
        Ok(self.data.slice(start..end))
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn locator(&self) -> SourceLocator {
        SourceLocator::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_chunks_and_short_tail() {
        let source = BufferSource::new(&b"abcdefghij"[..]);
        assert_eq!(source.len(), 10);
        assert_eq!(&source.read(0, 4).await.unwrap()[..], b"abcd");
        assert_eq!(&source.read(8, 4).await.unwrap()[..], b"ij");
        assert!(source.read(10, 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_offset_past_end() {
        let source = BufferSource::new(vec![0u8; 3]);
        assert!(matches!(
            source.read(4, 1).await,
            Err(TusError::InvalidOffset { offset: 4, length: 3 })
        ));
    }

    #[tokio::test]
    async fn test_closed_source_until_reopened() {
        let source = BufferSource::new(vec![1u8; 8]);
        source.close().await;
        source.close().await;
        assert!(matches!(tokio_test::assert_err!(source.read(0, 1).await), TusError::ClosedSource));

        assert!(source.open().await);
        assert_eq!(tokio_test::assert_ok!(source.read(0, 8).await).len(), 8);
        assert_eq!(source.locator(), SourceLocator::Memory);
    }
}
