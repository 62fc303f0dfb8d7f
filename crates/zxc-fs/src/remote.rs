//! Remote filesystem binding
//!
//! The typed view of the upstream file service. Only `stat`, `get_dir`
//! and `get` are required; everything else is an optional capability
//! gated by a `supports_*` probe, so a read-only or non-redialable
//! upstream still works behind the cache.
//!
//! Byte streams are bounded channels of `Result` chunks: an `Err` item
//! is terminal and plays the role of an error-carrying close; dropping
//! the receiver cancels the producer.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use zxc_core::{Dir, FsError};

use crate::STREAM_DEPTH;

/// Consumer end of a byte stream.
pub type ByteStream = mpsc::Receiver<Result<Vec<u8>, FsError>>;

/// Producer end of a byte stream.
pub type ByteSink = mpsc::Sender<Result<Vec<u8>, FsError>>;

/// Upstream file service, as consumed by the cache.
#[async_trait]
pub trait Remote: Send + Sync + 'static {
    /// Short name for log and tag lines.
    fn name(&self) -> &str {
        "remote"
    }

    /// Stat one path.
    async fn stat(&self, path: &str) -> Result<Dir, FsError>;

    /// Full listing of one directory.
    async fn get_dir(&self, path: &str) -> Result<Vec<Dir>, FsError>;

    /// Stream file content. `count < 0` means through the end.
    async fn get(&self, path: &str, off: i64, count: i64) -> Result<ByteStream, FsError>;

    fn supports_put(&self) -> bool {
        false
    }

    /// Create or update an entry. A `d` carrying a `type` creates; a
    /// dir-typed put with no data is a metadata-only update. `off < 0`
    /// appends.
    async fn put(
        &self,
        path: &str,
        d: &Dir,
        off: i64,
        data: Option<ByteStream>,
    ) -> Result<Dir, FsError> {
        let _ = (d, off, data);
        Err(FsError::Unsupported(path.to_string()))
    }

    fn supports_wstat(&self) -> bool {
        false
    }

    /// Apply a metadata delta to an existing entry.
    async fn wstat(&self, path: &str, nd: &Dir) -> Result<(), FsError> {
        let _ = nd;
        Err(FsError::Unsupported(path.to_string()))
    }

    fn supports_remove(&self) -> bool {
        false
    }

    /// Remove an entry and anything below it.
    async fn remove_all(&self, path: &str) -> Result<(), FsError> {
        Err(FsError::Unsupported(path.to_string()))
    }

    fn supports_move(&self) -> bool {
        false
    }

    async fn move_(&self, from: &str, to: &str) -> Result<(), FsError> {
        let _ = to;
        Err(FsError::Unsupported(from.to_string()))
    }

    fn supports_link(&self) -> bool {
        false
    }

    /// Create `from` as a link to the existing `to`.
    async fn link(&self, to: &str, from: &str) -> Result<(), FsError> {
        let _ = to;
        Err(FsError::Unsupported(from.to_string()))
    }

    fn supports_sync(&self) -> bool {
        false
    }

    /// Flush the upstream's own state.
    async fn sync(&self) -> Result<(), FsError> {
        Ok(())
    }

    fn supports_redial(&self) -> bool {
        false
    }

    /// Reestablish the transport after an I/O error.
    async fn redial(&self) -> Result<(), FsError> {
        Err(FsError::Unsupported(self.name().to_string()))
    }

    /// Release the upstream; further calls may fail.
    async fn close(&self) -> Result<(), FsError> {
        Ok(())
    }
}

/// A ready-made stream carrying one chunk of bytes.
pub fn byte_stream(data: Vec<u8>) -> ByteStream {
    let (tx, rx) = mpsc::channel(1);
    // Capacity one, single send: cannot fail while we hold rx.
    let _ = tx.try_send(Ok(data));
    rx
}

/// Drain a byte stream into one buffer, surfacing a mid-stream error.
pub async fn collect(mut stream: ByteStream) -> Result<Vec<u8>, FsError> {
    let mut buf = Vec::new();
    while let Some(chunk) = stream.recv().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf)
}

/// Read a whole file from the remote into memory, best effort.
pub async fn get_all(remote: &Arc<dyn Remote>, path: &str) -> Result<Vec<u8>, FsError> {
    let stream = remote.get(path, 0, zxc_core::ALL).await?;
    collect(stream).await
}

/// A new bounded stream pair with the standard depth.
pub fn stream_pair() -> (ByteSink, ByteStream) {
    mpsc::channel(STREAM_DEPTH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_byte_stream_roundtrip() {
        let rx = byte_stream(b"hello".to_vec());
        assert_eq!(collect(rx).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_collect_surfaces_error() {
        let (tx, rx) = stream_pair();
        tx.send(Ok(b"he".to_vec())).await.unwrap();
        tx.send(Err(FsError::Io("/x".into(), "gone".into())))
            .await
            .unwrap();
        drop(tx);
        assert!(collect(rx).await.unwrap_err().is_io());
    }

    #[tokio::test]
    async fn test_default_capabilities_refuse() {
        struct Bare;
        #[async_trait]
        impl Remote for Bare {
            async fn stat(&self, _: &str) -> Result<Dir, FsError> {
                Ok(Dir::new())
            }
            async fn get_dir(&self, _: &str) -> Result<Vec<Dir>, FsError> {
                Ok(Vec::new())
            }
            async fn get(&self, _: &str, _: i64, _: i64) -> Result<ByteStream, FsError> {
                Ok(byte_stream(Vec::new()))
            }
        }

        let r = Bare;
        assert!(!r.supports_put());
        assert!(!r.supports_move());
        assert!(matches!(
            r.put("/a", &Dir::new(), 0, None).await,
            Err(FsError::Unsupported(_))
        ));
        assert!(matches!(
            r.move_("/a", "/b").await,
            Err(FsError::Unsupported(_))
        ));
    }
}
