//! Upload input streams.

use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::warn;

use super::error::{FsError, FsResult};
use super::link::Closer;
use super::types::Obj;

/// Upload progress callback, percent in `0.0..=100.0`.
pub type UpdateProgress = Arc<dyn Fn(f64) + Send + Sync>;

/// Progress callback that discards updates.
pub fn no_progress() -> UpdateProgress {
    Arc::new(|_| {})
}

/// File being written into a storage.
///
/// Closing is idempotent and runs every registered closer once; a stream
/// dropped without being closed closes itself.
pub struct FileStream {
    name: String,
    size: u64,
    modified: SystemTime,
    mimetype: String,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    exist: Option<Obj>,
    closers: Vec<Closer>,
    closed: bool,
}

impl FileStream {
    pub fn new(
        name: impl Into<String>,
        size: u64,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            modified: SystemTime::now(),
            mimetype: "application/octet-stream".to_string(),
            reader: Box::new(reader),
            exist: None,
            closers: Vec::new(),
            closed: false,
        }
    }

    /// Stream over an in-memory buffer.
    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        Self::new(name, size, Cursor::new(data))
    }

    pub fn with_mimetype(mut self, mimetype: impl Into<String>) -> Self {
        self.mimetype = mimetype.into();
        self
    }

    pub fn with_modified(mut self, modified: SystemTime) -> Self {
        self.modified = modified;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn modified(&self) -> SystemTime {
        self.modified
    }

    pub fn mimetype(&self) -> &str {
        &self.mimetype
    }

    /// Object being overwritten by this upload, when the destination existed.
    pub fn exist(&self) -> Option<&Obj> {
        self.exist.as_ref()
    }

    pub fn set_exist(&mut self, obj: Obj) {
        self.exist = Some(obj);
    }

    pub fn add_closer(&mut self, closer: Closer) {
        self.closers.push(closer);
    }

    pub fn reader(&mut self) -> FsResult<&mut (dyn AsyncRead + Send + Unpin)> {
        if self.closed {
            return Err(FsError::backend_msg(format!("stream {} already closed", self.name)));
        }
        Ok(self.reader.as_mut())
    }

    /// Read the remaining bytes.
    pub async fn read_all(&mut self) -> FsResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.size.min(1 << 20) as usize);
        self.reader()?.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Run every closer once. Later calls are no-ops.
    pub fn close(&mut self) -> FsResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first_err = None;
        for closer in self.closers.drain(..) {
            if let Err(e) = closer() {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for FileStream {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(name = %self.name, error = %e, "failed to close file stream");
        }
    }
}

impl fmt::Debug for FileStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStream")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("mimetype", &self.mimetype)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tracked(counter: &Arc<AtomicUsize>) -> FileStream {
        let mut stream = FileStream::from_bytes("f.bin", b"payload".to_vec());
        let counter = Arc::clone(counter);
        stream.add_closer(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        stream
    }

    #[tokio::test]
    async fn test_read_all() {
        let mut stream = FileStream::from_bytes("f.bin", b"payload".to_vec());
        assert_eq!(stream.size(), 7);
        assert_eq!(stream.read_all().await.unwrap(), b"payload");
    }

    #[test]
    fn test_close_is_idempotent() {
        let closed = Arc::new(AtomicUsize::new(0));
        let mut stream = tracked(&closed);
        stream.close().unwrap();
        stream.close().unwrap();
        drop(stream);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_closes() {
        let closed = Arc::new(AtomicUsize::new(0));
        drop(tracked(&closed));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_stream_refuses_reads() {
        let mut stream = FileStream::from_bytes("f", vec![1, 2, 3]);
        stream.close().unwrap();
        assert!(stream.read_all().await.is_err());
    }
}
