//! Download link handles.
//!
//! A [`Link`] is shared between every caller that asked for the same file
//! while it was cached. Each caller holds a reference; the last release runs
//! the link's closers exactly once, after which the link can never be
//! acquired again.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncSeek};
use tracing::warn;

use super::error::FsResult;

/// Deferred cleanup attached to a link or stream.
pub type Closer = Box<dyn FnOnce() -> FsResult<()> + Send>;

const CLOSED: i64 = -1;

/// Reference counter with once-only cleanup.
///
/// Starts at zero references. `acquire` succeeds while the set is open;
/// `release` of the last reference closes it and runs every closer.
#[derive(Default)]
pub struct SyncClosers {
    refs: AtomicI64,
    closers: Mutex<Vec<Closer>>,
}

impl SyncClosers {
    pub fn add(&self, closer: Closer) {
        self.closers.lock().push(closer);
    }

    /// Take a reference. Fails once the set has been closed.
    pub fn acquire(&self) -> bool {
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            if current < 0 {
                return false;
            }
            match self.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop a reference; the last one closes the set.
    pub fn release(&self) -> FsResult<()> {
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            if current < 0 {
                return Ok(());
            }
            let next = if current <= 1 { CLOSED } else { current - 1 };
            match self
                .refs
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) if next == CLOSED => return self.close_all(),
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.refs.load(Ordering::Acquire) < 0
    }

    pub fn references(&self) -> i64 {
        self.refs.load(Ordering::Acquire).max(0)
    }

    fn close_all(&self) -> FsResult<()> {
        let closers = std::mem::take(&mut *self.closers.lock());
        let mut first_err = None;
        for closer in closers {
            if let Err(e) = closer() {
                warn!(error = %e, "link closer failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Seekable in-process file behind a link.
pub trait SeekableFile: AsyncRead + AsyncSeek + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Sync + Unpin> SeekableFile for T {}

/// Download handle produced by a driver.
pub struct Link {
    pub url: String,
    pub header: BTreeMap<String, String>,
    /// In-process file handle; links carrying one are never shared.
    pub file: Option<tokio::sync::Mutex<Box<dyn SeekableFile>>>,
    /// How long the link may be served from cache.
    pub expiration: Option<Duration>,
    pub concurrency: usize,
    pub part_size: usize,
    pub content_length: Option<u64>,
    closers: SyncClosers,
}

impl Link {
    /// URL-backed link.
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            header: BTreeMap::new(),
            file: None,
            expiration: None,
            concurrency: 0,
            part_size: 0,
            content_length: None,
            closers: SyncClosers::default(),
        }
    }

    /// File-backed link.
    pub fn file(file: impl SeekableFile + 'static) -> Self {
        let file: Box<dyn SeekableFile> = Box::new(file);
        Self {
            file: Some(tokio::sync::Mutex::new(file)),
            ..Self::url(String::new())
        }
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }

    pub fn with_content_length(mut self, len: u64) -> Self {
        self.content_length = Some(len);
        self
    }

    /// Register cleanup to run when the last reference is released.
    pub fn add_closer(&self, closer: Closer) {
        self.closers.add(closer);
    }

    /// URL links may be handed to several callers; file handles may not.
    pub fn is_shareable(&self) -> bool {
        self.file.is_none()
    }

    pub fn acquire_reference(&self) -> bool {
        self.closers.acquire()
    }

    /// Release one reference. Callers must pair every successful
    /// acquisition (including the one made for them by the operation
    /// layer) with exactly one release.
    pub fn release(&self) -> FsResult<()> {
        self.closers.release()
    }

    pub fn is_closed(&self) -> bool {
        self.closers.is_closed()
    }

    pub fn references(&self) -> i64 {
        self.closers.references()
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("url", &self.url)
            .field("file", &self.file.is_some())
            .field("expiration", &self.expiration)
            .field("content_length", &self.content_length)
            .field("refs", &self.closers.references())
            .field("closed", &self.closers.is_closed())
            .finish()
    }
}
