//! Scriptable driver for tests.
//!
//! Backed by a [`MemoryDriver`] held in a shared [`MockState`], so every
//! instance a registry constructs sees the same tree and the same call
//! counters. Options inject latency, failures and link kinds.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use super::memory::MemoryDriver;
use crate::vfs::driver::{
    Capabilities, CopierResult, DirMaker, Driver, DriverConfig, Meta, Mover, OtherCaller,
    Putter, Reader, Remover, Renamer, RootGetter,
};
use crate::vfs::error::{FsError, FsResult};
use crate::vfs::link::Link;
use crate::vfs::record::StorageRecord;
use crate::vfs::stream::{FileStream, UpdateProgress};
use crate::vfs::types::{LinkArgs, ListArgs, Obj, OtherArgs};

pub const NAME: &str = "mock";

/// What `link` hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockLinkKind {
    /// Shareable URL link without expiration.
    #[default]
    Url,
    /// Shareable URL link cached for the given duration.
    Expiring(Duration),
    /// In-process file handle.
    File,
}

#[derive(Debug, Clone)]
pub struct MockOptions {
    pub config: DriverConfig,
    /// Sleep inside every `list` call.
    pub list_delay: Option<Duration>,
    /// Sleep inside every `link` call.
    pub link_delay: Option<Duration>,
    pub link_kind: MockLinkKind,
    /// Sleep inside `init`.
    pub init_delay: Option<Duration>,
    pub fail_list: bool,
    pub fail_put: bool,
    pub fail_init: bool,
    pub fail_teardown: bool,
    pub panic_on_init: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            config: DriverConfig {
                check_status: true,
                ..DriverConfig::new(NAME)
            },
            list_delay: None,
            link_delay: None,
            link_kind: MockLinkKind::default(),
            init_delay: None,
            fail_list: false,
            fail_put: false,
            fail_init: false,
            fail_teardown: false,
            panic_on_init: false,
        }
    }
}

/// Shared tree, options and counters.
#[derive(Debug, Default)]
pub struct MockState {
    pub memory: MemoryDriver,
    pub options: Mutex<MockOptions>,
    calls: Mutex<HashMap<&'static str, usize>>,
    closed_links: AtomicUsize,
}

impl MockState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// How many times the named driver method ran.
    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().get(method).copied().unwrap_or(0)
    }

    /// How many links ran their cleanup.
    pub fn closed_links(&self) -> usize {
        self.closed_links.load(Ordering::SeqCst)
    }

    fn hit(&self, method: &'static str) {
        *self.calls.lock().entry(method).or_insert(0) += 1;
    }

    fn options(&self) -> MockOptions {
        self.options.lock().clone()
    }
}

/// Driver view of a [`MockState`].
///
/// Once torn down an instance refuses to list.
#[derive(Debug)]
pub struct MockDriver {
    state: Arc<MockState>,
    torn_down: AtomicBool,
}

impl MockDriver {
    pub fn new(state: Arc<MockState>) -> Self {
        Self {
            state,
            torn_down: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Meta for MockDriver {
    fn config(&self) -> DriverConfig {
        self.state.options.lock().config.clone()
    }

    fn addition(&self) -> FsResult<serde_json::Value> {
        Ok(serde_json::json!({}))
    }

    fn set_addition(&mut self, _raw: &str) -> FsResult<()> {
        Ok(())
    }

    async fn init(&mut self, _record: &StorageRecord) -> FsResult<()> {
        self.state.hit("init");
        let options = self.state.options();
        if options.panic_on_init {
            panic!("mock driver exploded during init");
        }
        if let Some(delay) = options.init_delay {
            tokio::time::sleep(delay).await;
        }
        if options.fail_init {
            return Err(FsError::backend_msg("mock init failure"));
        }
        Ok(())
    }

    async fn teardown(&self) -> FsResult<()> {
        self.state.hit("teardown");
        self.torn_down.store(true, Ordering::SeqCst);
        if self.state.options().fail_teardown {
            return Err(FsError::backend_msg("mock teardown failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl Reader for MockDriver {
    async fn list(&self, dir: &Obj, args: &ListArgs) -> FsResult<Vec<Obj>> {
        self.state.hit("list");
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(FsError::StorageDown("mock driver torn down".into()));
        }
        let options = self.state.options();
        if let Some(delay) = options.list_delay {
            tokio::time::sleep(delay).await;
        }
        if options.fail_list {
            return Err(FsError::backend_msg("mock list failure"));
        }
        self.state.memory.list(dir, args).await
    }

    async fn link(&self, file: &Obj, args: &LinkArgs) -> FsResult<Link> {
        self.state.hit("link");
        let options = self.state.options();
        if let Some(delay) = options.link_delay {
            tokio::time::sleep(delay).await;
        }
        let link = match options.link_kind {
            MockLinkKind::Url => self.state.memory.link(file, args).await?,
            MockLinkKind::Expiring(ttl) => self
                .state
                .memory
                .link(file, args)
                .await?
                .with_expiration(ttl),
            MockLinkKind::File => {
                let data = self.state.memory.read_file(file.path())?;
                let len = data.len() as u64;
                Link::file(Cursor::new(data)).with_content_length(len)
            }
        };
        let state = Arc::clone(&self.state);
        link.add_closer(Box::new(move || {
            state.closed_links.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        Ok(link)
    }
}

#[async_trait]
impl RootGetter for MockDriver {
    async fn get_root(&self) -> FsResult<Obj> {
        self.state.memory.get_root().await
    }
}

#[async_trait]
impl DirMaker for MockDriver {
    async fn make_dir(&self, parent: &Obj, name: &str) -> FsResult<()> {
        self.state.hit("make_dir");
        DirMaker::make_dir(&self.state.memory, parent, name).await
    }
}

#[async_trait]
impl Mover for MockDriver {
    async fn move_obj(&self, src: &Obj, dst_dir: &Obj) -> FsResult<()> {
        self.state.hit("move");
        Mover::move_obj(&self.state.memory, src, dst_dir).await
    }
}

#[async_trait]
impl Renamer for MockDriver {
    async fn rename(&self, src: &Obj, new_name: &str) -> FsResult<()> {
        self.state.hit("rename");
        Renamer::rename(&self.state.memory, src, new_name).await
    }
}

#[async_trait]
impl CopierResult for MockDriver {
    async fn copy(&self, src: &Obj, dst_dir: &Obj) -> FsResult<Option<Obj>> {
        self.state.hit("copy");
        CopierResult::copy(&self.state.memory, src, dst_dir).await
    }
}

#[async_trait]
impl Remover for MockDriver {
    async fn remove(&self, obj: &Obj) -> FsResult<()> {
        self.state.hit("remove");
        self.state.memory.remove(obj).await
    }
}

#[async_trait]
impl Putter for MockDriver {
    async fn put(
        &self,
        dst_dir: &Obj,
        file: &mut FileStream,
        progress: UpdateProgress,
    ) -> FsResult<()> {
        self.state.hit("put");
        if self.state.options().fail_put {
            return Err(FsError::backend_msg("mock upload failure"));
        }
        Putter::put(&self.state.memory, dst_dir, file, progress).await
    }
}

#[async_trait]
impl OtherCaller for MockDriver {
    async fn other(&self, args: OtherArgs) -> FsResult<serde_json::Value> {
        self.state.hit("other");
        self.state.memory.other(args).await
    }
}

impl Driver for MockDriver {
    fn capabilities(&self) -> Capabilities<'_> {
        Capabilities::new()
            .root(self)
            .mkdir(self)
            .mover(self)
            .renamer(self)
            .copier_result(self)
            .remover(self)
            .putter(self)
            .other(self)
    }
}
