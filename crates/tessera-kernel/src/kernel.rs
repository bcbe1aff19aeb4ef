//! Kernel: the wired-up storage core.
//!
//! A kernel owns one driver registry, one set of hooks, one storage manager
//! and the operation layer on top of them. Front ends build a kernel, call
//! [`Kernel::start`] and then talk to [`Kernel::fs`].

use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TesseraConfig;
use crate::vfs::{
    DriverRegistry, FileSystem, FsOps, FsResult, Hooks, MemoryStorageRepository,
    StorageManager, StorageRecord, StorageRepository, register_builtin,
};

/// The storage core with every component connected.
pub struct Kernel {
    /// Unique kernel ID
    id: Uuid,
    drivers: Arc<DriverRegistry>,
    hooks: Arc<Hooks>,
    storages: Arc<StorageManager>,
    ops: Arc<FsOps>,
    fs: FileSystem,
    default_cache_expiration: u32,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("id", &self.id)
            .field("drivers", &self.drivers.names())
            .field("mounts", &self.storages.mounts().len())
            .finish_non_exhaustive()
    }
}

impl Kernel {
    /// Create a kernel over the given repository with the built-in drivers.
    pub fn new(config: &TesseraConfig, repo: Arc<dyn StorageRepository>) -> FsResult<Self> {
        let drivers = Arc::new(DriverRegistry::new());
        register_builtin(&drivers)?;

        let hooks = Arc::new(Hooks::new());
        let ops = Arc::new(FsOps::new(Arc::clone(&hooks), config.name_mapper()));
        let storages = Arc::new(StorageManager::new(
            Arc::clone(&drivers),
            repo,
            Arc::clone(&hooks),
        ));

        // A storage coming, going or changing invalidates everything cached
        // under its mount path.
        let weak: Weak<FsOps> = Arc::downgrade(&ops);
        hooks.register_storage(move |event, storage| {
            if let Some(ops) = weak.upgrade() {
                debug!(%event, mount_path = storage.mount_path(), "purging caches");
                ops.purge_mount(storage.mount_path());
            }
            Ok(())
        });

        let fs = FileSystem::new(Arc::clone(&storages), Arc::clone(&ops));
        let id = Uuid::new_v4();
        info!(%id, "kernel created");
        Ok(Self {
            id,
            drivers,
            hooks,
            storages,
            ops,
            fs,
            default_cache_expiration: config.default_cache_expiration,
        })
    }

    /// A kernel with default config and nothing persisted.
    pub fn in_memory() -> FsResult<Self> {
        Self::new(
            &TesseraConfig::default(),
            Arc::new(MemoryStorageRepository::new()),
        )
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }

    pub fn hooks(&self) -> &Arc<Hooks> {
        &self.hooks
    }

    pub fn storages(&self) -> &Arc<StorageManager> {
        &self.storages
    }

    pub fn ops(&self) -> &Arc<FsOps> {
        &self.ops
    }

    pub fn fs(&self) -> &FileSystem {
        &self.fs
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Mount every enabled storage from the repository.
    pub async fn start(&self) -> FsResult<usize> {
        self.storages.load_all().await
    }

    /// A record for a new storage using this kernel's defaults.
    pub fn new_record(&self, mount_path: &str, driver: &str) -> StorageRecord {
        StorageRecord::new(mount_path, driver).with_cache_expiration(self.default_cache_expiration)
    }

    /// Tear down every mounted driver. Storages stay persisted.
    pub async fn shutdown(&self) {
        for storage in self.storages.all() {
            if let Err(e) = storage.driver().teardown().await {
                warn!(mount_path = storage.mount_path(), error = %e, "failed drop storage");
            }
            self.storages.mounts().remove(storage.mount_path());
        }
        info!(id = %self.id, "kernel shut down");
    }
}
