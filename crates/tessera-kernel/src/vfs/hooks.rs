//! Update hooks.
//!
//! Listing hooks see every fresh directory listing; storage hooks see
//! storages being added, updated and removed. Hooks run in registration
//! order. A failing hook is logged and never reaches the caller.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use super::storage::Storage;
use super::types::Obj;

/// Storage lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum StorageEvent {
    Add,
    Update,
    Remove,
}

/// Called with the full parent path and its children.
pub type ObjsUpdateHook = Arc<dyn Fn(&str, &[Obj]) -> anyhow::Result<()> + Send + Sync>;

/// Called with the event and the storage it concerns.
pub type StorageHook = Arc<dyn Fn(StorageEvent, &Arc<Storage>) -> anyhow::Result<()> + Send + Sync>;

/// Append-only hook lists.
#[derive(Default)]
pub struct Hooks {
    objs_update: RwLock<Vec<ObjsUpdateHook>>,
    storage: RwLock<Vec<StorageHook>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_objs_update<F>(&self, hook: F)
    where
        F: Fn(&str, &[Obj]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.objs_update.write().push(Arc::new(hook));
    }

    pub fn register_storage<F>(&self, hook: F)
    where
        F: Fn(StorageEvent, &Arc<Storage>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.storage.write().push(Arc::new(hook));
    }

    /// Run every listing hook now.
    pub fn handle_objs_update(&self, parent: &str, objs: &[Obj]) {
        let hooks = self.objs_update.read().clone();
        for hook in hooks {
            if let Err(e) = hook(parent, objs) {
                warn!(parent, error = %e, "objs update hook failed");
            }
        }
    }

    /// Run every listing hook on a detached task.
    pub fn spawn_objs_update(self: &Arc<Self>, parent: String, objs: Vec<Obj>) {
        if self.objs_update.read().is_empty() {
            return;
        }
        let hooks = Arc::clone(self);
        tokio::spawn(async move {
            hooks.handle_objs_update(&parent, &objs);
        });
    }

    /// Run every storage hook now.
    pub fn call_storage_hooks(&self, event: StorageEvent, storage: &Arc<Storage>) {
        let hooks = self.storage.read().clone();
        for hook in hooks {
            if let Err(e) = hook(event, storage) {
                warn!(
                    %event,
                    mount_path = storage.mount_path(),
                    error = %e,
                    "storage hook failed"
                );
            }
        }
    }

    /// Run every storage hook on a detached task.
    pub fn spawn_storage_hooks(self: &Arc<Self>, event: StorageEvent, storage: Arc<Storage>) {
        if self.storage.read().is_empty() {
            return;
        }
        let hooks = Arc::clone(self);
        tokio::spawn(async move {
            hooks.call_storage_hooks(event, &storage);
        });
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("objs_update", &self.objs_update.read().len())
            .field("storage", &self.storage.read().len())
            .finish()
    }
}
