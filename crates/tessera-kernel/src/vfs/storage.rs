//! Storage lifecycle.
//!
//! A [`Storage`] pairs an immutable snapshot of its record with an
//! initialized driver. [`StorageManager`] creates, reloads, updates and
//! deletes storages, persisting records through a [`StorageRepository`] and
//! publishing live instances into the [`MountTable`]. An instance is never
//! mutated after it is published; an update builds a replacement and swaps
//! it in.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::FutureExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::driver::{Capabilities, Driver, DriverConfig};
use super::error::{FsError, FsResult, FsResultExt, panic_message};
use super::hooks::{Hooks, StorageEvent};
use super::mount::MountTable;
use super::path::fix_and_clean_path;
use super::record::{STATUS_WORK, StorageRecord};
use super::registry::DriverRegistry;
use super::repository::StorageRepository;
use super::types::Obj;

/// A mounted, initialized storage.
pub struct Storage {
    record: StorageRecord,
    config: DriverConfig,
    driver: Box<dyn Driver>,
}

impl Storage {
    pub fn new(record: StorageRecord, driver: Box<dyn Driver>) -> Self {
        let config = driver.config();
        Self {
            record,
            config,
            driver,
        }
    }

    pub fn record(&self) -> &StorageRecord {
        &self.record
    }

    pub fn mount_path(&self) -> &str {
        &self.record.mount_path
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub fn capabilities(&self) -> Capabilities<'_> {
        self.driver.capabilities()
    }

    pub fn status(&self) -> &str {
        &self.record.status
    }

    /// Fail when the driver asks for status checks and init did not succeed.
    pub fn check_status(&self) -> FsResult<()> {
        if self.config.check_status && self.record.status != STATUS_WORK {
            return Err(FsError::StorageDown(format!(
                "{}: {}",
                self.record.mount_path, self.record.status
            )));
        }
        Ok(())
    }

    /// Listing cache lifetime.
    pub fn cache_ttl(&self) -> Duration {
        self.record.cache_ttl()
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("mount_path", &self.record.mount_path)
            .field("driver", &self.config.name)
            .field("status", &self.record.status)
            .finish()
    }
}

/// Owns the storage table and keeps it in step with the repository.
pub struct StorageManager {
    drivers: Arc<DriverRegistry>,
    mounts: Arc<MountTable>,
    repo: Arc<dyn StorageRepository>,
    hooks: Arc<Hooks>,
}

impl StorageManager {
    pub fn new(
        drivers: Arc<DriverRegistry>,
        repo: Arc<dyn StorageRepository>,
        hooks: Arc<Hooks>,
    ) -> Self {
        Self {
            drivers,
            mounts: Arc::new(MountTable::new()),
            repo,
            hooks,
        }
    }

    pub fn mounts(&self) -> &Arc<MountTable> {
        &self.mounts
    }

    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }

    pub fn repository(&self) -> &Arc<dyn StorageRepository> {
        &self.repo
    }

    /// Persist a new storage and mount it.
    ///
    /// The record stays persisted and mounted even when driver init fails;
    /// the failure is recorded in its status and returned.
    pub async fn create(&self, mut record: StorageRecord) -> FsResult<Uuid> {
        record.modified = SystemTime::now();
        record.mount_path = fix_and_clean_path(&record.mount_path);
        let constructor = self.drivers.constructor(&record.driver)?;
        if record.id.is_nil() {
            record.id = Uuid::now_v7();
        }
        self.repo
            .create_storage(&record)
            .context("failed create storage in database", &record.mount_path)?;

        let id = record.id;
        let mount_path = record.mount_path.clone();
        let (storage, result) = self.init_storage(record, constructor()).await;
        self.hooks.spawn_storage_hooks(StorageEvent::Add, storage);
        result.context("failed init storage but storage is already created", &mount_path)?;
        info!(%mount_path, %id, "storage created");
        Ok(id)
    }

    /// Mount an already persisted record.
    pub async fn load(&self, record: StorageRecord) -> FsResult<()> {
        let mut record = record;
        record.mount_path = fix_and_clean_path(&record.mount_path);
        let constructor = self.drivers.constructor(&record.driver)?;
        let mount_path = record.mount_path.clone();
        let (storage, result) = self.init_storage(record, constructor()).await;
        self.hooks.spawn_storage_hooks(StorageEvent::Add, storage);
        result.context("failed init storage", &mount_path)
    }

    /// Persist changes to a storage and rebuild its live instance.
    pub async fn update(&self, mut record: StorageRecord) -> FsResult<()> {
        let old = self
            .repo
            .get_storage_by_id(record.id)?
            .ok_or_else(|| FsError::not_found(format!("storage id {}", record.id)))?;
        if old.driver != record.driver {
            return Err(FsError::DriverConflict {
                from: old.driver,
                to: record.driver,
            });
        }
        record.modified = SystemTime::now();
        record.mount_path = fix_and_clean_path(&record.mount_path);
        self.repo
            .update_storage(&record)
            .context("failed update storage in database", &record.mount_path)?;
        if record.disabled {
            debug!(mount_path = %record.mount_path, "storage disabled, leaving instance as is");
            return Ok(());
        }

        let old_mount = fix_and_clean_path(&old.mount_path);
        let previous = self.mounts.get(&old_mount);

        // The replacement is fully built before it is published; the old
        // instance keeps serving until then.
        let constructor = self.drivers.constructor(&record.driver)?;
        let mount_path = record.mount_path.clone();
        let (storage, result) = self.init_storage(record, constructor()).await;
        if old_mount != mount_path {
            if let Some(stale) = self.mounts.remove(&old_mount) {
                if previous.as_ref().is_none_or(|p| !Arc::ptr_eq(p, &stale)) {
                    // Someone else mounted here meanwhile
                    self.mounts.insert(stale);
                }
            }
        }
        if let Some(previous) = previous {
            if let Err(e) = previous.driver().teardown().await {
                warn!(mount_path = %old_mount, error = %e, "failed drop storage");
            }
        }
        self.hooks.spawn_storage_hooks(StorageEvent::Update, storage);
        result.context("failed init storage", &mount_path)?;
        info!(%mount_path, "storage updated");
        Ok(())
    }

    /// Unmount and forget a storage.
    pub async fn delete(&self, id: Uuid) -> FsResult<()> {
        let record = self
            .repo
            .get_storage_by_id(id)?
            .ok_or_else(|| FsError::not_found(format!("storage id {id}")))?;
        let mount_path = fix_and_clean_path(&record.mount_path);
        if let Some(storage) = self.mounts.remove(&mount_path) {
            if let Err(e) = storage.driver().teardown().await {
                warn!(%mount_path, error = %e, "failed drop storage");
            }
            self.hooks.spawn_storage_hooks(StorageEvent::Remove, storage);
        }
        self.repo
            .delete_storage_by_id(id)
            .context("failed delete storage in database", &mount_path)?;
        info!(%mount_path, %id, "storage deleted");
        Ok(())
    }

    /// Mount every enabled record. Individual failures are logged and
    /// skipped; returns how many storages came up working.
    pub async fn load_all(&self) -> FsResult<usize> {
        let records = self.repo.get_enabled_storages()?;
        let total = records.len();
        let mut working = 0;
        for record in records {
            let mount_path = record.mount_path.clone();
            match self.load(record).await {
                Ok(()) => working += 1,
                Err(e) => warn!(%mount_path, error = %e, "failed load storage"),
            }
        }
        info!(working, total, "storages loaded");
        Ok(working)
    }

    pub fn get_by_mount_path(&self, mount_path: &str) -> FsResult<Arc<Storage>> {
        let mount_path = fix_and_clean_path(mount_path);
        self.mounts
            .get(&mount_path)
            .ok_or(FsError::StorageNotFound(mount_path))
    }

    pub fn has(&self, mount_path: &str) -> bool {
        self.mounts.contains(&fix_and_clean_path(mount_path))
    }

    /// Every storage, sorted by order then mount path.
    pub fn all(&self) -> Vec<Arc<Storage>> {
        self.mounts.all()
    }

    /// Synthetic directories for mount points strictly below `prefix`.
    pub fn virtual_files_by_path(&self, prefix: &str) -> Vec<Obj> {
        self.mounts.virtual_files(prefix)
    }

    /// Build, initialize and publish one storage.
    ///
    /// The instance is published whatever the outcome; a failure (or a
    /// panic in driver code) becomes its status text.
    async fn init_storage(
        &self,
        mut record: StorageRecord,
        mut driver: Box<dyn Driver>,
    ) -> (Arc<Storage>, FsResult<()>) {
        let result = match AssertUnwindSafe(self.prepare(&mut record, driver.as_mut()))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => Err(FsError::InitPanic(panic_message(payload.as_ref()))),
        };

        match &result {
            Ok(()) => record.status = STATUS_WORK.to_string(),
            Err(e) => {
                warn!(mount_path = %record.mount_path, error = %e, "storage init failed");
                record.status = e.to_string();
            }
        }
        match driver.addition() {
            Ok(addition) => record.addition = addition.to_string(),
            Err(e) => warn!(mount_path = %record.mount_path, error = %e, "failed read addition"),
        }
        if let Err(e) = self.repo.update_storage(&record) {
            warn!(mount_path = %record.mount_path, error = %e, "failed save storage status");
        }

        let storage = Arc::new(Storage::new(record, driver));
        self.mounts.insert(Arc::clone(&storage));
        debug!(mount_path = storage.mount_path(), status = storage.status(), "storage published");
        (storage, result)
    }

    async fn prepare(&self, record: &mut StorageRecord, driver: &mut dyn Driver) -> FsResult<()> {
        driver.set_addition(&record.addition)?;
        if let Some(target) = record.reference_target() {
            let target = target.to_string();
            if let Some(reference) = driver.as_reference() {
                let storage = self
                    .get_by_mount_path(&target)
                    .map_err(|e| FsError::Reference(e.to_string()))?;
                reference.init_reference(storage)?;
            }
        }
        driver.init(record).await
    }
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager")
            .field("mounts", &self.mounts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::drivers::mock::{self, MockDriver, MockState};
    use crate::vfs::drivers::{memory, register_builtin};
    use crate::vfs::repository::MemoryStorageRepository;
    use crate::vfs::driver::Reader;
    use crate::vfs::error::ErrorKind;
    use crate::vfs::types::{ListArgs, Object};

    fn manager(state: &Arc<MockState>) -> StorageManager {
        let drivers = Arc::new(DriverRegistry::new());
        register_builtin(&drivers).unwrap();
        let s = Arc::clone(state);
        drivers
            .register(move || Box::new(MockDriver::new(Arc::clone(&s))))
            .unwrap();
        StorageManager::new(
            drivers,
            Arc::new(MemoryStorageRepository::new()),
            Arc::new(Hooks::new()),
        )
    }

    #[tokio::test]
    async fn test_create_mounts_and_persists_status() {
        let state = MockState::new();
        let storages = manager(&state);
        let id = storages
            .create(StorageRecord::new("/m/", mock::NAME))
            .await
            .unwrap();

        let storage = storages.get_by_mount_path("/m").unwrap();
        assert_eq!(storage.status(), STATUS_WORK);
        assert!(storage.check_status().is_ok());
        let saved = storages.repository().get_storage_by_id(id).unwrap().unwrap();
        assert_eq!(saved.mount_path, "/m");
        assert!(saved.is_working());
    }

    #[tokio::test]
    async fn test_unknown_driver_is_not_persisted() {
        let state = MockState::new();
        let storages = manager(&state);
        let err = storages
            .create(StorageRecord::new("/m", "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::DriverNotFound(_)));
        assert!(storages.repository().get_storages().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_init_still_mounted() {
        let state = MockState::new();
        state.options.lock().fail_init = true;
        let storages = manager(&state);
        let err = storages
            .create(StorageRecord::new("/m", mock::NAME))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);

        let storage = storages.get_by_mount_path("/m").unwrap();
        assert!(storage.status().contains("mock init failure"));
        assert!(matches!(storage.check_status(), Err(FsError::StorageDown(_))));
        let saved = storages.repository().get_storages().unwrap();
        assert_eq!(saved.len(), 1);
        assert!(!saved[0].is_working());
    }

    #[tokio::test]
    async fn test_init_panic_is_contained() {
        let state = MockState::new();
        state.options.lock().panic_on_init = true;
        let storages = manager(&state);
        let err = storages
            .create(StorageRecord::new("/m", mock::NAME))
            .await
            .unwrap_err();
        assert!(matches!(err.root_cause(), FsError::InitPanic(msg) if msg.contains("exploded")));

        let storage = storages.get_by_mount_path("/m").unwrap();
        assert!(storage.status().starts_with("[panic]"));
    }

    #[tokio::test]
    async fn test_update_rejects_driver_change() {
        let state = MockState::new();
        let storages = manager(&state);
        let id = storages
            .create(StorageRecord::new("/m", mock::NAME))
            .await
            .unwrap();
        let mut record = storages.repository().get_storage_by_id(id).unwrap().unwrap();
        record.driver = memory::NAME.to_string();
        let err = storages.update(record).await.unwrap_err();
        assert!(matches!(err, FsError::DriverConflict { .. }));
    }

    #[tokio::test]
    async fn test_update_moves_mount_and_swaps_instance() {
        let state = MockState::new();
        let storages = manager(&state);
        let id = storages
            .create(StorageRecord::new("/m", mock::NAME))
            .await
            .unwrap();
        let before = storages.get_by_mount_path("/m").unwrap();

        let mut record = storages.repository().get_storage_by_id(id).unwrap().unwrap();
        record.mount_path = "/n".into();
        storages.update(record).await.unwrap();

        assert!(!storages.has("/m"));
        let after = storages.get_by_mount_path("/n").unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(state.calls("init"), 2);
        assert_eq!(state.calls("teardown"), 1);
        // The published snapshot is untouched
        assert_eq!(before.mount_path(), "/m");
    }

    #[tokio::test]
    async fn test_update_keeps_old_instance_serving_until_swap() {
        let state = MockState::new();
        let storages = Arc::new(manager(&state));
        let id = storages
            .create(StorageRecord::new("/m", mock::NAME))
            .await
            .unwrap();
        let before = storages.get_by_mount_path("/m").unwrap();
        state.options.lock().init_delay = Some(Duration::from_millis(100));

        let record = storages.repository().get_storage_by_id(id).unwrap().unwrap();
        let updating = {
            let storages = Arc::clone(&storages);
            tokio::spawn(async move { storages.update(record).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Replacement still initializing: the old instance is live and whole
        let live = storages.get_by_mount_path("/m").unwrap();
        assert!(Arc::ptr_eq(&live, &before));
        assert_eq!(state.calls("teardown"), 0);
        let root = Obj::new(Object::folder("root").with_path("/"));
        live.driver().list(&root, &ListArgs::default()).await.unwrap();

        updating.await.unwrap().unwrap();
        let after = storages.get_by_mount_path("/m").unwrap();
        assert!(!Arc::ptr_eq(&after, &before));
        assert_eq!(state.calls("teardown"), 1);
        let err = before.driver().list(&root, &ListArgs::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageDown);
    }

    #[tokio::test]
    async fn test_update_survives_teardown_failure() {
        let state = MockState::new();
        let storages = manager(&state);
        let id = storages
            .create(StorageRecord::new("/m", mock::NAME))
            .await
            .unwrap();
        let before = storages.get_by_mount_path("/m").unwrap();
        state.options.lock().fail_teardown = true;

        let mut record = storages.repository().get_storage_by_id(id).unwrap().unwrap();
        record.remark = "renamed".into();
        storages.update(record).await.unwrap();

        let after = storages.get_by_mount_path("/m").unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.record().remark, "renamed");
        assert_eq!(after.status(), STATUS_WORK);
        assert_eq!(state.calls("teardown"), 1);
    }

    #[tokio::test]
    async fn test_disabled_update_keeps_instance() {
        let state = MockState::new();
        let storages = manager(&state);
        let id = storages
            .create(StorageRecord::new("/m", mock::NAME))
            .await
            .unwrap();
        let mut record = storages.repository().get_storage_by_id(id).unwrap().unwrap();
        record.disabled = true;
        storages.update(record).await.unwrap();
        assert!(storages.has("/m"));
        assert_eq!(state.calls("init"), 1);
        assert!(storages.repository().get_enabled_storages().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_unmounts_and_forgets() {
        let state = MockState::new();
        let storages = manager(&state);
        let id = storages
            .create(StorageRecord::new("/m", mock::NAME))
            .await
            .unwrap();
        storages.delete(id).await.unwrap();
        assert!(!storages.has("/m"));
        assert_eq!(state.calls("teardown"), 1);
        assert!(storages.repository().get_storage_by_id(id).unwrap().is_none());
        assert!(storages.delete(id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_load_all_counts_working() {
        let state = MockState::new();
        let storages = manager(&state);
        let repo = storages.repository();
        let mut good = StorageRecord::new("/good", memory::NAME);
        good.id = Uuid::now_v7();
        repo.create_storage(&good).unwrap();
        let mut bad = StorageRecord::new("/bad", "gone");
        bad.id = Uuid::now_v7();
        repo.create_storage(&bad).unwrap();
        let mut off = StorageRecord::new("/off", memory::NAME);
        off.id = Uuid::now_v7();
        off.disabled = true;
        repo.create_storage(&off).unwrap();

        assert_eq!(storages.load_all().await.unwrap(), 1);
        assert!(storages.has("/good"));
        assert!(!storages.has("/bad"));
        assert!(!storages.has("/off"));
    }

    #[tokio::test]
    async fn test_alias_wired_to_reference() {
        let state = MockState::new();
        let storages = manager(&state);
        storages
            .create(StorageRecord::new("/target", memory::NAME))
            .await
            .unwrap();
        storages
            .create(StorageRecord::new("/alias", "alias").with_remark("ref:/target\nnotes"))
            .await
            .unwrap();
        let alias = storages.get_by_mount_path("/alias").unwrap();
        assert_eq!(alias.status(), STATUS_WORK);
        assert!(alias.config().no_upload);

        let err = storages
            .create(StorageRecord::new("/dangling", "alias").with_remark("ref:/missing"))
            .await
            .unwrap_err();
        assert!(matches!(err.root_cause(), FsError::Reference(_)));
    }

    #[tokio::test]
    async fn test_storage_hooks_see_lifecycle() {
        let state = MockState::new();
        let storages = manager(&state);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        storages.hooks.register_storage(move |event, storage| {
            let _ = tx.send((event, storage.mount_path().to_string()));
            Ok(())
        });
        let id = storages
            .create(StorageRecord::new("/m", mock::NAME))
            .await
            .unwrap();
        storages.delete(id).await.unwrap();

        let mut events = Vec::new();
        while events.len() < 2 {
            let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            events.push(event);
        }
        assert!(events.contains(&(StorageEvent::Add, "/m".to_string())));
        assert!(events.contains(&(StorageEvent::Remove, "/m".to_string())));
    }
}
