//! Storage record persistence boundary.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use uuid::Uuid;

use super::error::{FsError, FsResult};
use super::record::StorageRecord;

/// Authoritative store of storage records.
///
/// Calls are synchronous; implementations are expected to be quick local
/// stores (SQLite, memory).
pub trait StorageRepository: Send + Sync {
    fn create_storage(&self, record: &StorageRecord) -> FsResult<()>;

    fn update_storage(&self, record: &StorageRecord) -> FsResult<()>;

    fn delete_storage_by_id(&self, id: Uuid) -> FsResult<()>;

    fn get_storage_by_id(&self, id: Uuid) -> FsResult<Option<StorageRecord>>;

    fn get_storage_by_mount_path(&self, mount_path: &str) -> FsResult<Option<StorageRecord>>;

    /// Enabled records ordered by `order`, then mount path.
    fn get_enabled_storages(&self) -> FsResult<Vec<StorageRecord>>;

    /// Every record ordered by `order`, then mount path.
    fn get_storages(&self) -> FsResult<Vec<StorageRecord>>;
}

/// In-memory repository.
#[derive(Debug, Default)]
pub struct MemoryStorageRepository {
    records: RwLock<BTreeMap<Uuid, StorageRecord>>,
}

impl MemoryStorageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted(&self, filter: impl Fn(&StorageRecord) -> bool) -> Vec<StorageRecord> {
        let mut records: Vec<StorageRecord> = self
            .records
            .read()
            .values()
            .filter(|r| filter(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.order
                .cmp(&b.order)
                .then_with(|| a.mount_path.cmp(&b.mount_path))
        });
        records
    }
}

impl StorageRepository for MemoryStorageRepository {
    fn create_storage(&self, record: &StorageRecord) -> FsResult<()> {
        let mut records = self.records.write();
        if records.contains_key(&record.id) {
            return Err(FsError::AlreadyExists(format!("storage id {}", record.id)));
        }
        if records.values().any(|r| r.mount_path == record.mount_path) {
            return Err(FsError::AlreadyExists(format!(
                "mount path {}",
                record.mount_path
            )));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    fn update_storage(&self, record: &StorageRecord) -> FsResult<()> {
        let mut records = self.records.write();
        if records
            .values()
            .any(|r| r.id != record.id && r.mount_path == record.mount_path)
        {
            return Err(FsError::AlreadyExists(format!(
                "mount path {}",
                record.mount_path
            )));
        }
        match records.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(FsError::not_found(format!("storage id {}", record.id))),
        }
    }

    fn delete_storage_by_id(&self, id: Uuid) -> FsResult<()> {
        self.records.write().remove(&id);
        Ok(())
    }

    fn get_storage_by_id(&self, id: Uuid) -> FsResult<Option<StorageRecord>> {
        Ok(self.records.read().get(&id).cloned())
    }

    fn get_storage_by_mount_path(&self, mount_path: &str) -> FsResult<Option<StorageRecord>> {
        Ok(self
            .records
            .read()
            .values()
            .find(|r| r.mount_path == mount_path)
            .cloned())
    }

    fn get_enabled_storages(&self) -> FsResult<Vec<StorageRecord>> {
        Ok(self.sorted(|r| !r.disabled))
    }

    fn get_storages(&self) -> FsResult<Vec<StorageRecord>> {
        Ok(self.sorted(|_| true))
    }
}
