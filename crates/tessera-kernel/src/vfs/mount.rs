//! Mount table with deepest-prefix routing and round-robin balancing.
//!
//! Storages are keyed by their mount path. A mount path may carry a
//! `.balance…` suffix; such storages share the routing prefix of their
//! actual mount path and calls rotate between them.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::trace;

use super::error::{FsError, FsResult};
use super::path::{actual_mount_path, fix_and_clean_path, is_sub_path, join, mount_depth};
use super::storage::Storage;
use super::types::{Obj, Object};

/// Summary of one mounted storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub mount_path: String,
    pub driver: String,
    pub status: String,
    pub order: i32,
}

/// Live storages keyed by mount path.
pub struct MountTable {
    storages: RwLock<BTreeMap<String, Arc<Storage>>>,
    /// Rotation counters keyed by actual mount path; created lazily, never removed.
    balance: DashMap<String, Arc<AtomicU64>>,
}

impl std::fmt::Debug for MountTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountTable")
            .field("mounts", &self.storages.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MountTable {
    pub fn new() -> Self {
        Self {
            storages: RwLock::new(BTreeMap::new()),
            balance: DashMap::new(),
        }
    }

    /// Publish a storage under its mount path, replacing any previous one.
    pub fn insert(&self, storage: Arc<Storage>) -> Option<Arc<Storage>> {
        let key = storage.mount_path().to_string();
        self.storages.write().insert(key, storage)
    }

    pub fn remove(&self, mount_path: &str) -> Option<Arc<Storage>> {
        self.storages.write().remove(mount_path)
    }

    pub fn get(&self, mount_path: &str) -> Option<Arc<Storage>> {
        self.storages.read().get(mount_path).cloned()
    }

    pub fn contains(&self, mount_path: &str) -> bool {
        self.storages.read().contains_key(mount_path)
    }

    pub fn len(&self) -> usize {
        self.storages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.storages.read().is_empty()
    }

    /// Every storage, sorted by order then mount path.
    pub fn all(&self) -> Vec<Arc<Storage>> {
        let mut storages: Vec<Arc<Storage>> = self.storages.read().values().cloned().collect();
        storages.sort_by(|a, b| {
            a.record()
                .order
                .cmp(&b.record().order)
                .then_with(|| a.mount_path().cmp(b.mount_path()))
        });
        storages
    }

    pub fn list_mounts(&self) -> Vec<MountInfo> {
        self.all()
            .into_iter()
            .map(|s| MountInfo {
                mount_path: s.mount_path().to_string(),
                driver: s.record().driver.clone(),
                status: s.record().status.clone(),
                order: s.record().order,
            })
            .collect()
    }

    /// Storages whose actual mount path is the deepest prefix of `path`,
    /// sorted by mount path.
    pub fn storages_by_path(&self, path: &str) -> Vec<Arc<Storage>> {
        let path = fix_and_clean_path(path);
        let storages = self.storages.read();
        let mut best_depth = 0;
        let mut candidates = Vec::new();
        for (mount_path, storage) in storages.iter() {
            if !is_sub_path(actual_mount_path(mount_path), &path) {
                continue;
            }
            let depth = mount_depth(mount_path);
            if depth > best_depth {
                best_depth = depth;
                candidates.clear();
            }
            if depth == best_depth {
                candidates.push(Arc::clone(storage));
            }
        }
        candidates
    }

    /// Pick one of the deepest-prefix storages, rotating when several share it.
    pub fn balanced(&self, path: &str) -> Option<Arc<Storage>> {
        let candidates = self.storages_by_path(path);
        match candidates.len() {
            0 => None,
            1 => candidates.into_iter().next(),
            n => {
                let key = actual_mount_path(candidates[0].mount_path()).to_string();
                let counter = self
                    .balance
                    .entry(key)
                    .or_insert_with(|| Arc::new(AtomicU64::new(0)))
                    .clone();
                let i = (counter.fetch_add(1, Ordering::Relaxed) % n as u64) as usize;
                trace!(index = i, candidates = n, "balanced storage pick");
                candidates.into_iter().nth(i)
            }
        }
    }

    /// Resolve a virtual path to a storage and the path inside it.
    pub fn resolve(&self, path: &str) -> FsResult<(Arc<Storage>, String)> {
        let path = fix_and_clean_path(path);
        let storage = self.balanced(&path).ok_or_else(|| {
            if path == "/" {
                FsError::StorageNotFound("please add a storage first".to_string())
            } else {
                FsError::StorageNotFound(path.clone())
            }
        })?;
        let actual = strip_mount(&storage, &path);
        Ok((storage, actual))
    }

    /// Resolve, keeping `preferred` when it is one of the candidates.
    ///
    /// Used for two-path operations so both ends land on the same balanced
    /// storage.
    pub fn resolve_with(
        &self,
        path: &str,
        preferred: &Arc<Storage>,
    ) -> FsResult<(Arc<Storage>, String)> {
        let path = fix_and_clean_path(path);
        if self
            .storages_by_path(&path)
            .iter()
            .any(|s| Arc::ptr_eq(s, preferred))
        {
            let actual = strip_mount(preferred, &path);
            return Ok((Arc::clone(preferred), actual));
        }
        self.resolve(&path)
    }

    /// One synthetic directory per mount point strictly below `prefix`,
    /// named by the next path segment.
    pub fn virtual_files(&self, prefix: &str) -> Vec<Obj> {
        let prefix = fix_and_clean_path(prefix);
        let mut seen = HashSet::new();
        let mut files = Vec::new();
        for storage in self.all() {
            let mount_path = actual_mount_path(storage.mount_path());
            if prefix.len() >= mount_path.len() || !is_sub_path(&prefix, mount_path) {
                continue;
            }
            let rest = mount_path[prefix.len()..].trim_start_matches('/');
            let name = rest.split('/').next().unwrap_or_default();
            if name.is_empty() || !seen.insert(name.to_string()) {
                continue;
            }
            files.push(Obj::new(
                Object::folder(name)
                    .with_path(join(&prefix, name))
                    .with_modified(storage.record().modified),
            ));
        }
        files
    }
}

fn strip_mount(storage: &Storage, path: &str) -> String {
    let mount = actual_mount_path(storage.mount_path());
    let rest = if mount == "/" {
        path
    } else {
        path.strip_prefix(mount).unwrap_or(path)
    };
    fix_and_clean_path(rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::drivers::MemoryDriver;
    use crate::vfs::record::StorageRecord;

    fn storage(mount_path: &str) -> Arc<Storage> {
        Arc::new(Storage::new(
            StorageRecord::new(mount_path, "memory"),
            Box::new(MemoryDriver::new()),
        ))
    }

    fn table(mounts: &[&str]) -> MountTable {
        let table = MountTable::new();
        for m in mounts {
            table.insert(storage(m));
        }
        table
    }

    #[test]
    fn test_resolve_basic() {
        let table = table(&["/drive"]);
        let (s, rel) = table.resolve("/drive/docs/a.txt").unwrap();
        assert_eq!(s.mount_path(), "/drive");
        assert_eq!(rel, "/docs/a.txt");

        let (_, rel) = table.resolve("/drive").unwrap();
        assert_eq!(rel, "/");
    }

    #[test]
    fn test_no_storage() {
        let table = MountTable::new();
        let err = table.resolve("/").unwrap_err();
        assert!(err.to_string().contains("please add a storage first"));
        assert!(err.is_not_found());

        let table = self::table(&["/drive"]);
        assert!(table.resolve("/other/file").unwrap_err().is_not_found());
    }

    #[test]
    fn test_deeper_mount_wins() {
        let table = table(&["/", "/a", "/a/b"]);
        let (s, rel) = table.resolve("/a/b/c").unwrap();
        assert_eq!(s.mount_path(), "/a/b");
        assert_eq!(rel, "/c");

        let (s, rel) = table.resolve("/a/x").unwrap();
        assert_eq!(s.mount_path(), "/a");
        assert_eq!(rel, "/x");

        let (s, rel) = table.resolve("/elsewhere").unwrap();
        assert_eq!(s.mount_path(), "/");
        assert_eq!(rel, "/elsewhere");
    }

    #[test]
    fn test_prefix_must_be_segment_aligned() {
        let table = table(&["/", "/a"]);
        let (s, _) = table.resolve("/ab/c").unwrap();
        assert_eq!(s.mount_path(), "/");
    }

    #[test]
    fn test_round_robin_rotation() {
        let table = table(&["/drive", "/drive.balance1", "/drive.balance2"]);
        let picks: Vec<String> = (0..6)
            .map(|_| table.resolve("/drive/f").unwrap().0.mount_path().to_string())
            .collect();
        assert_eq!(
            picks,
            vec![
                "/drive",
                "/drive.balance1",
                "/drive.balance2",
                "/drive",
                "/drive.balance1",
                "/drive.balance2",
            ]
        );
        // Backend path is relative to the shared prefix for every member
        let (_, rel) = table.resolve("/drive/f").unwrap();
        assert_eq!(rel, "/f");
    }

    #[test]
    fn test_deeper_mount_beats_balanced_group() {
        let table = table(&["/drive", "/drive.balance1", "/drive/deep"]);
        for _ in 0..4 {
            let (s, rel) = table.resolve("/drive/deep/x").unwrap();
            assert_eq!(s.mount_path(), "/drive/deep");
            assert_eq!(rel, "/x");
        }
    }

    #[test]
    fn test_resolve_with_keeps_preferred() {
        let table = table(&["/drive", "/drive.balance1"]);
        let (src, _) = table.resolve("/drive/a").unwrap();
        for _ in 0..4 {
            let (dst, rel) = table.resolve_with("/drive/b", &src).unwrap();
            assert!(Arc::ptr_eq(&src, &dst));
            assert_eq!(rel, "/b");
        }
    }

    #[test]
    fn test_virtual_files() {
        let table = table(&["/a/b", "/a/c/d", "/a/c/e", "/x", "/a.balance1"]);
        let names: Vec<String> = table
            .virtual_files("/a")
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        assert_eq!(names, vec!["b", "c"]);
        assert!(table.virtual_files("/a").iter().all(Obj::is_dir));

        let root: Vec<String> = table
            .virtual_files("/")
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        assert_eq!(root, vec!["a", "x"]);

        assert!(table.virtual_files("/x").is_empty());
    }

    #[test]
    fn test_insert_replaces() {
        let table = table(&["/m"]);
        let replacement = storage("/m");
        let old = table.insert(Arc::clone(&replacement)).unwrap();
        assert!(!Arc::ptr_eq(&old, &replacement));
        assert!(Arc::ptr_eq(&table.get("/m").unwrap(), &replacement));
        assert_eq!(table.len(), 1);
    }
}
