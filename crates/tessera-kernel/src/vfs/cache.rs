//! Expiring caches for listings and links.
//!
//! Each entry carries its own time to live. Expired entries are invisible to
//! lookups and reclaimed by moka's housekeeping. A zero TTL stores nothing
//! useful, the entry is already stale.

use std::time::{Duration, Instant};

use moka::Expiry;
use moka::ops::compute::{CompResult, Op};
use moka::sync::Cache;
use tracing::trace;

use super::path::join;
use super::types::Obj;

#[derive(Clone)]
struct Entry<V> {
    value: V,
    ttl: Duration,
}

/// Expire each entry `ttl` after it was last written.
struct PerEntryTtl;

impl<V> Expiry<String, Entry<V>> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &Entry<V>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &Entry<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// Key-value cache with a per-entry deadline.
pub struct TtlCache<V> {
    entries: Cache<String, Entry<V>>,
}

impl<V: Clone + Send + Sync + 'static> Default for TtlCache<V> {
    fn default() -> Self {
        Self {
            entries: Cache::builder().expire_after(PerEntryTtl).build(),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).map(|e| e.value)
    }

    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.entries.insert(key.into(), Entry { value, ttl });
    }

    pub fn del(&self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Mutate a fresh entry in place and restart its deadline.
    ///
    /// Returns false when there is no fresh entry.
    pub fn modify(&self, key: &str, ttl: Duration, f: impl FnOnce(&mut V)) -> bool {
        let result = self
            .entries
            .entry_by_ref(key)
            .and_compute_with(|current| match current {
                Some(entry) => {
                    let mut value = entry.into_value().value;
                    f(&mut value);
                    Op::Put(Entry { value, ttl })
                }
                None => Op::Nop,
            });
        matches!(result, CompResult::ReplacedWith(_))
    }

    /// Drop every entry whose key fails the predicate.
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) {
        for (key, _) in self.entries.iter() {
            if !keep(key.as_str()) {
                self.entries.invalidate(key.as_str());
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Apply pending evictions now instead of on moka's schedule.
    pub fn run_pending_tasks(&self) {
        self.entries.run_pending_tasks();
    }

    /// Number of live entries, after reclaiming expired ones.
    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        self.entries.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
    }
}

/// Directory listings keyed by `mountPath + dirPath`, with in-place patching.
#[derive(Default)]
pub struct ListCache {
    inner: TtlCache<Vec<Obj>>,
}

impl ListCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<Obj>> {
        self.inner.get(key)
    }

    pub fn set(&self, key: &str, objs: Vec<Obj>, ttl: Duration) {
        self.inner.set(key, objs, ttl);
    }

    pub fn del(&self, key: &str) {
        self.inner.del(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains(key)
    }

    /// Insert `obj` into a cached listing.
    ///
    /// An entry with the same name is replaced. Otherwise the object is
    /// appended when the last entry is of the same kind (file or folder) and
    /// prepended when it is not, so folders and files stay grouped.
    pub fn add_obj(&self, key: &str, obj: Obj, ttl: Duration) {
        let patched = self.inner.modify(key, ttl, |objs| {
            if let Some(slot) = objs.iter_mut().find(|o| o.name() == obj.name()) {
                *slot = obj;
                return;
            }
            match objs.last() {
                Some(last) if last.is_dir() == obj.is_dir() => objs.push(obj),
                Some(_) => objs.insert(0, obj),
                None => objs.push(obj),
            }
        });
        trace!(key, patched, "list cache add");
    }

    /// Replace `old_name` with `obj`, dropping any entry already holding the
    /// new name.
    pub fn update_obj(&self, key: &str, old_name: &str, obj: Obj, ttl: Duration) {
        let patched = self.inner.modify(key, ttl, |objs| {
            if old_name != obj.name() {
                objs.retain(|o| o.name() != obj.name());
            }
            if let Some(slot) = objs.iter_mut().find(|o| o.name() == old_name) {
                *slot = obj;
            }
        });
        trace!(key, patched, "list cache update");
    }

    /// Remove the entry named `name` from a cached listing.
    pub fn del_obj(&self, key: &str, name: &str, ttl: Duration) {
        let patched = self.inner.modify(key, ttl, |objs| {
            objs.retain(|o| o.name() != name);
        });
        trace!(key, patched, "list cache delete");
    }

    /// Drop the listing at `key` and every cached listing below it,
    /// following the folders recorded in the cache.
    pub fn clear_recursive(&self, key: &str) {
        if let Some(objs) = self.inner.get(key) {
            for obj in objs.iter().filter(|o| o.is_dir()) {
                self.clear_recursive(&join(key, obj.name()));
            }
        }
        self.inner.del(key);
    }

    /// Drop the listing at `key` and every listing keyed below it.
    pub fn remove_prefix(&self, key: &str) {
        let below = format!("{}/", key.trim_end_matches('/'));
        self.inner.retain(|k| k != key && !k.starts_with(&below));
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::types::Object;

    const TTL: Duration = Duration::from_secs(60);

    fn file(name: &str) -> Obj {
        Obj::new(Object::file(name, 1))
    }

    fn folder(name: &str) -> Obj {
        Obj::new(Object::folder(name))
    }

    fn names(cache: &ListCache, key: &str) -> Vec<String> {
        cache
            .get(key)
            .unwrap()
            .iter()
            .map(|o| o.name().to_string())
            .collect()
    }

    #[test]
    fn test_ttl_expiry() {
        let cache: TtlCache<u32> = TtlCache::new();
        cache.set("a", 1, TTL);
        cache.set("b", 2, Duration::ZERO);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
        assert!(!cache.contains("b"));
    }

    #[test]
    fn test_expired_entries_reclaimed_without_lookup() {
        let cache: TtlCache<u32> = TtlCache::new();
        for i in 0..16 {
            cache.set(format!("/m/{i}"), i, Duration::from_millis(20));
        }
        cache.set("/m/keep", 99, TTL);
        // Expiry timers fire at roughly one second granularity
        std::thread::sleep(Duration::from_millis(2500));
        // No key is looked up; housekeeping alone drops the stale ones
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("/m/keep"), Some(99));
    }

    #[test]
    fn test_modify_restarts_deadline() {
        let cache: TtlCache<u32> = TtlCache::new();
        cache.set("a", 1, Duration::from_millis(30));
        std::thread::sleep(Duration::from_millis(15));
        assert!(cache.modify("a", TTL, |v| *v += 1));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("a"), Some(2));
    }

    #[test]
    fn test_retain_by_key() {
        let cache: TtlCache<u32> = TtlCache::new();
        cache.set("/m/a", 1, TTL);
        cache.set("/n/a", 2, TTL);
        cache.retain(|k| !k.starts_with("/m/"));
        assert!(!cache.contains("/m/a"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_modify_missing_is_noop() {
        let cache: TtlCache<u32> = TtlCache::new();
        assert!(!cache.modify("a", TTL, |v| *v += 1));
        cache.set("a", 1, TTL);
        assert!(cache.modify("a", TTL, |v| *v += 1));
        assert_eq!(cache.get("a"), Some(2));
    }

    #[test]
    fn test_add_obj_grouping() {
        let cache = ListCache::new();
        cache.set("/m/d", vec![folder("sub"), file("a")], TTL);

        cache.add_obj("/m/d", file("b"), TTL);
        assert_eq!(names(&cache, "/m/d"), vec!["sub", "a", "b"]);

        cache.add_obj("/m/d", folder("new"), TTL);
        assert_eq!(names(&cache, "/m/d"), vec!["new", "sub", "a", "b"]);

        // Same name replaces in place
        cache.add_obj("/m/d", Obj::new(Object::file("a", 99)), TTL);
        let objs = cache.get("/m/d").unwrap();
        assert_eq!(objs.len(), 4);
        assert_eq!(objs[2].size(), 99);
    }

    #[test]
    fn test_add_obj_without_entry_does_nothing() {
        let cache = ListCache::new();
        cache.add_obj("/m/d", file("a"), TTL);
        assert!(cache.get("/m/d").is_none());
    }

    #[test]
    fn test_update_obj() {
        let cache = ListCache::new();
        cache.set("/m", vec![file("old"), file("taken"), file("other")], TTL);
        cache.update_obj("/m", "old", file("taken"), TTL);
        assert_eq!(names(&cache, "/m"), vec!["taken", "other"]);
    }

    #[test]
    fn test_del_obj() {
        let cache = ListCache::new();
        cache.set("/m", vec![file("a"), file("b")], TTL);
        cache.del_obj("/m", "a", TTL);
        assert_eq!(names(&cache, "/m"), vec!["b"]);
    }

    #[test]
    fn test_clear_recursive() {
        let cache = ListCache::new();
        cache.set("/m/d", vec![folder("x"), file("f")], TTL);
        cache.set("/m/d/x", vec![folder("y")], TTL);
        cache.set("/m/d/x/y", vec![file("z")], TTL);
        cache.set("/m/other", vec![file("keep")], TTL);

        cache.clear_recursive("/m/d");
        assert!(cache.get("/m/d").is_none());
        assert!(cache.get("/m/d/x").is_none());
        assert!(cache.get("/m/d/x/y").is_none());
        assert!(cache.get("/m/other").is_some());
    }

    #[test]
    fn test_remove_prefix() {
        let cache = ListCache::new();
        cache.set("/m", vec![file("a")], TTL);
        cache.set("/m/d", vec![file("b")], TTL);
        cache.set("/mx", vec![file("c")], TTL);
        cache.remove_prefix("/m");
        assert!(cache.get("/m").is_none());
        assert!(cache.get("/m/d").is_none());
        assert!(cache.get("/mx").is_some());
    }
}
