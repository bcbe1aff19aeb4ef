//! In-memory storage driver.
//!
//! Used for scratch mounts and testing. All data is ephemeral and lives as
//! long as the driver instance.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use crate::vfs::driver::{
    Capabilities, CopierResult, DirMaker, Driver, DriverConfig, Item, Meta, Mover,
    OtherCaller, Putter, Reader, Remover, Renamer, RootGetter, TYPE_NUMBER, decode_addition,
    encode_addition,
};
use crate::vfs::error::{FsError, FsResult};
use crate::vfs::link::Link;
use crate::vfs::path::{dir, fix_and_clean_path, is_sub_path, join, split};
use crate::vfs::record::StorageRecord;
use crate::vfs::stream::{FileStream, UpdateProgress};
use crate::vfs::types::{LinkArgs, ListArgs, Obj, Object, OtherArgs};

pub const NAME: &str = "memory";

/// Addition payload of the memory driver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryAddition {
    /// Lifetime of produced links, zero for links that are never cached.
    #[serde(default)]
    pub link_expiration_secs: u64,
}

/// Entry in the memory tree.
#[derive(Debug, Clone)]
enum Entry {
    File {
        data: Vec<u8>,
        modified: SystemTime,
        created: SystemTime,
    },
    Directory {
        modified: SystemTime,
        created: SystemTime,
    },
}

impl Entry {
    fn directory() -> Self {
        let now = SystemTime::now();
        Entry::Directory {
            modified: now,
            created: now,
        }
    }

    fn file(data: Vec<u8>) -> Self {
        let now = SystemTime::now();
        Entry::File {
            data,
            modified: now,
            created: now,
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self, Entry::Directory { .. })
    }

    fn touch(&mut self) {
        match self {
            Entry::File { modified, .. } | Entry::Directory { modified, .. } => {
                *modified = SystemTime::now();
            }
        }
    }

    fn to_obj(&self, path: &str) -> Obj {
        let (_, name) = split(path);
        let name = if name.is_empty() { "root".to_string() } else { name };
        let object = match self {
            Entry::File {
                data,
                modified,
                created,
            } => Object::file(name, data.len() as u64)
                .with_modified(*modified)
                .with_created(*created),
            Entry::Directory { modified, created } => Object::folder(name)
                .with_modified(*modified)
                .with_created(*created),
        };
        Obj::new(object.with_id(path).with_path(path))
    }
}

/// In-memory storage driver.
///
/// Thread-safe via internal `RwLock`. Paths are storage-relative and `/`
/// always exists.
#[derive(Debug)]
pub struct MemoryDriver {
    entries: RwLock<BTreeMap<String, Entry>>,
    addition: MemoryAddition,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert("/".to_string(), Entry::directory());
        Self {
            entries: RwLock::new(entries),
            addition: MemoryAddition::default(),
        }
    }

    /// Create or replace a file, creating missing parent directories.
    pub fn insert_file(&self, path: &str, data: impl Into<Vec<u8>>) -> FsResult<Obj> {
        let path = fix_and_clean_path(path);
        let mut entries = self.write()?;
        Self::ensure_parents(&mut entries, &path)?;
        if entries.get(&path).is_some_and(Entry::is_dir) {
            return Err(FsError::AlreadyExists(path));
        }
        let entry = Entry::file(data.into());
        let obj = entry.to_obj(&path);
        entries.insert(path, entry);
        Ok(obj)
    }

    /// Create a directory and its missing parents.
    pub fn insert_dir(&self, path: &str) -> FsResult<Obj> {
        let path = fix_and_clean_path(path);
        let mut entries = self.write()?;
        Self::ensure_parents(&mut entries, &path)?;
        match entries.get(&path) {
            Some(e) if e.is_dir() => Ok(e.to_obj(&path)),
            Some(_) => Err(FsError::AlreadyExists(path)),
            None => {
                let entry = Entry::directory();
                let obj = entry.to_obj(&path);
                entries.insert(path, entry);
                Ok(obj)
            }
        }
    }

    /// Contents of a file.
    pub fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        let path = fix_and_clean_path(path);
        match self.read()?.get(&path) {
            Some(Entry::File { data, .. }) => Ok(data.clone()),
            Some(Entry::Directory { .. }) => Err(FsError::NotAFile(path)),
            None => Err(FsError::not_found(path)),
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.read()
            .map(|entries| entries.contains_key(&fix_and_clean_path(path)))
            .unwrap_or(false)
    }

    fn read(&self) -> FsResult<std::sync::RwLockReadGuard<'_, BTreeMap<String, Entry>>> {
        self.entries
            .read()
            .map_err(|_| FsError::backend_msg("lock poisoned"))
    }

    fn write(&self) -> FsResult<std::sync::RwLockWriteGuard<'_, BTreeMap<String, Entry>>> {
        self.entries
            .write()
            .map_err(|_| FsError::backend_msg("lock poisoned"))
    }

    fn ensure_parents(entries: &mut BTreeMap<String, Entry>, path: &str) -> FsResult<()> {
        let mut current = String::new();
        let (parent, _) = split(path);
        for segment in parent.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            match entries.get(&current) {
                Some(e) if !e.is_dir() => return Err(FsError::NotADirectory(current)),
                Some(_) => {}
                None => {
                    entries.insert(current.clone(), Entry::directory());
                }
            }
        }
        Ok(())
    }

    /// Keys of `path` and everything below it.
    fn subtree(entries: &BTreeMap<String, Entry>, path: &str) -> Vec<String> {
        entries
            .keys()
            .filter(|k| is_sub_path(path, k))
            .cloned()
            .collect()
    }

    /// Move the subtree at `from` to `to`, failing if `to` is taken.
    fn relocate(&self, from: &str, to: &str) -> FsResult<()> {
        if from == "/" {
            return Err(FsError::invalid_path("cannot move root"));
        }
        if is_sub_path(from, to) {
            return Err(FsError::invalid_path(format!("{to} is inside {from}")));
        }
        let mut entries = self.write()?;
        if !entries.contains_key(from) {
            return Err(FsError::not_found(from));
        }
        if entries.contains_key(to) {
            return Err(FsError::AlreadyExists(to.to_string()));
        }
        match entries.get(&dir(to)) {
            Some(e) if e.is_dir() => {}
            Some(_) => return Err(FsError::NotADirectory(dir(to))),
            None => return Err(FsError::not_found(dir(to))),
        }
        for key in Self::subtree(&entries, from) {
            if let Some(entry) = entries.remove(&key) {
                let moved = format!("{to}{}", &key[from.len()..]);
                entries.insert(moved, entry);
            }
        }
        if let Some(entry) = entries.get_mut(to) {
            entry.touch();
        }
        Ok(())
    }
}

#[async_trait]
impl Meta for MemoryDriver {
    fn config(&self) -> DriverConfig {
        DriverConfig {
            check_status: true,
            ..DriverConfig::new(NAME)
        }
    }

    fn addition_fields(&self) -> Vec<Item> {
        vec![
            Item::new("link_expiration_secs", TYPE_NUMBER)
                .default_value("0")
                .help("seconds a produced link may be reused, 0 disables reuse"),
        ]
    }

    fn addition(&self) -> FsResult<serde_json::Value> {
        encode_addition(&self.addition)
    }

    fn set_addition(&mut self, raw: &str) -> FsResult<()> {
        self.addition = decode_addition(raw)?;
        Ok(())
    }

    async fn init(&mut self, _record: &StorageRecord) -> FsResult<()> {
        Ok(())
    }
}

#[async_trait]
impl Reader for MemoryDriver {
    async fn list(&self, dir_obj: &Obj, _args: &ListArgs) -> FsResult<Vec<Obj>> {
        let path = fix_and_clean_path(dir_obj.path());
        let entries = self.read()?;
        match entries.get(&path) {
            Some(e) if e.is_dir() => {}
            Some(_) => return Err(FsError::NotADirectory(path)),
            None => return Err(FsError::not_found(path)),
        }
        Ok(entries
            .iter()
            .filter(|(k, _)| k.as_str() != path && dir(k) == path)
            .map(|(k, e)| e.to_obj(k))
            .collect())
    }

    async fn link(&self, file: &Obj, _args: &LinkArgs) -> FsResult<Link> {
        let path = fix_and_clean_path(file.path());
        let size = match self.read()?.get(&path) {
            Some(Entry::File { data, .. }) => data.len() as u64,
            Some(Entry::Directory { .. }) => return Err(FsError::NotAFile(path)),
            None => return Err(FsError::not_found(path)),
        };
        let link = Link::url(format!("{NAME}:{path}")).with_content_length(size);
        Ok(match self.addition.link_expiration_secs {
            0 => link,
            secs => link.with_expiration(Duration::from_secs(secs)),
        })
    }
}

#[async_trait]
impl RootGetter for MemoryDriver {
    async fn get_root(&self) -> FsResult<Obj> {
        self.read()?
            .get("/")
            .map(|e| e.to_obj("/"))
            .ok_or_else(|| FsError::not_found("/"))
    }
}

#[async_trait]
impl DirMaker for MemoryDriver {
    async fn make_dir(&self, parent: &Obj, name: &str) -> FsResult<()> {
        let path = join(parent.path(), name);
        let mut entries = self.write()?;
        if entries.contains_key(&path) {
            return Err(FsError::AlreadyExists(path));
        }
        match entries.get(parent.path()) {
            Some(e) if e.is_dir() => {}
            Some(_) => return Err(FsError::NotADirectory(parent.path().to_string())),
            None => return Err(FsError::not_found(parent.path())),
        }
        entries.insert(path, Entry::directory());
        Ok(())
    }
}

#[async_trait]
impl Mover for MemoryDriver {
    async fn move_obj(&self, src: &Obj, dst_dir: &Obj) -> FsResult<()> {
        self.relocate(src.path(), &join(dst_dir.path(), src.name()))
    }
}

#[async_trait]
impl Renamer for MemoryDriver {
    async fn rename(&self, src: &Obj, new_name: &str) -> FsResult<()> {
        self.relocate(src.path(), &join(&dir(src.path()), new_name))
    }
}

#[async_trait]
impl CopierResult for MemoryDriver {
    async fn copy(&self, src: &Obj, dst_dir: &Obj) -> FsResult<Option<Obj>> {
        let from = src.path();
        let to = join(dst_dir.path(), src.name());
        if is_sub_path(from, &to) {
            return Err(FsError::invalid_path(format!("{to} is inside {from}")));
        }
        let mut entries = self.write()?;
        if entries.contains_key(&to) {
            return Err(FsError::AlreadyExists(to));
        }
        if !entries.get(dst_dir.path()).is_some_and(Entry::is_dir) {
            return Err(FsError::NotADirectory(dst_dir.path().to_string()));
        }
        let keys = Self::subtree(&entries, from);
        if keys.is_empty() {
            return Err(FsError::not_found(from));
        }
        for key in keys {
            if let Some(entry) = entries.get(&key).cloned() {
                let mut entry = entry;
                entry.touch();
                entries.insert(format!("{to}{}", &key[from.len()..]), entry);
            }
        }
        Ok(entries.get(&to).map(|e| e.to_obj(&to)))
    }
}

#[async_trait]
impl Remover for MemoryDriver {
    async fn remove(&self, obj: &Obj) -> FsResult<()> {
        let path = fix_and_clean_path(obj.path());
        if path == "/" {
            return Err(FsError::invalid_path("cannot remove root"));
        }
        let mut entries = self.write()?;
        let keys = Self::subtree(&entries, &path);
        if keys.is_empty() {
            return Err(FsError::not_found(path));
        }
        for key in keys {
            entries.remove(&key);
        }
        Ok(())
    }
}

#[async_trait]
impl Putter for MemoryDriver {
    async fn put(
        &self,
        dst_dir: &Obj,
        file: &mut FileStream,
        progress: UpdateProgress,
    ) -> FsResult<()> {
        let data = file.read_all().await?;
        let path = join(dst_dir.path(), file.name());
        {
            let mut entries = self.write()?;
            if !entries.get(dst_dir.path()).is_some_and(Entry::is_dir) {
                return Err(FsError::NotADirectory(dst_dir.path().to_string()));
            }
            if entries.get(&path).is_some_and(Entry::is_dir) {
                return Err(FsError::AlreadyExists(path));
            }
            let mut entry = Entry::file(data);
            if let Entry::File { modified, .. } = &mut entry {
                *modified = file.modified();
            }
            entries.insert(path, entry);
        }
        progress(100.0);
        Ok(())
    }
}

#[async_trait]
impl OtherCaller for MemoryDriver {
    async fn other(&self, args: OtherArgs) -> FsResult<serde_json::Value> {
        let path = fix_and_clean_path(args.obj.path());
        match args.method.as_str() {
            "stat" => {
                let entries = self.read()?;
                let entry = entries.get(&path).ok_or_else(|| FsError::not_found(&path))?;
                Ok(serde_json::to_value(entry.to_obj(&path))?)
            }
            "touch" => {
                let mut entries = self.write()?;
                let entry = entries
                    .get_mut(&path)
                    .ok_or_else(|| FsError::not_found(&path))?;
                entry.touch();
                Ok(serde_json::Value::Null)
            }
            "read" => {
                let data = self.read_file(&path)?;
                Ok(serde_json::Value::String(
                    String::from_utf8_lossy(&data).into_owned(),
                ))
            }
            other => Err(FsError::unsupported(format!("memory other method {other}"))),
        }
    }
}

impl Driver for MemoryDriver {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn names(objs: &[Obj]) -> Vec<&str> {
        objs.iter().map(|o| o.name()).collect()
    }

    #[tokio::test]
    async fn test_list_children_only() {
        let driver = MemoryDriver::new();
        driver.insert_file("/a/b/c.txt", "hi").unwrap();
        driver.insert_file("/a/top.txt", "x").unwrap();

        let root = driver.get_root().await.unwrap();
        assert_eq!(names(&driver.list(&root, &ListArgs::default()).await.unwrap()), vec!["a"]);

        let a = Obj::new(Object::folder("a").with_path("/a"));
        let children = driver.list(&a, &ListArgs::default()).await.unwrap();
        assert_eq!(names(&children), vec!["b", "top.txt"]);
        assert_eq!(children[1].path(), "/a/top.txt");
        assert_eq!(children[1].size(), 1);
    }

    #[tokio::test]
    async fn test_rename_moves_subtree() {
        let driver = MemoryDriver::new();
        driver.insert_file("/d/inner/f", "1").unwrap();
        let d = Obj::new(Object::folder("d").with_path("/d"));
        Renamer::rename(&driver, &d, "e").await.unwrap();
        assert!(!driver.exists("/d"));
        assert_eq!(driver.read_file("/e/inner/f").unwrap(), b"1");
    }

    #[tokio::test]
    async fn test_copy_returns_new_object() {
        let driver = MemoryDriver::new();
        let src = driver.insert_file("/src/f", "data").unwrap();
        let dst = driver.insert_dir("/dst").unwrap();
        let copied = CopierResult::copy(&driver, &src, &dst).await.unwrap().unwrap();
        assert_eq!(copied.path(), "/dst/f");
        assert_eq!(driver.read_file("/src/f").unwrap(), b"data");
        assert!(CopierResult::copy(&driver, &src, &dst).await.is_err());
    }

    #[tokio::test]
    async fn test_move_into_own_subtree_rejected() {
        let driver = MemoryDriver::new();
        let d = driver.insert_dir("/d").unwrap();
        let inner = driver.insert_dir("/d/inner").unwrap();
        assert!(Mover::move_obj(&driver, &d, &inner).await.is_err());
    }

    #[tokio::test]
    async fn test_link_expiration_from_addition() {
        let mut driver = MemoryDriver::new();
        let file = driver.insert_file("/f", "abc").unwrap();
        let link = driver.link(&file, &LinkArgs::default()).await.unwrap();
        assert_eq!(link.url, "memory:/f");
        assert_eq!(link.content_length, Some(3));
        assert!(link.expiration.is_none());

        driver.set_addition(r#"{"link_expiration_secs":60}"#).unwrap();
        let link = driver.link(&file, &LinkArgs::default()).await.unwrap();
        assert_eq!(link.expiration, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_other_methods() {
        let driver = MemoryDriver::new();
        let file = driver.insert_file("/f", "abc").unwrap();
        let args = |method: &str| OtherArgs {
            obj: file.clone(),
            method: method.to_string(),
            data: serde_json::Value::Null,
        };
        let stat = driver.other(args("stat")).await.unwrap();
        assert_eq!(stat["size"], 3);
        assert_eq!(driver.other(args("read")).await.unwrap(), "abc");
        assert!(driver.other(args("nope")).await.is_err());
    }
}
