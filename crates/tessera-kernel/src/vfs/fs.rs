//! Virtual-path facade.
//!
//! [`FileSystem`] is what front ends talk to. It takes paths in the unified
//! namespace, resolves them to a storage and a storage-relative path, and
//! forwards to [`FsOps`]. Mount points without a storage of their own show
//! up as synthetic directories.

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{ErrorKind, FsError, FsResult};
use super::link::Link;
use super::ops::FsOps;
use super::path::{fix_and_clean_path, split};
use super::storage::{Storage, StorageManager};
use super::stream::{FileStream, UpdateProgress};
use super::types::{FsOtherArgs, LinkArgs, ListArgs, Obj, Object};

/// Log a failed facade call and hand the result back.
fn logged<T>(op: &str, path: &str, result: FsResult<T>) -> FsResult<T> {
    if let Err(e) = &result {
        match e.kind() {
            ErrorKind::NotFound | ErrorKind::Cancelled => debug!(op, path, error = %e, "fs call failed"),
            _ => warn!(op, path, error = %e, "fs call failed"),
        }
    }
    result
}

/// Unified namespace over every mounted storage.
#[derive(Debug, Clone)]
pub struct FileSystem {
    storages: Arc<StorageManager>,
    ops: Arc<FsOps>,
}

impl FileSystem {
    pub fn new(storages: Arc<StorageManager>, ops: Arc<FsOps>) -> Self {
        Self { storages, ops }
    }

    pub fn ops(&self) -> &Arc<FsOps> {
        &self.ops
    }

    /// Storage serving `path` and the path inside it.
    pub fn resolve(&self, path: &str) -> FsResult<(Arc<Storage>, String)> {
        self.storages.mounts().resolve(path)
    }

    pub async fn list(
        &self,
        path: &str,
        refresh: bool,
        cancel: &CancellationToken,
    ) -> FsResult<Vec<Obj>> {
        let path = fix_and_clean_path(path);
        logged("list", &path, self.list_inner(&path, refresh, cancel).await)
    }

    async fn list_inner(
        &self,
        path: &str,
        refresh: bool,
        cancel: &CancellationToken,
    ) -> FsResult<Vec<Obj>> {
        let virtual_files = self.storages.virtual_files_by_path(path);
        let (storage, actual) = match self.resolve(path) {
            Ok(resolved) => resolved,
            Err(_) if !virtual_files.is_empty() => return Ok(virtual_files),
            Err(e) => return Err(e),
        };
        let args = ListArgs {
            req_path: path.to_string(),
            refresh,
        };
        let files = match self.ops.list(&storage, &actual, args, cancel).await {
            Ok(files) => files,
            Err(e) if !virtual_files.is_empty() && !e.is_cancelled() => {
                debug!(path, error = %e, "storage listing failed, serving mount points only");
                return Ok(virtual_files);
            }
            Err(e) => return Err(e),
        };

        // Mount points shadow same-named storage entries
        let taken: HashSet<String> = virtual_files.iter().map(|f| f.name().to_string()).collect();
        let mut merged = virtual_files;
        merged.extend(files.into_iter().filter(|f| !taken.contains(f.name())));
        Ok(merged)
    }

    pub async fn get(&self, path: &str, cancel: &CancellationToken) -> FsResult<Obj> {
        let path = fix_and_clean_path(path);
        logged("get", &path, self.get_inner(&path, cancel).await)
    }

    async fn get_inner(&self, path: &str, cancel: &CancellationToken) -> FsResult<Obj> {
        if path != "/" {
            let (parent, name) = split(path);
            if let Some(found) = self
                .storages
                .virtual_files_by_path(&parent)
                .into_iter()
                .find(|f| f.name() == name)
            {
                return Ok(found);
            }
        }
        let (storage, actual) = match self.resolve(path) {
            Ok(resolved) => resolved,
            Err(_) if path == "/" => {
                return Ok(Obj::new(Object::folder("root").with_path("/")));
            }
            Err(e) => return Err(e),
        };
        self.ops.get(&storage, &actual, cancel).await
    }

    pub async fn make_dir(&self, path: &str, cancel: &CancellationToken) -> FsResult<()> {
        let path = fix_and_clean_path(path);
        let result = async {
            let (storage, actual) = self.resolve(&path)?;
            self.ops.make_dir(&storage, &actual, cancel).await
        }
        .await;
        logged("make_dir", &path, result)
    }

    /// Resolve both ends of a two-path operation onto one storage.
    fn resolve_pair(
        &self,
        src: &str,
        dst: &str,
        verb: &str,
    ) -> FsResult<(Arc<Storage>, String, String)> {
        let (storage, src_actual) = self.resolve(src)?;
        let (dst_storage, dst_actual) = self.storages.mounts().resolve_with(dst, &storage)?;
        if !Arc::ptr_eq(&storage, &dst_storage) {
            return Err(FsError::unsupported(format!(
                "can't {verb} files between two storages"
            )));
        }
        Ok((storage, src_actual, dst_actual))
    }

    pub async fn move_obj(
        &self,
        src_path: &str,
        dst_dir_path: &str,
        cancel: &CancellationToken,
    ) -> FsResult<()> {
        let src_path = fix_and_clean_path(src_path);
        let result = async {
            let (storage, src, dst) = self.resolve_pair(&src_path, dst_dir_path, "move")?;
            self.ops.move_obj(&storage, &src, &dst, cancel).await
        }
        .await;
        logged("move", &src_path, result)
    }

    pub async fn copy(
        &self,
        src_path: &str,
        dst_dir_path: &str,
        cancel: &CancellationToken,
    ) -> FsResult<()> {
        let src_path = fix_and_clean_path(src_path);
        let result = async {
            let (storage, src, dst) = self.resolve_pair(&src_path, dst_dir_path, "copy")?;
            self.ops.copy(&storage, &src, &dst, cancel).await
        }
        .await;
        logged("copy", &src_path, result)
    }

    pub async fn rename(
        &self,
        src_path: &str,
        new_name: &str,
        cancel: &CancellationToken,
    ) -> FsResult<()> {
        let src_path = fix_and_clean_path(src_path);
        let result = async {
            let (storage, actual) = self.resolve(&src_path)?;
            self.ops.rename(&storage, &actual, new_name, cancel).await
        }
        .await;
        logged("rename", &src_path, result)
    }

    pub async fn remove(&self, path: &str, cancel: &CancellationToken) -> FsResult<()> {
        let path = fix_and_clean_path(path);
        let result = async {
            let (storage, actual) = self.resolve(&path)?;
            self.ops.remove(&storage, &actual, cancel).await
        }
        .await;
        logged("remove", &path, result)
    }

    pub async fn put(
        &self,
        dst_dir_path: &str,
        file: FileStream,
        progress: Option<UpdateProgress>,
        cancel: &CancellationToken,
    ) -> FsResult<()> {
        let dst_dir_path = fix_and_clean_path(dst_dir_path);
        let result = async {
            let (storage, actual) = self.resolve(&dst_dir_path)?;
            if storage.config().no_upload {
                return Err(FsError::unsupported(format!(
                    "upload forbidden on {}",
                    storage.mount_path()
                )));
            }
            self.ops.put(&storage, &actual, file, progress, cancel).await
        }
        .await;
        logged("put", &dst_dir_path, result)
    }

    /// Download link for a file; release the link when done with it.
    pub async fn link(
        &self,
        path: &str,
        args: LinkArgs,
        cancel: &CancellationToken,
    ) -> FsResult<(Arc<Link>, Obj)> {
        let path = fix_and_clean_path(path);
        let result = async {
            let (storage, actual) = self.resolve(&path)?;
            self.ops.link(&storage, &actual, args, cancel).await
        }
        .await;
        logged("link", &path, result)
    }

    pub async fn other(
        &self,
        args: FsOtherArgs,
        cancel: &CancellationToken,
    ) -> FsResult<serde_json::Value> {
        let path = fix_and_clean_path(&args.path);
        let result = async {
            let (storage, actual) = self.resolve(&path)?;
            let args = FsOtherArgs {
                path: actual,
                ..args
            };
            self.ops.other(&storage, args, cancel).await
        }
        .await;
        logged("other", &path, result)
    }

    /// Drop cached listings at and below a virtual path.
    pub fn clear_cache(&self, path: &str) -> FsResult<()> {
        let (storage, actual) = self.resolve(path)?;
        self.ops.clear_cache(&storage, &actual);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::drivers::{memory, register_builtin};
    use crate::vfs::hooks::Hooks;
    use crate::vfs::record::StorageRecord;
    use crate::vfs::registry::DriverRegistry;
    use crate::vfs::repository::MemoryStorageRepository;
    use crate::vfs::types::NameMapper;

    async fn fs_with(mounts: &[&str]) -> FileSystem {
        let drivers = Arc::new(DriverRegistry::new());
        register_builtin(&drivers).unwrap();
        let hooks = Arc::new(Hooks::new());
        let storages = Arc::new(StorageManager::new(
            drivers,
            Arc::new(MemoryStorageRepository::new()),
            Arc::clone(&hooks),
        ));
        for mount in mounts {
            storages
                .create(StorageRecord::new(*mount, memory::NAME))
                .await
                .unwrap();
        }
        FileSystem::new(storages, Arc::new(FsOps::new(hooks, NameMapper::default())))
    }

    fn names(objs: &[Obj]) -> Vec<&str> {
        objs.iter().map(|o| o.name()).collect()
    }

    #[tokio::test]
    async fn test_mount_points_show_as_directories() {
        let fs = fs_with(&["/a/x", "/b"]).await;
        let cancel = CancellationToken::new();

        let root = fs.list("/", false, &cancel).await.unwrap();
        assert_eq!(names(&root), vec!["a", "b"]);
        assert!(root.iter().all(|o| o.is_dir()));
        assert_eq!(names(&fs.list("/a", false, &cancel).await.unwrap()), vec!["x"]);

        let a = fs.get("/a", &cancel).await.unwrap();
        assert!(a.is_dir());
        assert_eq!(a.path(), "/a");
        assert_eq!(fs.get("/", &cancel).await.unwrap().name(), "root");

        assert!(fs.list("/zzz", false, &cancel).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_mount_points_shadow_storage_entries() {
        let fs = fs_with(&["/", "/m"]).await;
        let cancel = CancellationToken::new();
        let (root_storage, _) = fs.resolve("/").unwrap();
        fs.ops().make_dir(&root_storage, "/m", &cancel).await.unwrap();
        fs.put("/", FileStream::from_bytes("f.txt", b"f".to_vec()), None, &cancel)
            .await
            .unwrap();

        let root = fs.list("/", false, &cancel).await.unwrap();
        assert_eq!(names(&root), vec!["m", "f.txt"]);
    }

    #[tokio::test]
    async fn test_put_get_and_link_through_mount() {
        let fs = fs_with(&["/b"]).await;
        let cancel = CancellationToken::new();
        fs.put("/b/docs", FileStream::from_bytes("f.txt", b"hello".to_vec()), None, &cancel)
            .await
            .unwrap();

        let obj = fs.get("/b/docs/f.txt", &cancel).await.unwrap();
        assert_eq!(obj.size(), 5);
        // Storage-relative path, the mount prefix is the caller's business
        assert_eq!(obj.path(), "/docs/f.txt");

        let (link, _) = fs.link("/b/docs/f.txt", LinkArgs::default(), &cancel).await.unwrap();
        assert_eq!(link.url, "memory:/docs/f.txt");
        link.release().unwrap();

        let stat = fs
            .other(
                FsOtherArgs {
                    path: "/b/docs/f.txt".into(),
                    method: "read".into(),
                    data: serde_json::Value::Null,
                },
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(stat, "hello");
    }

    #[tokio::test]
    async fn test_cross_storage_move_refused() {
        let fs = fs_with(&["/a", "/b"]).await;
        let cancel = CancellationToken::new();
        fs.put("/a", FileStream::from_bytes("f.txt", b"f".to_vec()), None, &cancel)
            .await
            .unwrap();
        fs.make_dir("/b/dst", &cancel).await.unwrap();

        let err = fs.move_obj("/a/f.txt", "/b/dst", &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        let err = fs.copy("/a/f.txt", "/b/dst", &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);

        fs.make_dir("/a/dst", &cancel).await.unwrap();
        fs.move_obj("/a/f.txt", "/a/dst", &cancel).await.unwrap();
        assert!(fs.get("/a/dst/f.txt", &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_rename_remove_and_clear_cache() {
        let fs = fs_with(&["/b"]).await;
        let cancel = CancellationToken::new();
        fs.put("/b", FileStream::from_bytes("f.txt", b"f".to_vec()), None, &cancel)
            .await
            .unwrap();
        fs.rename("/b/f.txt", "g.txt", &cancel).await.unwrap();
        assert_eq!(names(&fs.list("/b", false, &cancel).await.unwrap()), vec!["g.txt"]);

        fs.remove("/b/g.txt", &cancel).await.unwrap();
        assert!(fs.list("/b", false, &cancel).await.unwrap().is_empty());
        fs.clear_cache("/b").unwrap();
        assert!(fs.clear_cache("/nowhere").is_err());
    }

    #[tokio::test]
    async fn test_upload_refused_on_read_only_storage() {
        let fs = fs_with(&["/target"]).await;
        let cancel = CancellationToken::new();
        let record = StorageRecord::new("/alias", "alias").with_remark("ref:/target");
        fs.storages.create(record).await.unwrap();

        let err = fs
            .put("/alias", FileStream::from_bytes("f.txt", b"f".to_vec()), None, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }
}
