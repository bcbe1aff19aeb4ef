//! Local filesystem driver.
//!
//! Serves a directory of the host filesystem. Object paths are relative to
//! the configured root folder, and path security keeps every operation
//! inside it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::vfs::driver::{
    Capabilities, Copier, DirMakerResult, Driver, DriverConfig, Getter, Item, Meta,
    MoverResult, PutterResult, Reader, Remover, RenamerResult, RootLocator, TYPE_BOOL,
    TYPE_STRING, decode_addition, encode_addition,
};
use crate::vfs::error::{FsError, FsResult};
use crate::vfs::link::Link;
use crate::vfs::path::{dir, fix_and_clean_path, join};
use crate::vfs::record::StorageRecord;
use crate::vfs::stream::{FileStream, UpdateProgress};
use crate::vfs::types::{LinkArgs, ListArgs, Obj, Object};

pub const NAME: &str = "local";

const COPY_BUF_SIZE: usize = 64 * 1024;

fn default_true() -> bool {
    true
}

/// Addition payload of the local driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAddition {
    #[serde(default)]
    pub root_folder_path: String,
    #[serde(default = "default_true")]
    pub show_hidden: bool,
}

impl Default for LocalAddition {
    fn default() -> Self {
        Self {
            root_folder_path: String::new(),
            show_hidden: true,
        }
    }
}

/// Local filesystem driver.
///
/// All operations are relative to the root folder. For example, if the
/// root is `/srv/share`, the object `/docs/a.txt` is
/// `/srv/share/docs/a.txt` on the host.
#[derive(Debug, Clone, Default)]
pub struct LocalDriver {
    addition: LocalAddition,
    /// Canonical root, set by `init`.
    root: PathBuf,
}

impl LocalDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the canonical root path.
    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// Resolve a storage-relative path to a host path within the root.
    ///
    /// Returns an error if the path escapes the root, including through
    /// symlinks.
    fn resolve(&self, path: &str) -> FsResult<PathBuf> {
        let clean = fix_and_clean_path(path);
        let relative = clean.trim_start_matches('/');
        if relative.is_empty() {
            return Ok(self.root.clone());
        }
        let full = self.root.join(relative);

        // Canonicalize what exists; for new entries check the parent
        let canonical = if full.exists() {
            dunce::canonicalize(&full)?
        } else {
            let parent = full
                .parent()
                .ok_or_else(|| FsError::invalid_path("no parent"))?;
            let filename = full
                .file_name()
                .ok_or_else(|| FsError::invalid_path("no filename"))?;
            if parent.exists() {
                dunce::canonicalize(parent)?.join(filename)
            } else {
                full.clone()
            }
        };

        if !canonical.starts_with(&self.root) {
            return Err(FsError::invalid_path(format!(
                "{} is not under {}",
                canonical.display(),
                self.root.display()
            )));
        }
        // Keep the link itself, not its target, so removal and rename act on it
        Ok(full)
    }

    fn to_obj(path: &str, meta: &std::fs::Metadata) -> Obj {
        let path = fix_and_clean_path(path);
        let name = match path.rsplit('/').next() {
            Some("") | None => "root".to_string(),
            Some(name) => name.to_string(),
        };
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let object = if meta.is_dir() {
            Object::folder(name)
        } else {
            Object::file(name, meta.len())
        };
        let object = object.with_path(path).with_modified(modified);
        match meta.created() {
            Ok(created) => Obj::new(object.with_created(created)),
            Err(_) => Obj::new(object),
        }
    }

    async fn stat(&self, path: &str) -> FsResult<Obj> {
        let full = self.resolve(path)?;
        let meta = fs::metadata(&full).await?;
        Ok(Self::to_obj(path, &meta))
    }
}

fn copy_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    if from.is_dir() {
        std::fs::create_dir(to)?;
        for entry in std::fs::read_dir(from)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        std::fs::copy(from, to).map(|_| ())
    }
}

#[async_trait]
impl Meta for LocalDriver {
    fn config(&self) -> DriverConfig {
        DriverConfig {
            local_sort: true,
            only_link_mfile: true,
            default_root: "/".to_string(),
            ..DriverConfig::new(NAME)
        }
    }

    fn addition_fields(&self) -> Vec<Item> {
        vec![
            Item::new("root_folder_path", TYPE_STRING)
                .required()
                .help("absolute host directory to serve"),
            Item::new("show_hidden", TYPE_BOOL)
                .default_value("true")
                .help("list dot files"),
        ]
    }

    fn addition(&self) -> FsResult<serde_json::Value> {
        encode_addition(&self.addition)
    }

    fn set_addition(&mut self, raw: &str) -> FsResult<()> {
        self.addition = decode_addition(raw)?;
        Ok(())
    }

    fn root(&self) -> Option<RootLocator> {
        Some(RootLocator::Path(self.addition.root_folder_path.clone()))
    }

    async fn init(&mut self, _record: &StorageRecord) -> FsResult<()> {
        let root = Path::new(&self.addition.root_folder_path);
        if !root.is_absolute() {
            return Err(FsError::config(format!(
                "root folder must be an absolute path: {:?}",
                self.addition.root_folder_path
            )));
        }
        let meta = fs::metadata(root).await?;
        if !meta.is_dir() {
            return Err(FsError::NotADirectory(
                self.addition.root_folder_path.clone(),
            ));
        }
        // Canonicalize to handle symlinks (e.g. macOS /tmp -> /private/tmp)
        self.root = dunce::canonicalize(root)?;
        Ok(())
    }
}

#[async_trait]
impl Reader for LocalDriver {
    async fn list(&self, dir_obj: &Obj, _args: &ListArgs) -> FsResult<Vec<Obj>> {
        let full = self.resolve(dir_obj.path())?;
        let mut entries = fs::read_dir(&full).await?;
        let mut objs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !self.addition.show_hidden && name.starts_with('.') {
                continue;
            }
            // Follow symlinks; skip dangling ones
            let Ok(meta) = fs::metadata(entry.path()).await else {
                continue;
            };
            objs.push(Self::to_obj(&join(dir_obj.path(), &name), &meta));
        }
        objs.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(objs)
    }

    async fn link(&self, file: &Obj, _args: &LinkArgs) -> FsResult<Link> {
        let full = self.resolve(file.path())?;
        let handle = fs::File::open(&full).await?;
        let len = handle.metadata().await?.len();
        Ok(Link::file(handle).with_content_length(len))
    }
}

#[async_trait]
impl Getter for LocalDriver {
    async fn get(&self, path: &str) -> FsResult<Obj> {
        self.stat(path).await
    }
}

#[async_trait]
impl DirMakerResult for LocalDriver {
    async fn make_dir(&self, parent: &Obj, name: &str) -> FsResult<Option<Obj>> {
        let path = join(parent.path(), name);
        fs::create_dir(self.resolve(&path)?).await?;
        Ok(Some(self.stat(&path).await?))
    }
}

#[async_trait]
impl MoverResult for LocalDriver {
    async fn move_obj(&self, src: &Obj, dst_dir: &Obj) -> FsResult<Option<Obj>> {
        let to = join(dst_dir.path(), src.name());
        let to_full = self.resolve(&to)?;
        if fs::try_exists(&to_full).await? {
            return Err(FsError::AlreadyExists(to));
        }
        fs::rename(self.resolve(src.path())?, to_full).await?;
        Ok(Some(self.stat(&to).await?))
    }
}

#[async_trait]
impl RenamerResult for LocalDriver {
    async fn rename(&self, src: &Obj, new_name: &str) -> FsResult<Option<Obj>> {
        let to = join(&dir(src.path()), new_name);
        let to_full = self.resolve(&to)?;
        if fs::try_exists(&to_full).await? {
            return Err(FsError::AlreadyExists(to));
        }
        fs::rename(self.resolve(src.path())?, to_full).await?;
        Ok(Some(self.stat(&to).await?))
    }
}

#[async_trait]
impl Copier for LocalDriver {
    async fn copy(&self, src: &Obj, dst_dir: &Obj) -> FsResult<()> {
        let from = self.resolve(src.path())?;
        let to = self.resolve(&join(dst_dir.path(), src.name()))?;
        if to.starts_with(&from) {
            return Err(FsError::invalid_path(format!(
                "{} is inside {}",
                to.display(),
                from.display()
            )));
        }
        if fs::try_exists(&to).await? {
            return Err(FsError::AlreadyExists(join(dst_dir.path(), src.name())));
        }
        tokio::task::spawn_blocking(move || copy_recursive(&from, &to))
            .await
            .map_err(FsError::backend)??;
        Ok(())
    }
}

#[async_trait]
impl Remover for LocalDriver {
    async fn remove(&self, obj: &Obj) -> FsResult<()> {
        let full = self.resolve(obj.path())?;
        if full == self.root {
            return Err(FsError::invalid_path("cannot remove root"));
        }
        if fs::symlink_metadata(&full).await?.is_dir() {
            fs::remove_dir_all(&full).await?;
        } else {
            fs::remove_file(&full).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PutterResult for LocalDriver {
    async fn put(
        &self,
        dst_dir: &Obj,
        file: &mut FileStream,
        progress: UpdateProgress,
    ) -> FsResult<Option<Obj>> {
        let path = join(dst_dir.path(), file.name());
        let full = self.resolve(&path)?;
        let total = file.size();
        let mut out = fs::File::create(&full).await?;
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut written: u64 = 0;
        let copied = async {
            let reader = file.reader()?;
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n]).await?;
                written += n as u64;
                if total > 0 {
                    progress(written as f64 * 100.0 / total as f64);
                }
            }
            out.flush().await?;
            Ok::<_, FsError>(())
        }
        .await;
        if let Err(e) = copied {
            drop(out);
            let _ = fs::remove_file(&full).await;
            return Err(e);
        }
        let std_file = out.into_std().await;
        if let Err(e) = std_file.set_modified(file.modified()) {
            tracing::debug!(%path, error = %e, "failed to set mtime");
        }
        progress(100.0);
        Ok(Some(self.stat(&path).await?))
    }
}

impl Driver for LocalDriver {
    fn capabilities(&self) -> Capabilities<'_> {
        Capabilities::new()
            .getter(self)
            .mkdir_result(self)
            .mover_result(self)
            .renamer_result(self)
            .copier(self)
            .remover(self)
            .putter_result(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (LocalDriver, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut driver = LocalDriver::new();
        let addition = serde_json::json!({ "root_folder_path": dir.path() }).to_string();
        driver.set_addition(&addition).unwrap();
        driver
            .init(&StorageRecord::new("/local", NAME))
            .await
            .unwrap();
        (driver, dir)
    }

    #[test]
    fn test_root_folder_path_is_required() {
        let fields = LocalDriver::new().addition_fields();
        let root = fields.iter().find(|i| i.name == "root_folder_path").unwrap();
        assert!(root.required);

        let registry = crate::vfs::DriverRegistry::new();
        registry.register(|| Box::new(LocalDriver::new())).unwrap();
        let info = registry.info(NAME).unwrap();
        let root = info
            .additional
            .iter()
            .find(|i| i.name == "root_folder_path")
            .unwrap();
        assert!(root.required);
        assert_eq!(root.default, "/");
    }

    #[tokio::test]
    async fn test_init_requires_absolute_root() {
        let mut driver = LocalDriver::new();
        driver.set_addition(r#"{"root_folder_path":"relative"}"#).unwrap();
        let err = driver
            .init(&StorageRecord::new("/local", NAME))
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::Config(_)));
    }

    #[tokio::test]
    async fn test_list_and_get() {
        let (driver, dir) = setup().await;
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/file.txt"), "hello").unwrap();
        std::fs::write(dir.path().join("root.txt"), "x").unwrap();

        let root = driver.get("/").await.unwrap();
        assert!(root.is_dir());
        let names: Vec<String> = driver
            .list(&root, &ListArgs::default())
            .await
            .unwrap()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        assert_eq!(names, vec!["root.txt", "sub"]);

        let file = driver.get("/sub/file.txt").await.unwrap();
        assert_eq!(file.size(), 5);
        assert_eq!(file.path(), "/sub/file.txt");
    }

    #[tokio::test]
    async fn test_hidden_files() {
        let (mut driver, dir) = setup().await;
        std::fs::write(dir.path().join(".hidden"), "").unwrap();
        let root = driver.get("/").await.unwrap();
        assert_eq!(driver.list(&root, &ListArgs::default()).await.unwrap().len(), 1);

        driver.addition.show_hidden = false;
        assert!(driver.list(&root, &ListArgs::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_and_link() {
        let (driver, dir) = setup().await;
        let root = driver.get("/").await.unwrap();
        let mut stream = FileStream::from_bytes("up.bin", b"payload".to_vec());
        let obj = PutterResult::put(&driver, &root, &mut stream, crate::vfs::stream::no_progress())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(obj.size(), 7);
        assert_eq!(std::fs::read(dir.path().join("up.bin")).unwrap(), b"payload");

        let link = driver.link(&obj, &LinkArgs::default()).await.unwrap();
        assert!(!link.is_shareable());
        assert_eq!(link.content_length, Some(7));
    }

    #[tokio::test]
    async fn test_rename_refuses_existing_target() {
        let (driver, dir) = setup().await;
        std::fs::write(dir.path().join("a"), "1").unwrap();
        std::fs::write(dir.path().join("b"), "2").unwrap();
        let a = driver.get("/a").await.unwrap();
        let err = RenamerResult::rename(&driver, &a, "b").await.unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists(_)));

        let renamed = RenamerResult::rename(&driver, &a, "c").await.unwrap().unwrap();
        assert_eq!(renamed.path(), "/c");
    }

    #[tokio::test]
    async fn test_copy_directory() {
        let (driver, dir) = setup().await;
        std::fs::create_dir_all(dir.path().join("src/deep")).unwrap();
        std::fs::write(dir.path().join("src/deep/f"), "data").unwrap();
        std::fs::create_dir(dir.path().join("dst")).unwrap();

        let src = driver.get("/src").await.unwrap();
        let dst = driver.get("/dst").await.unwrap();
        Copier::copy(&driver, &src, &dst).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("dst/src/deep/f")).unwrap(),
            "data"
        );
        // Copying a directory into itself is refused
        let deep = driver.get("/src/deep").await.unwrap();
        assert!(Copier::copy(&driver, &src, &deep).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_blocked() {
        let (driver, dir) = setup().await;
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), "s").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();

        let err = driver.get("/escape/secret").await.unwrap_err();
        assert!(matches!(err, FsError::InvalidPath(_)));
    }
}
