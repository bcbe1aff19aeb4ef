//! Storage operations with caching and request coalescing.
//!
//! [`FsOps`] takes a resolved storage and a storage-relative path. Reads go
//! through the listing cache and a per-directory coalescing gate; mutations
//! dispatch to whichever capability the driver offers and then patch or
//! invalidate the cached listings they touch. Link handles are reference
//! counted and shared between concurrent callers when the driver allows it.

use std::future::Future;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::cache::{ListCache, TtlCache};
use super::driver::{Dispatch, RootLocator};
use super::error::{FsError, FsResult, FsResultExt};
use super::link::Link;
use super::path::{dir, fix_and_clean_path, full_path, join, path_equal, split};
use super::singleflight::Group;
use super::hooks::Hooks;
use super::storage::Storage;
use super::stream::{FileStream, UpdateProgress, no_progress};
use super::types::{
    FsOtherArgs, LinkArgs, ListArgs, NameMapper, Obj, Object, OtherArgs, extract_folder,
    sort_objs,
};

/// Suffix of the sidecar an existing file is renamed to during a
/// no-overwrite upload.
pub const TEMP_UPLOAD_SUFFIX: &str = ".tessera_to_delete";

/// Outcome of a coalesced link fetch.
#[derive(Clone)]
enum LinkShare {
    /// Shareable link, handed to every caller on the key.
    Shared(Arc<Link>),
    /// The link held a private file handle and went to the leader only.
    Exclusive,
}

impl LinkShare {
    fn is_shared(&self) -> bool {
        matches!(self, LinkShare::Shared(_))
    }
}

/// Run `fut` unless `cancel` fires first.
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = FsResult<T>>,
) -> FsResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(FsError::Cancelled),
        result = fut => result,
    }
}

fn cache_key(storage: &Storage, path: &str) -> String {
    join(storage.mount_path(), path)
}

/// Cached, coalesced storage operations.
pub struct FsOps {
    list_cache: ListCache,
    list_group: Group<Vec<Obj>>,
    mkdir_group: Group<()>,
    link_cache: TtlCache<Arc<Link>>,
    link_group: Arc<Group<LinkShare>>,
    hooks: Arc<Hooks>,
    names: NameMapper,
}

impl FsOps {
    pub fn new(hooks: Arc<Hooks>, names: NameMapper) -> Self {
        Self {
            list_cache: ListCache::new(),
            list_group: Group::new(),
            mkdir_group: Group::new(),
            link_cache: TtlCache::new(),
            link_group: Arc::new(Group::remembering(LinkShare::is_shared)),
            hooks,
            names,
        }
    }

    pub fn list_cache(&self) -> &ListCache {
        &self.list_cache
    }

    // ========================================================================
    // Cache maintenance
    // ========================================================================

    /// Drop the cached listing of `path` and everything cached below it.
    pub fn clear_cache(&self, storage: &Storage, path: &str) {
        self.list_cache
            .clear_recursive(&cache_key(storage, &fix_and_clean_path(path)));
    }

    /// Drop the cached listing of `path` only.
    pub fn delete_cache(&self, storage: &Storage, path: &str) {
        self.list_cache
            .del(&cache_key(storage, &fix_and_clean_path(path)));
    }

    /// Forget every listing and link cached for a mount path.
    pub fn purge_mount(&self, mount_path: &str) {
        self.list_cache.remove_prefix(mount_path);
        let below = format!("{}/", mount_path.trim_end_matches('/'));
        let under = |k: &str| k == mount_path || k.starts_with(&below);
        self.link_cache.retain(|k| !under(k));
        self.link_group.forget_matching(under);
    }

    fn add_cache_obj(&self, storage: &Storage, dir_path: &str, obj: Obj) {
        self.list_cache
            .add_obj(&cache_key(storage, dir_path), obj, storage.cache_ttl());
    }

    fn update_cache_obj(&self, storage: &Storage, dir_path: &str, old: &Obj, new: Obj) {
        self.list_cache.update_obj(
            &cache_key(storage, dir_path),
            old.name(),
            new,
            storage.cache_ttl(),
        );
    }

    fn del_cache_obj(&self, storage: &Storage, dir_path: &str, obj: &Obj) {
        self.list_cache
            .del_obj(&cache_key(storage, dir_path), obj.name(), storage.cache_ttl());
    }

    /// Stamp the path under `dir_path` and apply the display-name table.
    fn present(&self, obj: Obj, dir_path: &str) -> Obj {
        let path = join(dir_path, obj.name());
        self.names.wrap(obj.with_path(path))
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Look up one object.
    pub async fn get(
        &self,
        storage: &Arc<Storage>,
        path: &str,
        cancel: &CancellationToken,
    ) -> FsResult<Obj> {
        let path = fix_and_clean_path(path);
        let caps = storage.capabilities();
        if let Some(getter) = caps.getter {
            match cancellable(cancel, getter.get(&path)).await {
                Ok(obj) => return Ok(self.names.wrap(obj)),
                Err(FsError::Cancelled) => return Err(FsError::Cancelled),
                Err(e) => debug!(%path, error = %e, "getter failed, falling back to listing"),
            }
        }

        if path == "/" {
            let root = match caps.root {
                Some(root) => cancellable(cancel, root.get_root())
                    .await
                    .context("failed get root obj", &path)?,
                None => match storage.driver().root() {
                    Some(RootLocator::Id(id)) => Obj::new(
                        Object::folder("root")
                            .with_id(id)
                            .with_path("/")
                            .with_modified(storage.record().modified),
                    ),
                    // Drivers address objects relative to their root
                    Some(RootLocator::Path(_)) => Obj::new(
                        Object::folder("root")
                            .with_path("/")
                            .with_modified(storage.record().modified),
                    ),
                    None => {
                        return Err(FsError::unsupported(
                            "please implement a root getter or declare a root path or id",
                        ));
                    }
                },
            };
            return Ok(Obj::named("root", root));
        }

        let (parent, name) = split(&path);
        let files = self
            .list_boxed(storage, parent.clone(), ListArgs::default(), cancel)
            .await
            .context("failed get parent list", &path)?;
        files
            .into_iter()
            .find(|f| f.name() == name)
            .ok_or_else(|| FsError::not_found(path.clone()))
    }

    /// Look up one object and strip any display-name wrapper.
    pub async fn get_unwrap(
        &self,
        storage: &Arc<Storage>,
        path: &str,
        cancel: &CancellationToken,
    ) -> FsResult<Obj> {
        Ok(self.get(storage, path, cancel).await?.unwrapped())
    }

    fn list_boxed<'a>(
        &'a self,
        storage: &'a Arc<Storage>,
        path: String,
        args: ListArgs,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, FsResult<Vec<Obj>>> {
        Box::pin(async move { self.list(storage, &path, args, cancel).await })
    }

    /// List a directory.
    pub async fn list(
        &self,
        storage: &Arc<Storage>,
        path: &str,
        args: ListArgs,
        cancel: &CancellationToken,
    ) -> FsResult<Vec<Obj>> {
        storage.check_status()?;
        let path = fix_and_clean_path(path);
        let key = cache_key(storage, &path);
        if !args.refresh {
            if let Some(files) = self.list_cache.get(&key) {
                debug!(%key, "list cache hit");
                return Ok(files);
            }
        }

        let dir_obj = self
            .get_unwrap(storage, &path, cancel)
            .await
            .context("failed get dir", &path)?;
        debug!(%key, "list cache miss");
        if !dir_obj.is_dir() {
            return Err(FsError::NotADirectory(path));
        }

        cancellable(
            cancel,
            self.list_group
                .work(&key, || self.list_uncached(storage, &path, &key, &dir_obj, &args)),
        )
        .await
    }

    async fn list_uncached(
        &self,
        storage: &Arc<Storage>,
        path: &str,
        key: &str,
        dir_obj: &Obj,
        args: &ListArgs,
    ) -> FsResult<Vec<Obj>> {
        let files = storage
            .driver()
            .list(dir_obj, args)
            .await
            .context("failed to list objs", path)?;

        // Cached objects are handed back to drivers, so they keep
        // storage-relative paths whatever the request path was
        let mut files: Vec<Obj> = files.into_iter().map(|f| self.present(f, path)).collect();

        let record = storage.record();
        if storage.config().local_sort {
            sort_objs(&mut files, &record.sort.order_by, &record.sort.order_direction);
        }
        extract_folder(&mut files, &record.sort.extract_folder);

        self.hooks
            .spawn_objs_update(full_path(storage.mount_path(), path), files.clone());

        if !storage.config().no_cache {
            if files.is_empty() {
                self.list_cache.del(key);
            } else {
                self.list_cache.set(key, files.clone(), storage.cache_ttl());
            }
        }
        Ok(files)
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Ensure a directory exists, creating missing parents.
    pub async fn make_dir(
        &self,
        storage: &Arc<Storage>,
        path: &str,
        cancel: &CancellationToken,
    ) -> FsResult<()> {
        storage.check_status()?;
        let path = fix_and_clean_path(path);
        let key = cache_key(storage, &path);
        cancellable(
            cancel,
            self.mkdir_group
                .work(&key, || self.make_dir_uncoalesced(storage, &path, cancel)),
        )
        .await
    }

    fn make_dir_boxed<'a>(
        &'a self,
        storage: &'a Arc<Storage>,
        path: String,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, FsResult<()>> {
        Box::pin(async move { self.make_dir(storage, &path, cancel).await })
    }

    async fn make_dir_uncoalesced(
        &self,
        storage: &Arc<Storage>,
        path: &str,
        cancel: &CancellationToken,
    ) -> FsResult<()> {
        match self.get_unwrap(storage, path, cancel).await {
            Ok(obj) if obj.is_dir() => return Ok(()),
            Ok(_) => return Err(FsError::AlreadyExists(format!("file exists: {path}"))),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.context("failed to check if dir exists", path)),
        }

        let (parent, name) = split(path);
        self.make_dir_boxed(storage, parent.clone(), cancel)
            .await
            .context("failed to make parent dir", &parent)?;
        let parent_obj = self
            .get_unwrap(storage, &parent, cancel)
            .await
            .context("failed to get parent dir", &parent)?;

        match storage.capabilities().dispatch_mkdir() {
            Some(Dispatch::WithResult(maker)) => {
                let created = maker
                    .make_dir(&parent_obj, &name)
                    .await
                    .context("failed to make dir", path)?;
                match created {
                    Some(obj) => self.add_cache_obj(storage, &parent, self.present(obj, &parent)),
                    None => self.delete_cache(storage, &parent),
                }
            }
            Some(Dispatch::Plain(maker)) => {
                maker
                    .make_dir(&parent_obj, &name)
                    .await
                    .context("failed to make dir", path)?;
                self.delete_cache(storage, &parent);
            }
            None => return Err(FsError::unsupported("make dir")),
        }
        debug!(%path, mount_path = storage.mount_path(), "dir created");
        Ok(())
    }

    /// Move `src_path` into the directory `dst_dir_path`.
    pub async fn move_obj(
        &self,
        storage: &Arc<Storage>,
        src_path: &str,
        dst_dir_path: &str,
        cancel: &CancellationToken,
    ) -> FsResult<()> {
        storage.check_status()?;
        let src_path = fix_and_clean_path(src_path);
        let dst_dir_path = fix_and_clean_path(dst_dir_path);
        let src_raw = self
            .get(storage, &src_path, cancel)
            .await
            .context("failed to get src object", &src_path)?;
        let src_obj = src_raw.unwrapped();
        let dst_dir = self
            .get_unwrap(storage, &dst_dir_path, cancel)
            .await
            .context("failed to get dst dir", &dst_dir_path)?;
        let src_dir = dir(&src_path);

        match storage.capabilities().dispatch_move() {
            Some(Dispatch::WithResult(mover)) => {
                let moved = cancellable(cancel, mover.move_obj(&src_obj, &dst_dir))
                    .await
                    .context("failed to move", &src_path)?;
                self.del_cache_obj(storage, &src_dir, &src_raw);
                match moved {
                    Some(obj) => {
                        self.add_cache_obj(storage, &dst_dir_path, self.present(obj, &dst_dir_path))
                    }
                    None => self.delete_cache(storage, &dst_dir_path),
                }
            }
            Some(Dispatch::Plain(mover)) => {
                cancellable(cancel, mover.move_obj(&src_obj, &dst_dir))
                    .await
                    .context("failed to move", &src_path)?;
                self.del_cache_obj(storage, &src_dir, &src_raw);
                self.delete_cache(storage, &dst_dir_path);
            }
            None => return Err(FsError::unsupported("move")),
        }
        self.forget_links(storage, &src_path);
        self.forget_obj_links(storage, &dst_dir_path, &src_raw);
        if src_obj.is_dir() {
            self.clear_cache(storage, &src_path);
        }
        Ok(())
    }

    /// Rename the object at `src_path` within its directory.
    pub async fn rename(
        &self,
        storage: &Arc<Storage>,
        src_path: &str,
        new_name: &str,
        cancel: &CancellationToken,
    ) -> FsResult<()> {
        storage.check_status()?;
        let src_path = fix_and_clean_path(src_path);
        if new_name.is_empty() || new_name.contains('/') {
            return Err(FsError::invalid_path(format!("bad new name: {new_name}")));
        }
        let src_raw = self
            .get(storage, &src_path, cancel)
            .await
            .context("failed to get src object", &src_path)?;
        let src_obj = src_raw.unwrapped();
        let src_dir = dir(&src_path);

        match storage.capabilities().dispatch_rename() {
            Some(Dispatch::WithResult(renamer)) => {
                let renamed = cancellable(cancel, renamer.rename(&src_obj, new_name))
                    .await
                    .context("failed to rename", &src_path)?;
                match renamed {
                    Some(obj) => self.update_cache_obj(
                        storage,
                        &src_dir,
                        &src_raw,
                        self.present(obj, &src_dir),
                    ),
                    None => self.delete_cache(storage, &src_dir),
                }
            }
            Some(Dispatch::Plain(renamer)) => {
                cancellable(cancel, renamer.rename(&src_obj, new_name))
                    .await
                    .context("failed to rename", &src_path)?;
                self.delete_cache(storage, &src_dir);
            }
            None => return Err(FsError::unsupported("rename")),
        }
        self.forget_links(storage, &src_path);
        self.forget_links(storage, &join(&src_dir, new_name));
        if src_obj.is_dir() {
            self.clear_cache(storage, &src_path);
        }
        Ok(())
    }

    /// Copy `src_path` into the directory `dst_dir_path`.
    pub async fn copy(
        &self,
        storage: &Arc<Storage>,
        src_path: &str,
        dst_dir_path: &str,
        cancel: &CancellationToken,
    ) -> FsResult<()> {
        storage.check_status()?;
        let src_path = fix_and_clean_path(src_path);
        let dst_dir_path = fix_and_clean_path(dst_dir_path);
        let src_obj = self
            .get_unwrap(storage, &src_path, cancel)
            .await
            .context("failed to get src object", &src_path)?;
        let dst_dir = self
            .get_unwrap(storage, &dst_dir_path, cancel)
            .await
            .context("failed to get dst dir", &dst_dir_path)?;

        match storage.capabilities().dispatch_copy() {
            Some(Dispatch::WithResult(copier)) => {
                let copied = cancellable(cancel, copier.copy(&src_obj, &dst_dir))
                    .await
                    .context("failed to copy", &src_path)?;
                match copied {
                    Some(obj) => {
                        self.add_cache_obj(storage, &dst_dir_path, self.present(obj, &dst_dir_path))
                    }
                    None => self.delete_cache(storage, &dst_dir_path),
                }
            }
            Some(Dispatch::Plain(copier)) => {
                cancellable(cancel, copier.copy(&src_obj, &dst_dir))
                    .await
                    .context("failed to copy", &src_path)?;
                self.delete_cache(storage, &dst_dir_path);
            }
            None => return Err(FsError::unsupported("copy")),
        }
        self.forget_obj_links(storage, &dst_dir_path, &src_obj);
        Ok(())
    }

    /// Remove an object. Removing something already gone succeeds.
    pub async fn remove(
        &self,
        storage: &Arc<Storage>,
        path: &str,
        cancel: &CancellationToken,
    ) -> FsResult<()> {
        if path_equal(path, "/") {
            return Err(FsError::invalid_path(
                "delete root folder is not allowed, please goto the manage page to delete the storage instead",
            ));
        }
        storage.check_status()?;
        let path = fix_and_clean_path(path);
        let raw = match self.get(storage, &path, cancel).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => {
                debug!(%path, "already removed");
                return Ok(());
            }
            Err(e) => return Err(e.context("failed to get object", &path)),
        };

        let remover = storage
            .capabilities()
            .remover
            .ok_or_else(|| FsError::unsupported("remove"))?;
        cancellable(cancel, remover.remove(&raw.unwrapped()))
            .await
            .context("failed to remove", &path)?;

        self.del_cache_obj(storage, &dir(&path), &raw);
        self.forget_links(storage, &path);
        if raw.is_dir() {
            self.clear_cache(storage, &path);
        }
        Ok(())
    }

    /// Upload `file` into `dst_dir_path`. The stream is closed on every path.
    pub async fn put(
        &self,
        storage: &Arc<Storage>,
        dst_dir_path: &str,
        mut file: FileStream,
        progress: Option<UpdateProgress>,
        cancel: &CancellationToken,
    ) -> FsResult<()> {
        let result = self
            .put_stream(storage, dst_dir_path, &mut file, progress, cancel)
            .await;
        if let Err(e) = file.close() {
            warn!(name = file.name(), error = %e, "failed to close file stream");
        }
        result
    }

    async fn put_stream(
        &self,
        storage: &Arc<Storage>,
        dst_dir_path: &str,
        file: &mut FileStream,
        progress: Option<UpdateProgress>,
        cancel: &CancellationToken,
    ) -> FsResult<()> {
        storage.check_status()?;
        let dst_dir_path = fix_and_clean_path(dst_dir_path);
        let name = file.name().to_string();
        let dst_path = join(&dst_dir_path, &name);
        let temp_name = format!("{name}{TEMP_UPLOAD_SUFFIX}");
        let temp_path = join(&dst_dir_path, &temp_name);

        let mut renamed_aside = false;
        let existing = match self.get_unwrap(storage, &dst_path, cancel).await {
            Ok(obj) => Some(obj),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.context("failed to check existing file", &dst_path)),
        };
        if let Some(existing) = existing {
            if existing.size() == 0 {
                self.remove(storage, &dst_path, cancel).await.context(
                    "while uploading, failed remove existing file which size = 0",
                    &dst_path,
                )?;
            } else if storage.config().no_overwrite_upload {
                self.rename(storage, &dst_path, &temp_name, cancel)
                    .await
                    .context("failed rename existing file aside", &dst_path)?;
                renamed_aside = true;
            } else {
                file.set_exist(existing);
            }
        }

        let upload = self
            .upload(storage, &dst_dir_path, file, progress, cancel)
            .await;
        debug!(%dst_path, ok = upload.is_ok(), "put done");

        if renamed_aside {
            // Compensation must run even when the caller has been cancelled
            let detached = CancellationToken::new();
            match &upload {
                Ok(()) => {
                    self.remove(storage, &temp_path, &detached)
                        .await
                        .context("failed to remove the sidecar of an overwritten file", &temp_path)?;
                }
                Err(_) => {
                    if let Err(e) = self.rename(storage, &temp_path, &name, &detached).await {
                        warn!(path = %temp_path, error = %e, "failed recover old obj");
                    }
                }
            }
        }
        if upload.is_ok() {
            self.forget_links(storage, &dst_path);
        }
        upload.context("failed to put file", &dst_path)
    }

    async fn upload(
        &self,
        storage: &Arc<Storage>,
        dst_dir_path: &str,
        file: &mut FileStream,
        progress: Option<UpdateProgress>,
        cancel: &CancellationToken,
    ) -> FsResult<()> {
        self.make_dir(storage, dst_dir_path, cancel)
            .await
            .context("failed to make dir", dst_dir_path)?;
        let parent = self
            .get_unwrap(storage, dst_dir_path, cancel)
            .await
            .context("failed to get dir", dst_dir_path)?;
        let progress = progress.unwrap_or_else(no_progress);

        match storage.capabilities().dispatch_put() {
            Some(Dispatch::WithResult(putter)) => {
                let created = cancellable(cancel, putter.put(&parent, file, progress)).await?;
                match created {
                    Some(obj) => {
                        self.add_cache_obj(storage, dst_dir_path, self.present(obj, dst_dir_path))
                    }
                    None => self.delete_cache(storage, dst_dir_path),
                }
            }
            Some(Dispatch::Plain(putter)) => {
                cancellable(cancel, putter.put(&parent, file, progress)).await?;
                self.delete_cache(storage, dst_dir_path);
            }
            None => return Err(FsError::unsupported("put")),
        }
        Ok(())
    }

    /// Arbitrary driver-specific call on an object.
    pub async fn other(
        &self,
        storage: &Arc<Storage>,
        args: FsOtherArgs,
        cancel: &CancellationToken,
    ) -> FsResult<serde_json::Value> {
        storage.check_status()?;
        let obj = self
            .get_unwrap(storage, &args.path, cancel)
            .await
            .context("failed to get obj", &args.path)?;
        let caller = storage
            .capabilities()
            .other
            .ok_or_else(|| FsError::unsupported("other"))?;
        cancellable(
            cancel,
            caller.other(OtherArgs {
                obj,
                method: args.method,
                data: args.data,
            }),
        )
        .await
        .context("failed other call", &args.path)
    }

    // ========================================================================
    // Links
    // ========================================================================

    /// Produce a download link for a file.
    ///
    /// The returned link carries one reference taken for the caller, who
    /// must [`Link::release`] it when done.
    pub async fn link(
        &self,
        storage: &Arc<Storage>,
        path: &str,
        args: LinkArgs,
        cancel: &CancellationToken,
    ) -> FsResult<(Arc<Link>, Obj)> {
        storage.check_status()?;
        let path = fix_and_clean_path(path);
        let file = self.link_target(storage, &path, cancel).await?;
        if file.is_dir() {
            return Err(FsError::NotAFile(path));
        }

        if storage.config().only_link_mfile {
            let link = self.fetch_link(storage, &file, &args, cancel).await?;
            return Ok((Self::claim(link), file));
        }

        let key = join(&cache_key(storage, &path), &args.link_type);
        if let Some(link) = self.link_cache.get(&key) {
            if link.acquire_reference() {
                debug!(%key, "link cache hit");
                return Ok((link, file));
            }
            self.link_cache.del(&key);
        }

        for _ in 0..2 {
            let slot: Mutex<Option<Arc<Link>>> = Mutex::new(None);
            let share = cancellable(
                cancel,
                self.link_group
                    .work(&key, || self.produce_link(storage, &file, &args, &key, &slot, cancel)),
            )
            .await?;
            match share {
                LinkShare::Shared(link) => {
                    if link.acquire_reference() {
                        return Ok((link, file));
                    }
                    // Released between completion and our acquire
                    self.link_group
                        .forget_if(&key, |s| matches!(s, LinkShare::Shared(l) if Arc::ptr_eq(l, &link)));
                    self.link_cache.del(&key);
                }
                LinkShare::Exclusive => {
                    if let Some(link) = slot.lock().take() {
                        return Ok((Self::claim(link), file));
                    }
                    // Another caller led and kept its private handle
                    let link = self.fetch_link(storage, &file, &args, cancel).await?;
                    return Ok((Self::claim(link), file));
                }
            }
        }

        let link = self.fetch_link(storage, &file, &args, cancel).await?;
        Ok((Self::claim(link), file))
    }

    async fn link_target(
        &self,
        storage: &Arc<Storage>,
        path: &str,
        cancel: &CancellationToken,
    ) -> FsResult<Obj> {
        let (parent, name) = split(path);
        if let Some(files) = self.list_cache.get(&cache_key(storage, &parent)) {
            if let Some(file) = files.iter().find(|f| f.name() == name) {
                return Ok(file.unwrapped());
            }
        }
        let found = match storage.capabilities().obj_info {
            Some(info) => cancellable(cancel, info.get_obj_info(path))
                .await
                .map(|o| o.unwrapped()),
            None => self.get_unwrap(storage, path, cancel).await,
        };
        found.context("failed to get file", path)
    }

    async fn fetch_link(
        &self,
        storage: &Arc<Storage>,
        file: &Obj,
        args: &LinkArgs,
        cancel: &CancellationToken,
    ) -> FsResult<Arc<Link>> {
        let link = cancellable(cancel, storage.driver().link(file, args))
            .await
            .context("failed get link", file.path())?;
        Ok(Arc::new(link))
    }

    /// Body of the coalesced link fetch.
    async fn produce_link(
        &self,
        storage: &Arc<Storage>,
        file: &Obj,
        args: &LinkArgs,
        key: &str,
        slot: &Mutex<Option<Arc<Link>>>,
        cancel: &CancellationToken,
    ) -> FsResult<LinkShare> {
        let link = self.fetch_link(storage, file, args, cancel).await?;
        if !link.is_shareable() {
            *slot.lock() = Some(link);
            return Ok(LinkShare::Exclusive);
        }

        let group: Weak<Group<LinkShare>> = Arc::downgrade(&self.link_group);
        let this: Weak<Link> = Arc::downgrade(&link);
        let gate_key = key.to_string();
        link.add_closer(Box::new(move || {
            if let Some(group) = group.upgrade() {
                group.forget_if(&gate_key, |s| {
                    matches!(s, LinkShare::Shared(l) if std::ptr::eq(Arc::as_ptr(l), this.as_ptr()))
                });
            }
            Ok(())
        }));
        if let Some(expiration) = link.expiration {
            self.link_cache.set(key, Arc::clone(&link), expiration);
        }
        Ok(LinkShare::Shared(link))
    }

    /// Take the caller's reference on a link nobody else can see yet.
    fn claim(link: Arc<Link>) -> Arc<Link> {
        if !link.acquire_reference() {
            warn!(url = %link.url, "fresh link already closed");
        }
        link
    }

    /// Stop handing out links produced for `path` before it changed.
    /// Holders keep theirs until they release.
    /// Forget links for `obj` landing in `dir_path`, under its shown and
    /// stored names.
    fn forget_obj_links(&self, storage: &Storage, dir_path: &str, obj: &Obj) {
        self.forget_links(storage, &join(dir_path, obj.name()));
        let raw = obj.unwrapped();
        if raw.name() != obj.name() {
            self.forget_links(storage, &join(dir_path, raw.name()));
        }
    }

    fn forget_links(&self, storage: &Storage, path: &str) {
        let key = cache_key(storage, path);
        let below = format!("{key}/");
        let under = |k: &str| k == key || k.starts_with(&below);
        self.link_cache.retain(|k| !under(k));
        self.link_group.forget_matching(under);
    }
}

impl std::fmt::Debug for FsOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsOps")
            .field("cached_listings", &self.list_cache.len())
            .field("cached_links", &self.link_cache.len())
            .finish_non_exhaustive()
    }
}
