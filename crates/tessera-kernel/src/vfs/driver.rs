//! Driver capability model.
//!
//! Every backend implements [`Meta`] and [`Reader`]. Everything else is an
//! optional capability advertised through [`Driver::capabilities`]; the
//! operation layer checks the slots at call time. Most mutations come in a
//! void shape (caller invalidates the listing cache) and a value-returning
//! shape (caller patches the cache with the returned object). When a driver
//! fills both slots the value-returning one wins.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::error::{FsError, FsResult};
use super::link::Link;
use super::record::StorageRecord;
use super::storage::Storage;
use super::stream::{FileStream, UpdateProgress};
use super::types::{LinkArgs, ListArgs, Obj, OtherArgs};

/// Per-driver policy flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    pub name: String,
    /// Listings may be sorted by the storage's order settings.
    pub local_sort: bool,
    /// Every link is backed by an in-process file.
    pub only_link_mfile: bool,
    pub only_proxy: bool,
    /// Listings are never cached.
    pub no_cache: bool,
    pub no_upload: bool,
    pub need_ms: bool,
    /// Default value of the root folder field.
    pub default_root: String,
    /// Reject operations while the storage status is not `work`.
    pub check_status: bool,
    pub alert: String,
    /// Rename the existing file aside during an upload instead of
    /// overwriting it in place.
    pub no_overwrite_upload: bool,
}

impl DriverConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn must_proxy(&self) -> bool {
        self.only_proxy || self.only_link_mfile
    }
}

pub const TYPE_STRING: &str = "string";
pub const TYPE_SELECT: &str = "select";
pub const TYPE_BOOL: &str = "bool";
pub const TYPE_TEXT: &str = "text";
pub const TYPE_NUMBER: &str = "number";

/// Field names that carry the driver's root location.
pub const ROOT_FIELDS: [&str; 2] = ["root_folder_path", "root_folder_id"];

/// One user-facing configuration field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub default: String,
    /// Comma-separated choices for `select` fields.
    pub options: String,
    pub required: bool,
    pub help: String,
}

impl Item {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn default_value(mut self, default: impl Into<String>) -> Self {
        self.default = default.into();
        self
    }

    pub fn options(mut self, options: impl Into<String>) -> Self {
        self.options = options.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = help.into();
        self
    }
}

/// Registry view of a driver: common fields, addition fields and flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub common: Vec<Item>,
    pub additional: Vec<Item>,
    pub config: DriverConfig,
}

/// Where a driver's root lives when it has no root getter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootLocator {
    Path(String),
    Id(String),
}

/// Required driver contract: configuration and lifecycle.
#[async_trait]
pub trait Meta: Send + Sync {
    fn config(&self) -> DriverConfig;

    /// Declared fields of the addition payload.
    fn addition_fields(&self) -> Vec<Item> {
        Vec::new()
    }

    /// Current addition, written back to the record after init.
    fn addition(&self) -> FsResult<serde_json::Value>;

    /// Load the addition from the record's JSON payload.
    fn set_addition(&mut self, raw: &str) -> FsResult<()>;

    fn root(&self) -> Option<RootLocator> {
        None
    }

    async fn init(&mut self, record: &StorageRecord) -> FsResult<()>;

    /// Release backend resources before the instance is discarded.
    async fn teardown(&self) -> FsResult<()> {
        Ok(())
    }
}

/// Required driver contract: reads.
#[async_trait]
pub trait Reader: Send + Sync {
    async fn list(&self, dir: &Obj, args: &ListArgs) -> FsResult<Vec<Obj>>;

    async fn link(&self, file: &Obj, args: &LinkArgs) -> FsResult<Link>;
}

/// A storage backend.
pub trait Driver: Meta + Reader {
    /// Optional capabilities this instance offers.
    fn capabilities(&self) -> Capabilities<'_> {
        Capabilities::default()
    }

    /// Reference capability, for drivers that wrap another mount.
    fn as_reference(&mut self) -> Option<&mut dyn Reference> {
        None
    }
}

#[async_trait]
pub trait Getter: Send + Sync {
    async fn get(&self, path: &str) -> FsResult<Obj>;
}

/// Cheap metadata lookup used on the link path.
#[async_trait]
pub trait ObjInfoGetter: Send + Sync {
    async fn get_obj_info(&self, path: &str) -> FsResult<Obj>;
}

#[async_trait]
pub trait RootGetter: Send + Sync {
    async fn get_root(&self) -> FsResult<Obj>;
}

#[async_trait]
pub trait DirMaker: Send + Sync {
    async fn make_dir(&self, parent: &Obj, name: &str) -> FsResult<()>;
}

#[async_trait]
pub trait DirMakerResult: Send + Sync {
    async fn make_dir(&self, parent: &Obj, name: &str) -> FsResult<Option<Obj>>;
}

#[async_trait]
pub trait Mover: Send + Sync {
    async fn move_obj(&self, src: &Obj, dst_dir: &Obj) -> FsResult<()>;
}

#[async_trait]
pub trait MoverResult: Send + Sync {
    async fn move_obj(&self, src: &Obj, dst_dir: &Obj) -> FsResult<Option<Obj>>;
}

#[async_trait]
pub trait Renamer: Send + Sync {
    async fn rename(&self, src: &Obj, new_name: &str) -> FsResult<()>;
}

#[async_trait]
pub trait RenamerResult: Send + Sync {
    async fn rename(&self, src: &Obj, new_name: &str) -> FsResult<Option<Obj>>;
}

#[async_trait]
pub trait Copier: Send + Sync {
    async fn copy(&self, src: &Obj, dst_dir: &Obj) -> FsResult<()>;
}

#[async_trait]
pub trait CopierResult: Send + Sync {
    async fn copy(&self, src: &Obj, dst_dir: &Obj) -> FsResult<Option<Obj>>;
}

#[async_trait]
pub trait Remover: Send + Sync {
    async fn remove(&self, obj: &Obj) -> FsResult<()>;
}

#[async_trait]
pub trait Putter: Send + Sync {
    async fn put(
        &self,
        dst_dir: &Obj,
        file: &mut FileStream,
        progress: UpdateProgress,
    ) -> FsResult<()>;
}

#[async_trait]
pub trait PutterResult: Send + Sync {
    async fn put(
        &self,
        dst_dir: &Obj,
        file: &mut FileStream,
        progress: UpdateProgress,
    ) -> FsResult<Option<Obj>>;
}

#[async_trait]
pub trait OtherCaller: Send + Sync {
    async fn other(&self, args: OtherArgs) -> FsResult<serde_json::Value>;
}

/// Driver that serves another mounted storage.
pub trait Reference: Send + Sync {
    fn init_reference(&mut self, target: Arc<Storage>) -> FsResult<()>;
}

/// Chosen implementation for a capability offered in two shapes.
pub enum Dispatch<'a, V: ?Sized, R: ?Sized> {
    /// Value-returning shape; the caller patches the cache.
    WithResult(&'a R),
    /// Void shape; the caller invalidates the cache.
    Plain(&'a V),
}

fn prefer<'a, V: ?Sized, R: ?Sized>(
    plain: Option<&'a V>,
    result: Option<&'a R>,
) -> Option<Dispatch<'a, V, R>> {
    match (result, plain) {
        (Some(r), _) => Some(Dispatch::WithResult(r)),
        (None, Some(v)) => Some(Dispatch::Plain(v)),
        (None, None) => None,
    }
}

/// Optional capability slots of a driver instance.
#[derive(Clone, Copy, Default)]
pub struct Capabilities<'a> {
    pub getter: Option<&'a dyn Getter>,
    pub obj_info: Option<&'a dyn ObjInfoGetter>,
    pub root: Option<&'a dyn RootGetter>,
    pub mkdir: Option<&'a dyn DirMaker>,
    pub mkdir_result: Option<&'a dyn DirMakerResult>,
    pub mover: Option<&'a dyn Mover>,
    pub mover_result: Option<&'a dyn MoverResult>,
    pub renamer: Option<&'a dyn Renamer>,
    pub renamer_result: Option<&'a dyn RenamerResult>,
    pub copier: Option<&'a dyn Copier>,
    pub copier_result: Option<&'a dyn CopierResult>,
    pub remover: Option<&'a dyn Remover>,
    pub putter: Option<&'a dyn Putter>,
    pub putter_result: Option<&'a dyn PutterResult>,
    pub other: Option<&'a dyn OtherCaller>,
}

impl<'a> Capabilities<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn getter(mut self, c: &'a dyn Getter) -> Self {
        self.getter = Some(c);
        self
    }

    pub fn obj_info(mut self, c: &'a dyn ObjInfoGetter) -> Self {
        self.obj_info = Some(c);
        self
    }

    pub fn root(mut self, c: &'a dyn RootGetter) -> Self {
        self.root = Some(c);
        self
    }

    pub fn mkdir(mut self, c: &'a dyn DirMaker) -> Self {
        self.mkdir = Some(c);
        self
    }

    pub fn mkdir_result(mut self, c: &'a dyn DirMakerResult) -> Self {
        self.mkdir_result = Some(c);
        self
    }

    pub fn mover(mut self, c: &'a dyn Mover) -> Self {
        self.mover = Some(c);
        self
    }

    pub fn mover_result(mut self, c: &'a dyn MoverResult) -> Self {
        self.mover_result = Some(c);
        self
    }

    pub fn renamer(mut self, c: &'a dyn Renamer) -> Self {
        self.renamer = Some(c);
        self
    }

    pub fn renamer_result(mut self, c: &'a dyn RenamerResult) -> Self {
        self.renamer_result = Some(c);
        self
    }

    pub fn copier(mut self, c: &'a dyn Copier) -> Self {
        self.copier = Some(c);
        self
    }

    pub fn copier_result(mut self, c: &'a dyn CopierResult) -> Self {
        self.copier_result = Some(c);
        self
    }

    pub fn remover(mut self, c: &'a dyn Remover) -> Self {
        self.remover = Some(c);
        self
    }

    pub fn putter(mut self, c: &'a dyn Putter) -> Self {
        self.putter = Some(c);
        self
    }

    pub fn putter_result(mut self, c: &'a dyn PutterResult) -> Self {
        self.putter_result = Some(c);
        self
    }

    pub fn other(mut self, c: &'a dyn OtherCaller) -> Self {
        self.other = Some(c);
        self
    }

    pub fn dispatch_mkdir(&self) -> Option<Dispatch<'a, dyn DirMaker + 'a, dyn DirMakerResult + 'a>> {
        prefer(self.mkdir, self.mkdir_result)
    }

    pub fn dispatch_move(&self) -> Option<Dispatch<'a, dyn Mover + 'a, dyn MoverResult + 'a>> {
        prefer(self.mover, self.mover_result)
    }

    pub fn dispatch_rename(
        &self,
    ) -> Option<Dispatch<'a, dyn Renamer + 'a, dyn RenamerResult + 'a>> {
        prefer(self.renamer, self.renamer_result)
    }

    pub fn dispatch_copy(&self) -> Option<Dispatch<'a, dyn Copier + 'a, dyn CopierResult + 'a>> {
        prefer(self.copier, self.copier_result)
    }

    pub fn dispatch_put(&self) -> Option<Dispatch<'a, dyn Putter + 'a, dyn PutterResult + 'a>> {
        prefer(self.putter, self.putter_result)
    }

    /// Names of the filled slots.
    pub fn names(&self) -> Vec<&'static str> {
        let slots = [
            ("get", self.getter.is_some()),
            ("get_obj_info", self.obj_info.is_some()),
            ("get_root", self.root.is_some()),
            ("mkdir", self.mkdir.is_some()),
            ("mkdir_result", self.mkdir_result.is_some()),
            ("move", self.mover.is_some()),
            ("move_result", self.mover_result.is_some()),
            ("rename", self.renamer.is_some()),
            ("rename_result", self.renamer_result.is_some()),
            ("copy", self.copier.is_some()),
            ("copy_result", self.copier_result.is_some()),
            ("remove", self.remover.is_some()),
            ("put", self.putter.is_some()),
            ("put_result", self.putter_result.is_some()),
            ("other", self.other.is_some()),
        ];
        slots
            .into_iter()
            .filter_map(|(name, present)| present.then_some(name))
            .collect()
    }
}

impl fmt::Debug for Capabilities<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Decode an addition payload; blank input yields the type's defaults.
pub fn decode_addition<A: DeserializeOwned + Default>(raw: &str) -> FsResult<A> {
    if raw.trim().is_empty() {
        return Ok(A::default());
    }
    serde_json::from_str(raw).map_err(|e| FsError::config(format!("invalid addition: {e}")))
}

pub fn encode_addition<A: Serialize>(addition: &A) -> FsResult<serde_json::Value> {
    Ok(serde_json::to_value(addition)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Both;

    #[async_trait]
    impl DirMaker for Both {
        async fn make_dir(&self, _parent: &Obj, _name: &str) -> FsResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl DirMakerResult for Both {
        async fn make_dir(&self, _parent: &Obj, _name: &str) -> FsResult<Option<Obj>> {
            Ok(None)
        }
    }

    #[test]
    fn test_result_variant_preferred() {
        let both = Both;
        let caps = Capabilities::new().mkdir(&both).mkdir_result(&both);
        assert!(matches!(caps.dispatch_mkdir(), Some(Dispatch::WithResult(_))));

        let caps = Capabilities::new().mkdir(&both);
        assert!(matches!(caps.dispatch_mkdir(), Some(Dispatch::Plain(_))));

        assert!(Capabilities::new().dispatch_mkdir().is_none());
        assert_eq!(
            Capabilities::new().mkdir(&both).mkdir_result(&both).names(),
            vec!["mkdir", "mkdir_result"]
        );
    }

    #[test]
    fn test_must_proxy() {
        let mut config = DriverConfig::new("x");
        assert!(!config.must_proxy());
        config.only_link_mfile = true;
        assert!(config.must_proxy());
    }

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Addition {
        #[serde(default)]
        root_folder_path: String,
    }

    #[test]
    fn test_decode_addition() {
        let a: Addition = decode_addition("").unwrap();
        assert_eq!(a, Addition::default());
        let a: Addition = decode_addition(r#"{"root_folder_path":"/srv"}"#).unwrap();
        assert_eq!(a.root_folder_path, "/srv");
        assert!(decode_addition::<Addition>("{not json").is_err());
    }
}
