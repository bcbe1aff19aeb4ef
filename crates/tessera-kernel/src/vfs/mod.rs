//! Multi-backend virtual filesystem.
//!
//! Key components:
//!
//! - [`Driver`] and its capability traits - what a storage backend implements
//! - [`DriverRegistry`] - driver constructors and their configuration schema
//! - [`StorageManager`] - storage lifecycle, persisted through a [`StorageRepository`]
//! - [`MountTable`] - routes virtual paths to storages
//! - [`FsOps`] - cached, coalesced operations on one storage
//! - [`FileSystem`] - the same operations on virtual paths
//!
//! ## Design Decisions
//!
//! - **Capability slots, not one big trait**: drivers fill the optional
//!   slots they support and the operation layer checks them per call.
//! - **Deepest-prefix routing**: the most specific mount wins; storages
//!   sharing a prefix through a `.balance` suffix are used in rotation.
//! - **Snapshot-and-swap**: a storage instance is immutable once mounted.
//!   Updates build a replacement and publish it.

mod cache;
pub mod driver;
pub mod drivers;
mod error;
mod fs;
mod hooks;
mod link;
mod mount;
mod ops;
pub mod path;
mod record;
mod registry;
mod repository;
mod singleflight;
mod storage;
mod stream;
mod types;

pub use cache::{ListCache, TtlCache};
pub use driver::{
    Capabilities, Dispatch, Driver, DriverConfig, DriverInfo, Item, Meta, Reader, Reference,
    RootLocator,
};
pub use drivers::{AliasDriver, LocalDriver, MemoryDriver, register_builtin};
pub use error::{ErrorKind, FsError, FsResult, FsResultExt};
pub use fs::FileSystem;
pub use hooks::{Hooks, ObjsUpdateHook, StorageEvent, StorageHook};
pub use link::{Closer, Link, SeekableFile, SyncClosers};
pub use mount::{MountInfo, MountTable};
pub use ops::{FsOps, TEMP_UPLOAD_SUFFIX};
pub use record::{
    DEFAULT_CACHE_EXPIRATION, Proxy, REF_PREFIX, STATUS_DISABLED, STATUS_WORK, Sort,
    StorageRecord,
};
pub use registry::{DriverConstructor, DriverRegistry};
pub use repository::{MemoryStorageRepository, StorageRepository};
pub use singleflight::Group;
pub use storage::{Storage, StorageManager};
pub use stream::{FileStream, UpdateProgress, no_progress};
pub use types::{
    FsOtherArgs, LinkArgs, ListArgs, NameMapper, Obj, Object, OtherArgs, extract_folder,
    sort_objs,
};
