//! # tessera-kernel
//!
//! Storage virtualization core for tessera.
//!
//! Many heterogeneous storage backends are mounted at paths of one virtual
//! namespace. The kernel:
//! - Registers drivers and instantiates storages from persisted records
//! - Routes virtual paths to the storage with the deepest matching mount
//! - Caches directory listings and coalesces concurrent identical requests
//! - Shares reference-counted download links between concurrent readers
//! - Notifies hooks when listings refresh and storages come and go

pub mod config;
pub mod db;
pub mod kernel;
pub mod vfs;

pub use config::TesseraConfig;
pub use db::SqliteStorageRepository;
pub use kernel::Kernel;
pub use vfs::{
    FileStream, FileSystem, FsError, FsOps, FsResult, Link, LinkArgs, Obj, Storage,
    StorageManager, StorageRecord, StorageRepository,
    drivers::{AliasDriver, LocalDriver, MemoryDriver},
};
