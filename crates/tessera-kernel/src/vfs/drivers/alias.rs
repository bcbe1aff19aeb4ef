//! Reference driver serving another mounted storage.
//!
//! The target is chosen by the storage remark (`ref:/<mount path>`) and
//! wired before `init`. Reads go straight to the target's driver; the alias
//! itself is read-only.

use async_trait::async_trait;
use std::sync::Arc;

use crate::vfs::driver::{
    Capabilities, Driver, DriverConfig, Getter, Meta, Reader, Reference, RootGetter,
};
use crate::vfs::error::{FsError, FsResult};
use crate::vfs::link::Link;
use crate::vfs::record::StorageRecord;
use crate::vfs::storage::Storage;
use crate::vfs::types::{LinkArgs, ListArgs, Obj, Object};

pub const NAME: &str = "alias";

#[derive(Debug, Default)]
pub struct AliasDriver {
    target: Option<Arc<Storage>>,
}

impl AliasDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn target(&self) -> FsResult<&Arc<Storage>> {
        self.target
            .as_ref()
            .ok_or_else(|| FsError::Reference("alias has no target storage".to_string()))
    }
}

#[async_trait]
impl Meta for AliasDriver {
    fn config(&self) -> DriverConfig {
        DriverConfig {
            no_upload: true,
            ..DriverConfig::new(NAME)
        }
    }

    fn addition(&self) -> FsResult<serde_json::Value> {
        Ok(serde_json::json!({}))
    }

    fn set_addition(&mut self, _raw: &str) -> FsResult<()> {
        Ok(())
    }

    async fn init(&mut self, record: &StorageRecord) -> FsResult<()> {
        let target = self.target()?;
        if target.mount_path() == record.mount_path {
            return Err(FsError::Reference("alias cannot point at itself".to_string()));
        }
        target.check_status()
    }
}

#[async_trait]
impl Reader for AliasDriver {
    async fn list(&self, dir: &Obj, args: &ListArgs) -> FsResult<Vec<Obj>> {
        self.target()?.driver().list(dir, args).await
    }

    async fn link(&self, file: &Obj, args: &LinkArgs) -> FsResult<Link> {
        self.target()?.driver().link(file, args).await
    }
}

#[async_trait]
impl Getter for AliasDriver {
    async fn get(&self, path: &str) -> FsResult<Obj> {
        let target = self.target()?;
        match target.capabilities().getter {
            Some(getter) => getter.get(path).await,
            None => Err(FsError::unsupported("target has no getter")),
        }
    }
}

#[async_trait]
impl RootGetter for AliasDriver {
    async fn get_root(&self) -> FsResult<Obj> {
        let target = self.target()?;
        if let Some(root) = target.capabilities().root {
            return root.get_root().await;
        }
        if let Some(getter) = target.capabilities().getter {
            return getter.get("/").await;
        }
        Ok(Obj::new(
            Object::folder("root")
                .with_path("/")
                .with_modified(target.record().modified),
        ))
    }
}

impl Reference for AliasDriver {
    fn init_reference(&mut self, target: Arc<Storage>) -> FsResult<()> {
        self.target = Some(target);
        Ok(())
    }
}

impl Driver for AliasDriver {
    fn capabilities(&self) -> Capabilities<'_> {
        Capabilities::new().getter(self).root(self)
    }

    fn as_reference(&mut self) -> Option<&mut dyn Reference> {
        Some(self)
    }
}
