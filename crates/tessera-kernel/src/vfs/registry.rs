//! Driver registry.
//!
//! Maps a driver name to its constructor and to the configuration schema a
//! front end needs to render a storage form.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::driver::{
    Driver, DriverConfig, DriverInfo, Item, ROOT_FIELDS, TYPE_BOOL, TYPE_NUMBER, TYPE_SELECT,
    TYPE_STRING, TYPE_TEXT,
};
use super::error::{FsError, FsResult, panic_message};
use super::record::DEFAULT_CACHE_EXPIRATION;

/// Builds a fresh, uninitialized driver instance.
pub type DriverConstructor = Arc<dyn Fn() -> Box<dyn Driver> + Send + Sync>;

/// Catalogue of available drivers.
#[derive(Default)]
pub struct DriverRegistry {
    constructors: RwLock<HashMap<String, DriverConstructor>>,
    infos: RwLock<HashMap<String, DriverInfo>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under the name its drivers declare.
    ///
    /// One throwaway instance is built to read the declared config and
    /// addition fields; a panic while doing so fails the registration.
    pub fn register<F>(&self, constructor: F) -> FsResult<()>
    where
        F: Fn() -> Box<dyn Driver> + Send + Sync + 'static,
    {
        let constructor: DriverConstructor = Arc::new(constructor);
        let sample = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let driver = constructor();
            (driver.config(), driver.addition_fields())
        }))
        .map_err(|payload| FsError::InitPanic(panic_message(payload.as_ref())))?;
        let (config, fields) = sample;

        let name = config.name.clone();
        let info = DriverInfo {
            common: main_items(&config),
            additional: additional_items(fields, &config),
            config,
        };

        if self.constructors.write().insert(name.clone(), constructor).is_some() {
            debug!(driver = %name, "driver re-registered");
        }
        self.infos.write().insert(name.clone(), info);
        info!(driver = %name, "registered driver");
        Ok(())
    }

    pub fn constructor(&self, name: &str) -> FsResult<DriverConstructor> {
        self.constructors
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| FsError::DriverNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.read().contains_key(name)
    }

    /// Registered driver names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn info(&self, name: &str) -> Option<DriverInfo> {
        self.infos.read().get(name).cloned()
    }

    pub fn infos(&self) -> BTreeMap<String, DriverInfo> {
        self.infos
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Fields every storage carries, filtered by the driver's policy flags.
fn main_items(config: &DriverConfig) -> Vec<Item> {
    let mut items = vec![
        Item::new("mount_path", TYPE_STRING)
            .required()
            .help("The path you want to mount to, it is unique and cannot be repeated"),
        Item::new("order", TYPE_NUMBER).help("use to sort"),
        Item::new("remark", TYPE_TEXT),
    ];
    if !config.no_cache {
        items.push(
            Item::new("cache_expiration", TYPE_NUMBER)
                .default_value(DEFAULT_CACHE_EXPIRATION.to_string())
                .required()
                .help("The cache expiration time for this storage"),
        );
    }
    items.push(Item::new("down_proxy_url", TYPE_TEXT));
    items.push(
        Item::new("disable_proxy_sign", TYPE_BOOL)
            .default_value("false")
            .help("Disable sign for Download proxy URL"),
    );
    if config.local_sort {
        items.push(
            Item::new("order_by", TYPE_SELECT)
                .options("name,size,modified")
                .default_value("name"),
        );
        items.push(
            Item::new("order_direction", TYPE_SELECT)
                .options("asc,desc")
                .default_value("asc"),
        );
    }
    items.push(
        Item::new("extract_folder", TYPE_SELECT)
            .options("front,back")
            .help("Extract folders to the front or back"),
    );
    items.push(
        Item::new("disable_index", TYPE_BOOL)
            .default_value("false")
            .required(),
    );
    items.push(
        Item::new("enable_sign", TYPE_BOOL)
            .default_value("false")
            .required(),
    );
    items
}

/// Normalize the driver's declared addition fields.
fn additional_items(fields: Vec<Item>, config: &DriverConfig) -> Vec<Item> {
    fields
        .into_iter()
        .map(|mut item| {
            if item.kind.is_empty() {
                item.kind = TYPE_STRING.to_string();
            }
            if ROOT_FIELDS.contains(&item.name.as_str()) {
                item.default = config.default_root.clone();
                item.required = !config.default_root.is_empty();
            }
            item
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::drivers::MemoryDriver;
    use crate::vfs::drivers::mock::{MockDriver, MockState};

    fn names(items: &[Item]) -> Vec<&str> {
        items.iter().map(|i| i.name.as_str()).collect()
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = DriverRegistry::new();
        registry.register(|| Box::new(MemoryDriver::new())).unwrap();

        assert_eq!(registry.names(), vec!["memory".to_string()]);
        assert!(registry.constructor("memory").is_ok());
        let err = registry.constructor("nope").err().unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_common_fields_follow_flags() {
        let registry = DriverRegistry::new();
        registry.register(|| Box::new(MemoryDriver::new())).unwrap();
        let info = registry.info("memory").unwrap();
        let common = names(&info.common);
        assert!(common.contains(&"mount_path"));
        assert!(common.contains(&"cache_expiration"));
        // memory does not sort locally
        assert!(!common.contains(&"order_by"));

        let cache = info.common.iter().find(|i| i.name == "cache_expiration").unwrap();
        assert_eq!(cache.default, "30");
    }

    #[test]
    fn test_no_cache_driver_has_no_cache_field() {
        let state = MockState::new();
        state.options.lock().config.no_cache = true;
        state.options.lock().config.local_sort = true;
        let registry = DriverRegistry::new();
        let s = state.clone();
        registry.register(move || Box::new(MockDriver::new(s.clone()))).unwrap();
        let info = registry.info("mock").unwrap();
        let common = names(&info.common);
        assert!(!common.contains(&"cache_expiration"));
        assert!(common.contains(&"order_by"));
        assert!(common.contains(&"order_direction"));
    }

    #[test]
    fn test_root_field_defaults() {
        let config = DriverConfig {
            default_root: "/".into(),
            ..DriverConfig::new("x")
        };
        let items = additional_items(
            vec![Item::new("root_folder_path", ""), Item::new("token", TYPE_STRING)],
            &config,
        );
        assert_eq!(items[0].kind, TYPE_STRING);
        assert_eq!(items[0].default, "/");
        assert!(items[0].required);
        assert!(!items[1].required);
    }

    #[test]
    fn test_panicking_constructor_fails_registration() {
        let registry = DriverRegistry::new();
        let err = registry
            .register(|| -> Box<dyn Driver> { panic!("constructor blew up") })
            .unwrap_err();
        assert!(matches!(err, FsError::InitPanic(ref msg) if msg.contains("constructor blew up")));
        assert!(registry.names().is_empty());
    }
}
