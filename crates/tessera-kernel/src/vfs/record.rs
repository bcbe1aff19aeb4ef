//! Persisted storage configuration.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Status of a storage whose driver initialized cleanly.
pub const STATUS_WORK: &str = "work";
/// Status of a storage switched off by configuration.
pub const STATUS_DISABLED: &str = "disabled";

/// Default listing cache lifetime, in minutes.
pub const DEFAULT_CACHE_EXPIRATION: u32 = 30;

/// Remark prefix that points a reference driver at another mount.
pub const REF_PREFIX: &str = "ref:/";

fn default_cache_expiration() -> u32 {
    DEFAULT_CACHE_EXPIRATION
}

/// Listing order settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sort {
    pub order_by: String,
    pub order_direction: String,
    pub extract_folder: String,
}

/// Proxy and WebDAV delivery policy, consumed by front ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Proxy {
    pub web_proxy: bool,
    pub webdav_policy: String,
    pub proxy_range: bool,
    pub down_proxy_url: String,
    pub disable_proxy_sign: bool,
}

/// One mounted backend as stored in the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRecord {
    #[serde(default)]
    pub id: Uuid,
    pub mount_path: String,
    #[serde(default)]
    pub order: i32,
    pub driver: String,
    /// Listing cache lifetime in minutes.
    #[serde(default = "default_cache_expiration")]
    pub cache_expiration: u32,
    /// `work`, `disabled`, or the text of the last init failure.
    #[serde(default)]
    pub status: String,
    /// Driver-specific JSON payload.
    #[serde(default)]
    pub addition: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default = "SystemTime::now")]
    pub modified: SystemTime,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub disable_index: bool,
    #[serde(default)]
    pub enable_sign: bool,
    #[serde(flatten)]
    pub sort: Sort,
    #[serde(flatten)]
    pub proxy: Proxy,
}

impl StorageRecord {
    pub fn new(mount_path: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            id: Uuid::nil(),
            mount_path: mount_path.into(),
            order: 0,
            driver: driver.into(),
            cache_expiration: DEFAULT_CACHE_EXPIRATION,
            status: String::new(),
            addition: String::new(),
            remark: String::new(),
            modified: SystemTime::now(),
            disabled: false,
            disable_index: false,
            enable_sign: false,
            sort: Sort::default(),
            proxy: Proxy::default(),
        }
    }

    pub fn with_addition(mut self, addition: serde_json::Value) -> Self {
        self.addition = addition.to_string();
        self
    }

    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = remark.into();
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn with_cache_expiration(mut self, minutes: u32) -> Self {
        self.cache_expiration = minutes;
        self
    }

    pub fn is_working(&self) -> bool {
        self.status == STATUS_WORK
    }

    /// Listing cache lifetime.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.cache_expiration) * 60)
    }

    pub fn webdav_302(&self) -> bool {
        self.proxy.webdav_policy == "302_redirect"
    }

    pub fn webdav_proxy_url(&self) -> bool {
        self.proxy.webdav_policy == "use_proxy_url"
    }

    /// Mount path named by a `ref:/...` remark: the text after `ref:` up to
    /// the first newline.
    pub fn reference_target(&self) -> Option<&str> {
        if !self.remark.starts_with(REF_PREFIX) {
            return None;
        }
        let rest = &self.remark["ref:".len()..];
        let end = rest.find('\n').unwrap_or(rest.len());
        Some(rest[..end].trim_end_matches('\r'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_target() {
        let record = StorageRecord::new("/alias", "alias").with_remark("ref:/drive/sub\nnotes here");
        assert_eq!(record.reference_target(), Some("/drive/sub"));

        let record = StorageRecord::new("/alias", "alias").with_remark("ref:/drive");
        assert_eq!(record.reference_target(), Some("/drive"));

        let record = StorageRecord::new("/alias", "alias").with_remark("just a note");
        assert_eq!(record.reference_target(), None);
    }

    #[test]
    fn test_webdav_policy() {
        let mut record = StorageRecord::new("/d", "local");
        record.proxy.webdav_policy = "302_redirect".into();
        assert!(record.webdav_302());
        assert!(!record.webdav_proxy_url());
    }

    #[test]
    fn test_deserialize_defaults() {
        let record: StorageRecord =
            serde_json::from_str(r#"{"mount_path":"/m","driver":"memory","order_by":"name"}"#)
                .unwrap();
        assert_eq!(record.cache_expiration, DEFAULT_CACHE_EXPIRATION);
        assert_eq!(record.sort.order_by, "name");
        assert!(record.id.is_nil());
        assert_eq!(record.cache_ttl(), Duration::from_secs(30 * 60));
    }
}
