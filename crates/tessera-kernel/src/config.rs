//! Configuration for a tessera host.
//!
//! Configuration is loaded from `--config`, then `$TESSERA_CONFIG`, then
//! `~/.config/tessera/config.toml`; a missing file means defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::vfs::{DEFAULT_CACHE_EXPIRATION, NameMapper};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "TESSERA_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TesseraConfig {
    /// SQLite file holding storage records.
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Tracing filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Display-name remapping: every occurrence of a key in an object name
    /// is shown as its value.
    #[serde(default)]
    pub filename_char_map: BTreeMap<String, String>,

    /// Listing cache minutes for new storages that do not set their own.
    #[serde(default = "default_cache_expiration")]
    pub default_cache_expiration: u32,
}

fn default_database() -> PathBuf {
    dirs::data_local_dir()
        .map(|p| p.join("tessera").join("tessera.db"))
        .unwrap_or_else(|| PathBuf::from("tessera.db"))
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_cache_expiration() -> u32 {
    DEFAULT_CACHE_EXPIRATION
}

impl Default for TesseraConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            log_filter: default_log_filter(),
            filename_char_map: BTreeMap::new(),
            default_cache_expiration: default_cache_expiration(),
        }
    }
}

impl TesseraConfig {
    /// Load from an explicit path, the environment, or the default location.
    ///
    /// Only an explicitly named file must exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load_from(Path::new(&path));
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => {
                tracing::debug!("no config file, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("tessera").join("config.toml"))
    }

    pub fn name_mapper(&self) -> NameMapper {
        NameMapper::new(&self.filename_char_map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let config = TesseraConfig::from_toml("").unwrap();
        assert_eq!(config.log_filter, "info");
        assert_eq!(config.default_cache_expiration, 30);
        assert!(config.name_mapper().is_empty());
    }

    #[test]
    fn test_parse_full() {
        let config = TesseraConfig::from_toml(
            r#"
            database = "/var/lib/tessera/db.sqlite"
            log_filter = "tessera_kernel=debug"
            default_cache_expiration = 5

            [filename_char_map]
            ":" = "_"
            "#,
        )
        .unwrap();
        assert_eq!(config.database, PathBuf::from("/var/lib/tessera/db.sqlite"));
        assert_eq!(config.default_cache_expiration, 5);
        assert_eq!(config.name_mapper().map_name("a:b"), "a_b");
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        assert!(TesseraConfig::from_toml("database = [").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "log_filter = \"warn\"\n").unwrap();
        let config = TesseraConfig::load(Some(&path)).unwrap();
        assert_eq!(config.log_filter, "warn");
        assert!(TesseraConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
