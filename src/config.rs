//! Configuration management for convstore
//!
//! Storage configuration is loaded from an optional YAML file, then
//! overridden by environment variables. The defaults point every backend
//! at a per-user data directory.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Environment variable overriding the configured backend
pub const ENV_STORE_BACKEND: &str = "CONVSTORE_STORE_BACKEND";

/// Environment variable overriding the base storage path
pub const ENV_BASE_PATH: &str = "CONVSTORE_BASE_PATH";

/// Which storage backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Embedded ordered key-value store (one database directory)
    Sled,
    /// WAL-mode SQLite database (default)
    #[default]
    Sqlite,
    /// One JSON file per conversation with an in-memory cache
    Json,
}

impl StorageBackend {
    fn parse(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "sled" => Ok(Self::Sled),
            "sqlite" => Ok(Self::Sqlite),
            "json" => Ok(Self::Json),
            other => Err(StoreError::Config(format!(
                "unknown storage backend: {} (expected sled, sqlite, or json)",
                other
            ))
            .into()),
        }
    }
}

/// Storage configuration
///
/// # Examples
///
/// ```
/// use convstore::config::{StorageBackend, StorageConfig};
///
/// let config = StorageConfig {
///     backend: StorageBackend::Sqlite,
///     base_path: "/tmp/conversations".into(),
/// };
/// assert_eq!(config.backend, StorageBackend::Sqlite);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend selected by the factory
    pub backend: StorageBackend,
    /// Base directory holding the database file or conversation files
    pub base_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            base_path: default_base_path(),
        }
    }
}

impl StorageConfig {
    /// Load configuration from a YAML file, then apply env overrides
    ///
    /// A missing file is not an error; defaults are used instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed,
    /// or if an environment override names an unknown backend.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            tracing::debug!("config file not found at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env_vars()?;
        Ok(config)
    }

    /// Build the default configuration with env overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_vars()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(StoreError::Io)?;
        let config = serde_yaml::from_str(&contents).map_err(StoreError::Yaml)?;
        Ok(config)
    }

    fn apply_env_vars(&mut self) -> Result<()> {
        if let Ok(backend) = std::env::var(ENV_STORE_BACKEND) {
            self.backend = StorageBackend::parse(&backend)?;
        }

        if let Ok(base_path) = std::env::var(ENV_BASE_PATH) {
            self.base_path = PathBuf::from(base_path);
        }

        Ok(())
    }
}

/// Default base directory for conversation storage
///
/// Uses the platform data directory; falls back to a relative path when
/// no home directory can be determined.
pub fn default_base_path() -> PathBuf {
    match ProjectDirs::from("com", "xbcsmith", "convstore") {
        Some(dirs) => dirs.data_dir().join("conversations"),
        None => PathBuf::from(".convstore/conversations"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::tempdir;

    fn clear_env() {
        env::remove_var(ENV_STORE_BACKEND);
        env::remove_var(ENV_BASE_PATH);
    }

    #[test]
    #[serial]
    fn test_default_config() {
        clear_env();
        let config = StorageConfig::from_env().expect("from_env");
        assert_eq!(config.backend, StorageBackend::Sqlite);
        assert_eq!(config.base_path, default_base_path());
    }

    #[test]
    #[serial]
    fn test_load_missing_file_uses_defaults() {
        clear_env();
        let config = StorageConfig::load("/nonexistent/convstore.yaml").expect("load");
        assert_eq!(config, StorageConfig::default());
    }

    #[test]
    #[serial]
    fn test_load_from_yaml_file() {
        clear_env();
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "backend: sled\nbase_path: /tmp/conv-test\n").expect("write");

        let config = StorageConfig::load(&path).expect("load");
        assert_eq!(config.backend, StorageBackend::Sled);
        assert_eq!(config.base_path, PathBuf::from("/tmp/conv-test"));
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        clear_env();
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "backend: sled\n").expect("write");

        env::set_var(ENV_STORE_BACKEND, "json");
        env::set_var(ENV_BASE_PATH, "/tmp/conv-env");

        let config = StorageConfig::load(&path).expect("load");
        assert_eq!(config.backend, StorageBackend::Json);
        assert_eq!(config.base_path, PathBuf::from("/tmp/conv-env"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_unknown_backend_env_is_an_error() {
        clear_env();
        env::set_var(ENV_STORE_BACKEND, "postgres");
        let result = StorageConfig::from_env();
        assert!(result.is_err());
        clear_env();
    }

    #[test]
    fn test_backend_parse_is_case_insensitive() {
        assert_eq!(
            StorageBackend::parse("SQLite").expect("parse"),
            StorageBackend::Sqlite
        );
    }
}
