//! Recorder configuration, loaded from TOML and overridden on the command line.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::cache::{CacheBackend, DirectoryKeyValueStore, KeyPattern, KeyValueBackend, RemoteListingBackend};
use crate::home::{LoadOptions, OutputRepresentation, SaveOptions};
use crate::manifest::DEFAULT_MANIFEST_ENTRY;

pub const DEFAULT_KEY_PREFIX: &str = "homearc.resource.";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("compression level {0} is out of range 0-9")]
    CompressionLevel(u32),
}

/// External cache store selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheConfig {
    /// Key/value files under a local directory
    Directory {
        path: PathBuf,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
    /// JSON listing served over HTTP
    Remote {
        listing_url: String,
        resource_base: String,
    },
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub manifest_entry: String,
    pub compression_level: u32,
    pub include_all_content: bool,
    pub use_worker: bool,
    pub representation: OutputRepresentation,
    pub normalize_quotes: bool,
    pub extract_to_cache: bool,
    pub cache: Option<CacheConfig>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            manifest_entry: DEFAULT_MANIFEST_ENTRY.to_string(),
            compression_level: 6,
            include_all_content: false,
            use_worker: false,
            representation: OutputRepresentation::Bytes,
            normalize_quotes: true,
            extract_to_cache: false,
            cache: None,
        }
    }
}

impl RecorderConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    pub fn load_from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.compression_level > 9 {
            return Err(ConfigError::CompressionLevel(self.compression_level));
        }
        Ok(())
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            manifest_entry: self.manifest_entry.clone(),
            normalize_quotes: self.normalize_quotes,
            extract_to_cache: self.extract_to_cache,
        }
    }

    pub fn save_options(&self) -> SaveOptions {
        SaveOptions {
            manifest_entry: self.manifest_entry.clone(),
            compression_level: self.compression_level,
            include_all_content: self.include_all_content,
            use_worker: self.use_worker,
            representation: self.representation,
        }
    }

    /// Build the configured cache backend, if any
    pub fn cache_backend(&self, client: &reqwest::Client) -> Option<Arc<dyn CacheBackend>> {
        let backend: Arc<dyn CacheBackend> = match self.cache.as_ref()? {
            CacheConfig::Directory { path, key_prefix } => Arc::new(KeyValueBackend::new(
                "dir",
                DirectoryKeyValueStore::new(path.clone()),
                KeyPattern::with_prefix(key_prefix),
            )),
            CacheConfig::Remote {
                listing_url,
                resource_base,
            } => Arc::new(RemoteListingBackend::new(
                "remote",
                client.clone(),
                listing_url.clone(),
                resource_base.clone(),
            )),
        };
        Some(backend)
    }
}
