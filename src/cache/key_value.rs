use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use super::{CacheBackend, CachedDigest, KeyPattern, backend_error, encode_data_url, parse_data_url};
use crate::digest::Digest;
use crate::error::Result;

/// String key/value storage engine
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn keys(&self) -> Result<Vec<String>>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.values().keys().cloned().collect())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.values().insert(key.to_string(), value);
        Ok(())
    }
}

/// One file per key under a directory; file names are the URL-safe base64
/// of the key so any key maps to a valid name
#[derive(Debug, Clone)]
pub struct DirectoryKeyValueStore {
    dir: PathBuf,
}

impl DirectoryKeyValueStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(URL_SAFE_NO_PAD.encode(key))
    }
}

#[async_trait]
impl KeyValueStore for DirectoryKeyValueStore {
    async fn keys(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(key) = URL_SAFE_NO_PAD
                .decode(file_name)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.path_for(key), value).await?;
        Ok(())
    }
}

/// Cache backend over a [`KeyValueStore`] holding data URLs
pub struct KeyValueBackend<S> {
    id: String,
    store: S,
    pattern: KeyPattern,
    media_type: String,
}

impl<S: KeyValueStore> KeyValueBackend<S> {
    pub fn new(id: impl Into<String>, store: S, pattern: KeyPattern) -> Self {
        Self {
            id: id.into(),
            store,
            pattern,
            media_type: "application/octet-stream".to_string(),
        }
    }
}

#[async_trait]
impl<S: KeyValueStore> CacheBackend for KeyValueBackend<S> {
    fn id(&self) -> &str {
        &self.id
    }

    async fn list_digests(&self) -> Result<Vec<CachedDigest>> {
        let mut listed = Vec::new();
        for key in self.store.keys().await? {
            let Some(name) = self.pattern.name_of(&key) else {
                continue;
            };
            let Some(value) = self.store.get(&key).await? else {
                continue;
            };
            match parse_data_url(&value) {
                Ok(parsed) => match parsed.digest {
                    Some(digest) => listed.push(CachedDigest { name, digest }),
                    None => tracing::debug!(key = %key, "Cached value has no digest, skipping"),
                },
                Err(e) => tracing::warn!(key = %key, error = %e, "Unreadable cached value"),
            }
        }
        Ok(listed)
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        let key = self.pattern.key_for(name);
        let value = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| backend_error(format!("no value for key {key}")))?;
        Ok(parse_data_url(&value)?.data)
    }

    async fn store(&self, name: &str, digest: &Digest, data: &[u8]) -> Result<()> {
        let value = encode_data_url(&self.media_type, digest, data);
        self.store.set(&self.pattern.key_for(name), value).await
    }
}
