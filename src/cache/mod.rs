//! Pluggable stores of previously digested resources.
//!
//! Every backend answers the same question, "which (name, digest) pairs do
//! you hold", so that a load can substitute cached copies for archive
//! entries without hashing the cached side again, and can move unresolved
//! entries out of the container.
//!
//! - [`KeyValueBackend`]: string keys matched by a [`KeyPattern`], data-URL values
//! - [`RecordBackend`]: cursor-iterated records of a named database and object store
//! - [`RemoteListingBackend`]: a JSON listing served over HTTP

mod key_value;
mod record;
mod remote;

pub use key_value::{DirectoryKeyValueStore, KeyValueBackend, KeyValueStore, MemoryKeyValueStore};
pub use record::{MemoryRecordStore, Record, RecordBackend, RecordCursor, RecordStore};
pub use remote::RemoteListingBackend;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{ArchiveError, Result};

/// A (name, digest) pair held by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedDigest {
    pub name: String,
    pub digest: Digest,
}

/// External store of digested resources
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short identifier used in `cache://<id>/<name>` URLs
    fn id(&self) -> &str;

    /// Every (name, digest) pair currently held
    async fn list_digests(&self) -> Result<Vec<CachedDigest>>;

    /// Bytes stored under `name`
    async fn read(&self, name: &str) -> Result<Vec<u8>>;

    /// Store `data` under `name` along with its digest
    async fn store(&self, name: &str, digest: &Digest, data: &[u8]) -> Result<()>;

    /// URL serving `name` directly, for backends reachable over HTTP
    fn content_url(&self, _name: &str) -> Option<String> {
        None
    }

    /// Whether the store can be reached from the background save worker
    fn available_in_worker(&self) -> bool {
        true
    }
}

pub(crate) fn backend_error(message: impl std::fmt::Display) -> ArchiveError {
    ArchiveError::CacheBackend(message.to_string())
}

/// Maps store keys to logical names through a regex with one capture group
#[derive(Debug, Clone)]
pub struct KeyPattern {
    prefix: String,
    regex: Regex,
}

impl KeyPattern {
    /// Keys made of `prefix` followed by the name
    pub fn with_prefix(prefix: &str) -> Self {
        let regex = Regex::new(&format!("^{}(.+)$", regex::escape(prefix)))
            .unwrap_or_else(|_| unreachable!("escaped prefix is a valid pattern"));
        Self {
            prefix: prefix.to_string(),
            regex,
        }
    }

    /// Custom matching; new keys are still written as `prefix` + name
    pub fn new(prefix: &str, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(backend_error)?;
        if regex.captures_len() != 2 {
            return Err(backend_error(format!(
                "key pattern {pattern} must have exactly one capturing group"
            )));
        }
        Ok(Self {
            prefix: prefix.to_string(),
            regex,
        })
    }

    pub fn name_of(&self, key: &str) -> Option<String> {
        self.regex
            .captures(key)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }

    pub fn key_for(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

/// Decoded `data:` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    pub media_type: String,
    pub digest: Option<Digest>,
    pub data: Vec<u8>,
}

/// Encode `data:<media type>;digest=<digest>;base64,<payload>`
pub fn encode_data_url(media_type: &str, digest: &Digest, data: &[u8]) -> String {
    format!(
        "data:{};digest={};base64,{}",
        media_type,
        digest,
        STANDARD.encode(data)
    )
}

pub fn parse_data_url(url: &str) -> Result<DataUrl> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| backend_error("value is not a data URL"))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| backend_error("data URL without payload"))?;

    let mut params = header.split(';');
    let media_type = params.next().unwrap_or_default().to_string();
    let mut digest = None;
    let mut base64 = false;
    for param in params {
        match param.split_once('=') {
            Some(("digest", value)) => digest = Some(Digest::new(value)),
            None if param == "base64" => base64 = true,
            _ => {}
        }
    }

    let data = if base64 {
        STANDARD.decode(payload).map_err(backend_error)?
    } else {
        payload.as_bytes().to_vec()
    };
    Ok(DataUrl {
        media_type,
        digest,
        data,
    })
}
