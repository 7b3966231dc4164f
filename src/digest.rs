//! Content digests and the digest manager.
//!
//! A [`Digest`] is the base64 form of a hash over a resource's significant
//! bytes. Two resources with the same digest are interchangeable: the
//! manager never compares their bytes again.
//!
//! ## Multi-part resources
//!
//! An archive entry inside a directory stands for the whole directory. Its
//! digest covers every entry under the directory prefix, concatenated in
//! descending name order, leaving out `LICENSE.TXT` files. Digests already
//! stored alongside saved homes were computed this way, so the order and the
//! exclusion must not change.
//!
//! ## Cache lifetime
//!
//! Entries are created on first use and never evicted.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::content::{ContentReference, ContentSource};
use crate::error::{ArchiveError, Result};
use crate::fetch::ContentFetcher;

/// Base64-encoded content hash
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn from_hash(hash: &[u8]) -> Self {
        Self(STANDARD.encode(hash))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HashAlgorithm::Sha1 => "SHA-1",
            HashAlgorithm::Sha256 => "SHA-256",
        })
    }
}

#[derive(Error, Debug)]
#[error("hash algorithm {0} is not available")]
pub struct UnsupportedAlgorithm(pub HashAlgorithm);

/// Hashing backend. Providers may refuse an algorithm.
pub trait HashProvider: Send + Sync {
    fn hash(&self, algorithm: HashAlgorithm, data: &[u8]) -> Result<Vec<u8>, UnsupportedAlgorithm>;
}

/// Provider backed by the RustCrypto hashes
#[derive(Debug, Default, Clone, Copy)]
pub struct RustCryptoHasher;

impl HashProvider for RustCryptoHasher {
    fn hash(&self, algorithm: HashAlgorithm, data: &[u8]) -> Result<Vec<u8>, UnsupportedAlgorithm> {
        Ok(match algorithm {
            HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        })
    }
}

/// Digest `data` with SHA-1, or SHA-256 when the provider refuses SHA-1
pub fn digest_bytes(provider: &dyn HashProvider, data: &[u8]) -> Result<Digest> {
    match provider.hash(HashAlgorithm::Sha1, data) {
        Ok(hash) => Ok(Digest::from_hash(&hash)),
        Err(refused) => {
            tracing::debug!(error = %refused, "Falling back to SHA-256");
            provider
                .hash(HashAlgorithm::Sha256, data)
                .map(|hash| Digest::from_hash(&hash))
                .map_err(|e| ArchiveError::Digest {
                    status: 0,
                    message: e.to_string(),
                })
        }
    }
}

/// Whether an entry is a license file left out of multi-part digests
pub fn is_license_entry(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    upper == "LICENSE.TXT" || upper.ends_with("/LICENSE.TXT")
}

#[derive(Default)]
struct DigestState {
    digests: HashMap<String, Arc<OnceCell<Digest>>>,
    permanent: HashMap<Digest, ContentReference>,
}

/// Computes digests once per URL and tracks canonical resources
///
/// One manager is meant to live for the whole process and be shared by the
/// reader and the writer.
pub struct DigestManager {
    fetcher: Arc<dyn ContentFetcher>,
    hasher: Arc<dyn HashProvider>,
    state: Mutex<DigestState>,
}

impl DigestManager {
    pub fn new(fetcher: Arc<dyn ContentFetcher>) -> Self {
        Self::with_hasher(fetcher, Arc::new(RustCryptoHasher))
    }

    pub fn with_hasher(fetcher: Arc<dyn ContentFetcher>, hasher: Arc<dyn HashProvider>) -> Self {
        Self {
            fetcher,
            hasher,
            state: Mutex::new(DigestState::default()),
        }
    }

    pub fn fetcher(&self) -> &Arc<dyn ContentFetcher> {
        &self.fetcher
    }

    fn state(&self) -> MutexGuard<'_, DigestState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cell(&self, url: &str) -> Arc<OnceCell<Digest>> {
        self.state()
            .digests
            .entry(url.to_string())
            .or_default()
            .clone()
    }

    /// Digest of `content`, computed on first request.
    ///
    /// Concurrent requests for the same URL share one computation. A failed
    /// computation is not cached and may be retried.
    pub async fn digest_of(&self, content: &ContentReference) -> Result<Digest> {
        let cell = self.cell(content.url());
        let digest = cell
            .get_or_try_init(|| async {
                let digest = self.compute(content).await.map_err(|e| {
                    let e = e.into_digest_error();
                    tracing::debug!(url = %content.url(), error = %e, "Digest computation failed");
                    e
                })?;
                tracing::debug!(url = %content.url(), digest = %digest, "Computed digest");
                Ok::<_, ArchiveError>(digest)
            })
            .await?;
        Ok(digest.clone())
    }

    /// Already computed digest of `content`, if any
    pub fn cached_digest(&self, content: &ContentReference) -> Option<Digest> {
        self.state()
            .digests
            .get(content.url())
            .and_then(|cell| cell.get().cloned())
    }

    /// Record a digest known from elsewhere, such as a cache backend listing.
    /// An existing digest for the same URL is kept.
    pub fn set_digest(&self, content: &ContentReference, digest: Digest) {
        let cell = self.cell(content.url());
        let _ = cell.set(digest);
    }

    /// True only when both digests are cached and equal. Never computes.
    pub fn equals(&self, a: &ContentReference, b: &ContentReference) -> bool {
        match (self.cached_digest(a), self.cached_digest(b)) {
            (Some(da), Some(db)) => da == db,
            _ => false,
        }
    }

    /// Make `content` the canonical resource for `digest`
    pub fn register_permanent(&self, content: &ContentReference, digest: Digest) {
        self.set_digest(content, digest.clone());
        self.state().permanent.insert(digest, content.clone());
    }

    /// Register `content` for `digest` unless a canonical resource exists.
    /// Returns whether it was registered.
    pub fn offer_substitute(&self, content: &ContentReference, digest: Digest) -> bool {
        self.set_digest(content, digest.clone());
        let mut state = self.state();
        if state.permanent.contains_key(&digest) {
            return false;
        }
        state.permanent.insert(digest, content.clone());
        true
    }

    /// Canonical resource sharing the cached digest of `content`
    pub fn find_permanent(&self, content: &ContentReference) -> Option<ContentReference> {
        let digest = self.cached_digest(content)?;
        self.state().permanent.get(&digest).cloned()
    }

    pub fn has_permanent_contents(&self) -> bool {
        !self.state().permanent.is_empty()
    }

    /// Number of URLs with a computed digest
    pub fn cached_count(&self) -> usize {
        self.state()
            .digests
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    async fn compute(&self, content: &ContentReference) -> Result<Digest> {
        let data = match content.source() {
            ContentSource::ArchiveDirectory { archive, .. } => {
                let prefix = content.directory_prefix().unwrap_or_default();
                let archive = self.fetcher.open_archive(archive).await?;
                let mut entries = archive.entries_under(prefix);
                entries.sort_by(|a, b| b.file_name.cmp(&a.file_name));

                let mut data = Vec::new();
                for entry in entries {
                    if is_license_entry(&entry.file_name) {
                        continue;
                    }
                    data.extend(archive.read_entry(entry).await?);
                }
                data
            }
            _ => self.fetcher.read_content(content).await?,
        };
        digest_bytes(self.hasher.as_ref(), &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ArchiveSource;
    use crate::fetch::DefaultFetcher;
    use crate::zip::{Archive, ZipWriter};
    use async_trait::async_trait;
    use sha2::Digest as _;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        inner: DefaultFetcher,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl ContentFetcher for CountingFetcher {
        async fn open_archive(&self, source: &ArchiveSource) -> Result<Arc<Archive>> {
            self.inner.open_archive(source).await
        }

        async fn read_content(&self, content: &ContentReference) -> Result<Vec<u8>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.inner.read_content(content).await
        }

        fn release_archive(&self, url: &str) -> bool {
            self.inner.release_archive(url)
        }
    }

    fn counting() -> Arc<CountingFetcher> {
        Arc::new(CountingFetcher {
            inner: DefaultFetcher::new().unwrap(),
            reads: AtomicUsize::new(0),
        })
    }

    struct NoSha1;

    impl HashProvider for NoSha1 {
        fn hash(&self, algorithm: HashAlgorithm, data: &[u8]) -> Result<Vec<u8>, UnsupportedAlgorithm> {
            match algorithm {
                HashAlgorithm::Sha1 => Err(UnsupportedAlgorithm(algorithm)),
                other => RustCryptoHasher.hash(other, data),
            }
        }
    }

    fn multi_part_archive(name: &str, license: &[u8]) -> ArchiveSource {
        let mut writer = ZipWriter::new(6);
        writer.add_entry("Home.xml", b"<home/>").unwrap();
        writer.add_entry("1/a.png", b"AAAA").unwrap();
        writer.add_entry("1/b.png", b"BBBB").unwrap();
        writer.add_entry("1/LICENSE.TXT", license).unwrap();
        writer.add_entry("2/other.png", b"CCCC").unwrap();
        ArchiveSource::memory(name, writer.finish().unwrap())
    }

    #[tokio::test]
    async fn digest_is_computed_once() {
        let fetcher = counting();
        let manager = DigestManager::new(fetcher.clone());
        let content = ContentReference::blob(b"texture".to_vec());

        let (first, second) = tokio::join!(manager.digest_of(&content), manager.digest_of(&content));
        let third = manager.digest_of(&content).await.unwrap();

        assert_eq!(first.unwrap(), third);
        assert_eq!(second.unwrap(), third);
        assert_eq!(fetcher.reads.load(Ordering::SeqCst), 1);
        assert_eq!(third, Digest::from_hash(&Sha1::digest(b"texture")));
    }

    #[tokio::test]
    async fn equals_never_computes() {
        let fetcher = counting();
        let manager = DigestManager::new(fetcher.clone());
        let a = ContentReference::blob(b"same".to_vec());
        let b = ContentReference::blob(b"same".to_vec());

        assert!(!manager.equals(&a, &b));
        assert_eq!(fetcher.reads.load(Ordering::SeqCst), 0);

        manager.digest_of(&a).await.unwrap();
        assert!(!manager.equals(&a, &b));
        manager.digest_of(&b).await.unwrap();
        assert!(manager.equals(&a, &b));
    }

    #[tokio::test]
    async fn multi_part_digest_concatenates_descending_without_license() {
        let manager = DigestManager::new(Arc::new(DefaultFetcher::new().unwrap()));
        let first = ContentReference::archive_entry(multi_part_archive("one", b"MIT"), "1/a.png");
        let digest = manager.digest_of(&first).await.unwrap();
        assert_eq!(digest, Digest::from_hash(&Sha1::digest(b"BBBBAAAA")));

        let changed_license =
            ContentReference::archive_entry(multi_part_archive("two", b"GPL"), "1/b.png");
        assert_eq!(manager.digest_of(&changed_license).await.unwrap(), digest);
    }

    #[tokio::test]
    async fn sha256_fallback_is_stable() {
        let fetcher = Arc::new(DefaultFetcher::new().unwrap());
        let content = ContentReference::blob(b"model".to_vec());

        let first = DigestManager::with_hasher(fetcher.clone(), Arc::new(NoSha1));
        let second = DigestManager::with_hasher(fetcher, Arc::new(NoSha1));
        let digest = first.digest_of(&content).await.unwrap();

        assert_eq!(digest, second.digest_of(&content).await.unwrap());
        assert_eq!(digest, Digest::from_hash(&Sha256::digest(b"model")));
    }

    #[tokio::test]
    async fn failures_are_digest_errors_and_not_cached() {
        let manager = DigestManager::new(Arc::new(DefaultFetcher::new().unwrap()));
        let missing = ContentReference::file("/nonexistent/homearc/icon.png");

        let err = manager.digest_of(&missing).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Digest { status: 0, .. }));
        assert!(manager.cached_digest(&missing).is_none());
        assert_eq!(manager.cached_count(), 0);
    }

    #[tokio::test]
    async fn permanent_content_found_by_digest() {
        let manager = DigestManager::new(Arc::new(DefaultFetcher::new().unwrap()));
        let catalog = ContentReference::remote("https://catalog/chair.png");
        let loaded = ContentReference::blob(b"chair".to_vec());
        let digest = Digest::from_hash(&Sha1::digest(b"chair"));

        manager.register_permanent(&catalog, digest.clone());
        assert!(manager.find_permanent(&loaded).is_none());

        manager.digest_of(&loaded).await.unwrap();
        assert_eq!(manager.find_permanent(&loaded), Some(catalog.clone()));

        let cached = ContentReference::blob(b"chair".to_vec());
        assert!(!manager.offer_substitute(&cached, digest));
        assert_eq!(manager.find_permanent(&loaded), Some(catalog));
    }

    #[test]
    fn license_names_match_case_insensitively() {
        assert!(is_license_entry("LICENSE.TXT"));
        assert!(is_license_entry("3/license.txt"));
        assert!(!is_license_entry("3/MYLICENSE.TXT"));
        assert!(!is_license_entry("3/LICENSE.TXT.bak"));
    }
}
