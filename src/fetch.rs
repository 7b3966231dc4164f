//! Byte access for content references and containers.
//!
//! [`DefaultFetcher`] opens each container once and keeps it keyed by URL
//! until released, so digesting several entries of one archive reuses a
//! single parsed Central Directory.

use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncReadExt;

use crate::content::{ArchiveSource, ContentReference, ContentSource};
use crate::error::{ArchiveError, Result};
use crate::io::{HttpRangeReader, LocalFileReader, ReadAt};
use crate::zip::Archive;

const FETCH_CHUNK_SIZE: usize = 64 * 1024;

/// Progress callback receiving a fraction in `0.0..=1.0`
pub type ProgressFn<'a> = &'a (dyn Fn(f64) + Send + Sync);

/// Reads the bytes behind content references
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Open a container, reusing an already opened one with the same URL
    async fn open_archive(&self, source: &ArchiveSource) -> Result<Arc<Archive>>;

    /// Raw bytes of a single resource
    async fn read_content(&self, content: &ContentReference) -> Result<Vec<u8>>;

    /// Fetch a whole container into memory, reporting progress, and keep it
    /// opened for later reads
    async fn fetch_container(
        &self,
        source: &ArchiveSource,
        progress: ProgressFn<'_>,
    ) -> Result<Arc<Archive>> {
        progress(0.0);
        let archive = self.open_archive(source).await?;
        progress(1.0);
        Ok(archive)
    }

    /// Forget an opened container. Returns whether it was held.
    fn release_archive(&self, url: &str) -> bool;
}

/// Fetcher over local files, HTTP and in-memory data
pub struct DefaultFetcher {
    client: Client,
    archives: Mutex<HashMap<String, Arc<Archive>>>,
}

impl DefaultFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            archives: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn archives(&self) -> MutexGuard<'_, HashMap<String, Arc<Archive>>> {
        self.archives.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cached_archive(&self, url: &str) -> Option<Arc<Archive>> {
        self.archives().get(url).cloned()
    }

    /// Keep `archive` opened, unless another task opened it first
    fn keep(&self, archive: Archive) -> Arc<Archive> {
        let mut archives = self.archives();
        archives
            .entry(archive.url().to_string())
            .or_insert_with(|| Arc::new(archive))
            .clone()
    }

    /// Number of containers currently held
    pub fn open_archives(&self) -> usize {
        self.archives().len()
    }

    async fn download(&self, url: &str, progress: ProgressFn<'_>) -> Result<Vec<u8>> {
        let mut resp = self.client.get(url).send().await?.error_for_status()?;
        let total = resp.content_length();
        let mut data = Vec::with_capacity(total.unwrap_or(0) as usize);
        while let Some(chunk) = resp.chunk().await? {
            data.extend_from_slice(&chunk);
            if let Some(total) = total.filter(|t| *t > 0) {
                progress((data.len() as f64 / total as f64).min(1.0));
            }
        }
        Ok(data)
    }

    async fn read_file(path: &std::path::Path, progress: ProgressFn<'_>) -> Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(path).await?;
        let total = file.metadata().await?.len();
        let mut data = Vec::with_capacity(total as usize);
        let mut chunk = vec![0u8; FETCH_CHUNK_SIZE];
        loop {
            let n = file.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..n]);
            if total > 0 {
                progress((data.len() as f64 / total as f64).min(1.0));
            }
        }
        Ok(data)
    }
}

fn container_error(url: &str, err: ArchiveError) -> ArchiveError {
    match err {
        e @ ArchiveError::ContainerRead { .. } => e,
        other => ArchiveError::ContainerRead {
            url: url.to_string(),
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl ContentFetcher for DefaultFetcher {
    async fn open_archive(&self, source: &ArchiveSource) -> Result<Arc<Archive>> {
        let url = source.url();
        if let Some(archive) = self.cached_archive(&url) {
            return Ok(archive);
        }

        let archive = match source {
            ArchiveSource::Path(path) => {
                let reader: Arc<dyn ReadAt> =
                    Arc::new(LocalFileReader::new(path).map_err(|e| container_error(&url, e))?);
                Archive::open(url.clone(), reader).await?
            }
            ArchiveSource::Url(remote) => {
                let reader: Arc<dyn ReadAt> = Arc::new(
                    HttpRangeReader::new(self.client.clone(), remote.clone())
                        .await
                        .map_err(|e| container_error(&url, e))?,
                );
                Archive::open(url.clone(), reader).await?
            }
            ArchiveSource::Memory { data, .. } => Archive::from_bytes(url.clone(), data.clone()).await?,
            ArchiveSource::Nested { outer, entry } => {
                let outer = self.open_archive(outer).await?;
                let data = outer.read(entry).await.map_err(|e| container_error(&url, e))?;
                Archive::from_bytes(url.clone(), data).await?
            }
        };

        tracing::debug!(url = %url, entries = archive.entries().len(), "Opened container");
        Ok(self.keep(archive))
    }

    async fn read_content(&self, content: &ContentReference) -> Result<Vec<u8>> {
        let read_error = |e: ArchiveError| ArchiveError::ResourceRead {
            url: content.url().to_string(),
            message: e.to_string(),
        };

        match content.source() {
            ContentSource::File(path) => tokio::fs::read(path)
                .await
                .map_err(|e| read_error(e.into())),
            ContentSource::Remote(url) => {
                let resp = self.client.get(url).send().await?.error_for_status()?;
                Ok(resp.bytes().await?.to_vec())
            }
            ContentSource::Blob(data) => Ok(data.to_vec()),
            ContentSource::ArchiveEntry { archive, entry }
            | ContentSource::ArchiveDirectory { archive, entry } => {
                let archive = self.open_archive(archive).await?;
                archive.read(entry).await
            }
            ContentSource::Cached { backend, name } => {
                backend.read(name).await.map_err(read_error)
            }
        }
    }

    async fn fetch_container(
        &self,
        source: &ArchiveSource,
        progress: ProgressFn<'_>,
    ) -> Result<Arc<Archive>> {
        let url = source.url();
        progress(0.0);
        if let Some(archive) = self.cached_archive(&url) {
            progress(1.0);
            return Ok(archive);
        }

        let data = match source {
            ArchiveSource::Path(path) => Self::read_file(path, progress).await,
            ArchiveSource::Url(remote) => self.download(remote, progress).await,
            ArchiveSource::Memory { .. } | ArchiveSource::Nested { .. } => {
                let archive = self.open_archive(source).await?;
                progress(1.0);
                return Ok(archive);
            }
        }
        .map_err(|e| container_error(&url, e))?;

        progress(1.0);
        let archive = Archive::from_bytes(url, data).await?;
        Ok(self.keep(archive))
    }

    fn release_archive(&self, url: &str) -> bool {
        self.archives().remove(url).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::jar_url;
    use crate::zip::ZipWriter;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_zip() -> Vec<u8> {
        let mut writer = ZipWriter::new(6);
        writer.add_entry("Home.xml", b"<home/>").unwrap();
        writer.add_entry("0", b"icon bytes").unwrap();
        writer.finish().unwrap()
    }

    #[tokio::test]
    async fn file_container_reports_progress_and_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("house.sh3d");
        std::fs::write(&path, sample_zip()).unwrap();

        let fetcher = DefaultFetcher::new().unwrap();
        let source = ArchiveSource::Path(path);
        let calls = AtomicUsize::new(0);
        let last = Mutex::new(-1.0f64);
        let report = |fraction: f64| {
            calls.fetch_add(1, Ordering::SeqCst);
            let mut last = last.lock().unwrap();
            assert!(fraction >= *last);
            *last = fraction;
        };
        let archive = fetcher.fetch_container(&source, &report).await.unwrap();

        assert_eq!(*last.lock().unwrap(), 1.0);
        assert!(calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(archive.read("0").await.unwrap(), b"icon bytes");
        assert_eq!(fetcher.open_archives(), 1);

        let content = ContentReference::archive_entry(source.clone(), "0");
        assert_eq!(fetcher.read_content(&content).await.unwrap(), b"icon bytes");
        assert!(fetcher.release_archive(&source.url()));
        assert_eq!(fetcher.open_archives(), 0);
    }

    #[tokio::test]
    async fn nested_containers_open_through_outer_entry() {
        let mut outer = ZipWriter::new(0);
        outer.add_entry("inner.sh3d", &sample_zip()).unwrap();
        let outer = ArchiveSource::memory("catalog", outer.finish().unwrap());
        let nested = ArchiveSource::parse(&jar_url(&outer.url(), "inner.sh3d"));
        assert!(nested.is_err());
        let expected = jar_url(&outer.url(), "inner.sh3d");

        let nested = ArchiveSource::Nested {
            outer: Box::new(outer),
            entry: "inner.sh3d".to_string(),
        };
        let fetcher = DefaultFetcher::new().unwrap();
        let archive = fetcher.open_archive(&nested).await.unwrap();
        assert_eq!(archive.url(), expected);
        assert_eq!(archive.read("Home.xml").await.unwrap(), b"<home/>");
    }

    #[tokio::test]
    async fn missing_file_is_a_resource_error() {
        let fetcher = DefaultFetcher::new().unwrap();
        let content = ContentReference::file("/nonexistent/homearc/texture.png");
        assert!(matches!(
            fetcher.read_content(&content).await,
            Err(ArchiveError::ResourceRead { .. })
        ));
    }
}
