//! Load pipeline: fetch, parse, substitute and optionally move resources
//! out of the container.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;

use super::LoadPhase;
use crate::cache::{CacheBackend, CachedDigest};
use crate::content::{ArchiveSource, ContentReference, split_jar_url};
use crate::digest::DigestManager;
use crate::error::{ArchiveError, Result};
use crate::graph::HomeGraph;
use crate::manifest::{DEFAULT_MANIFEST_ENTRY, ManifestParser, ManifestSchema};
use crate::walker::{CollectAll, ContentVisitor, GraphWalker, ReplaceByUrl, TransientFields};

/// Progress callback receiving the phase and a fraction in `0.0..=1.0`
pub type PhaseProgress<'a> = &'a (dyn Fn(LoadPhase, f64) + Send + Sync);

#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Manifest entry used when the URL does not name one
    pub manifest_entry: String,
    pub normalize_quotes: bool,
    /// Move unresolved resources to the cache backend
    pub extract_to_cache: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            manifest_entry: DEFAULT_MANIFEST_ENTRY.to_string(),
            normalize_quotes: true,
            extract_to_cache: false,
        }
    }
}

/// A parsed home with its content references resolved
#[derive(Debug, Clone)]
pub struct LoadedHome {
    pub url: String,
    pub graph: HomeGraph,
    /// Content references of the graph, in first-encounter order
    pub contents: Vec<ContentReference>,
    /// Whether the container was released because nothing points into it
    pub released: bool,
}

/// Accepts references stored in one container
struct InArchive<'a> {
    url: &'a str,
}

impl ContentVisitor for InArchive<'_> {
    fn accept(&mut self, content: &ContentReference) -> bool {
        content.archive().is_some_and(|a| a.url() == self.url)
    }
}

pub struct ArchiveReader {
    digests: Arc<DigestManager>,
    schema: ManifestSchema,
    transient: TransientFields,
    backend: Option<Arc<dyn CacheBackend>>,
    options: LoadOptions,
}

impl ArchiveReader {
    pub fn new(digests: Arc<DigestManager>) -> Self {
        Self {
            digests,
            schema: ManifestSchema::default(),
            transient: TransientFields::home_defaults(),
            backend: None,
            options: LoadOptions::default(),
        }
    }

    pub fn with_backend(mut self, backend: Option<Arc<dyn CacheBackend>>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_schema(mut self, schema: ManifestSchema, transient: TransientFields) -> Self {
        self.schema = schema;
        self.transient = transient;
        self
    }

    pub fn digests(&self) -> &Arc<DigestManager> {
        &self.digests
    }

    /// Container and manifest entry named by `url`
    ///
    /// `jar:<archive>!/<entry>` names the manifest entry explicitly; any
    /// other URL names a container read with the default entry.
    pub fn resolve(&self, url: &str) -> Result<(ArchiveSource, String)> {
        match split_jar_url(url) {
            Some((archive, entry)) => Ok((ArchiveSource::parse(archive)?, entry.to_string())),
            None => Ok((ArchiveSource::parse(url)?, self.options.manifest_entry.clone())),
        }
    }

    pub async fn read(&self, url: &str, progress: PhaseProgress<'_>) -> Result<LoadedHome> {
        let (source, entry) = self.resolve(url)?;
        self.read_source(&source, &entry, progress).await
    }

    pub async fn read_source(
        &self,
        source: &ArchiveSource,
        entry: &str,
        progress: PhaseProgress<'_>,
    ) -> Result<LoadedHome> {
        let archive_url = source.url();
        let fetcher = self.digests.fetcher().clone();

        let archive = fetcher
            .fetch_container(source, &|f| progress(LoadPhase::FetchContainer, f))
            .await?;
        if archive.entry(entry).is_none() {
            return Err(ArchiveError::ManifestMissing {
                archive: archive_url,
                entry: entry.to_string(),
            });
        }
        let data = archive
            .read(entry)
            .await
            .map_err(|e| ArchiveError::ContainerRead {
                url: archive_url.clone(),
                message: e.to_string(),
            })?;
        let mut graph = ManifestParser::new(&self.schema)
            .normalize_quotes(self.options.normalize_quotes)
            .parse(&data, source, &|f| progress(LoadPhase::ParseManifest, f))?;

        if let Some(backend) = &self.backend {
            self.seed_from_backend(backend).await;
        }

        if self.digests.has_permanent_contents() || self.backend.is_some() {
            let unresolved = self.substitute(&mut graph, &archive_url).await;
            if self.options.extract_to_cache
                && let Some(backend) = &self.backend
                && !unresolved.is_empty()
            {
                self.extract_to_cache(&mut graph, backend, unresolved).await;
            }
        }

        let walker = GraphWalker::new(&self.transient);
        let contents = walker.collect_from_root(&mut graph, &mut CollectAll).into_vec();
        let released = !contents
            .iter()
            .any(|c| c.archive().is_some_and(|a| a.url() == archive_url))
            && fetcher.release_archive(&archive_url);
        if released {
            tracing::debug!(url = %archive_url, "Released container");
        }

        Ok(LoadedHome {
            url: archive_url,
            graph,
            contents,
            released,
        })
    }

    /// Offer every cached pair as a substitute. Failures are tolerated.
    async fn seed_from_backend(&self, backend: &Arc<dyn CacheBackend>) {
        match backend.list_digests().await {
            Ok(listed) => {
                tracing::debug!(backend = backend.id(), count = listed.len(), "Listed cached digests");
                for CachedDigest { name, digest } in listed {
                    let cached = ContentReference::cached(backend.clone(), name);
                    self.digests.offer_substitute(&cached, digest);
                }
            }
            Err(e) => {
                tracing::warn!(backend = backend.id(), error = %e, "Cannot list cached digests");
            }
        }
    }

    /// Replace references of the container by their permanent substitute.
    /// Returns the references left unresolved.
    async fn substitute(&self, graph: &mut HomeGraph, archive_url: &str) -> Vec<ContentReference> {
        let walker = GraphWalker::new(&self.transient);
        let collected = walker
            .collect_from_root(graph, &mut InArchive { url: archive_url })
            .into_vec();

        let digests = join_all(collected.iter().map(|c| self.digests.digest_of(c))).await;

        let mut replacements = HashMap::new();
        let mut unresolved = Vec::new();
        for (content, digest) in collected.into_iter().zip(digests) {
            if let Err(e) = digest {
                tracing::warn!(url = %content.url(), error = %e, "Cannot digest resource");
                unresolved.push(content);
                continue;
            }
            match self.digests.find_permanent(&content) {
                Some(permanent) if permanent != content => {
                    tracing::debug!(url = %content.url(), by = %permanent.url(), "Substituted resource");
                    replacements.insert(content.url().to_string(), permanent);
                }
                _ => unresolved.push(content),
            }
        }

        if !replacements.is_empty() {
            walker.collect_from_root(graph, &mut ReplaceByUrl { replacements: &replacements });
        }
        unresolved
    }

    /// Store each unresolved single-entry resource in `backend` under a
    /// fresh name and point the graph at the stored copy. Best effort.
    async fn extract_to_cache(
        &self,
        graph: &mut HomeGraph,
        backend: &Arc<dyn CacheBackend>,
        unresolved: Vec<ContentReference>,
    ) {
        let fetcher = self.digests.fetcher();
        let extracted = join_all(
            unresolved
                .iter()
                .filter(|c| !c.is_multi_part())
                .map(|content| async move {
                    let digest = self.digests.cached_digest(content).ok_or_else(|| {
                        ArchiveError::CacheBackend(format!("{} has no digest", content.url()))
                    })?;
                    let data = fetcher.read_content(content).await?;
                    let name = uuid::Uuid::new_v4().to_string();
                    backend.store(&name, &digest, &data).await?;

                    let cached = ContentReference::cached(backend.clone(), name);
                    self.digests.offer_substitute(&cached, digest);
                    Ok::<_, ArchiveError>((content, cached))
                }),
        )
        .await;

        let mut replacements = HashMap::new();
        for result in extracted {
            match result {
                Ok((content, cached)) => {
                    replacements.insert(content.url().to_string(), cached);
                }
                Err(e) => tracing::warn!(backend = backend.id(), error = %e, "Cannot extract resource"),
            }
        }
        if !replacements.is_empty() {
            tracing::debug!(backend = backend.id(), count = replacements.len(), "Extracted resources");
            GraphWalker::new(&self.transient)
                .collect_from_root(graph, &mut ReplaceByUrl { replacements: &replacements });
        }
    }
}
