//! Save pipeline: collect, digest, deduplicate, serialize and zip.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::content::{ContentReference, ContentSource};
use crate::digest::{Digest, DigestManager};
use crate::error::{ArchiveError, Result};
use crate::graph::HomeGraph;
use crate::manifest::{DEFAULT_MANIFEST_ENTRY, ManifestSchema, ManifestWriter};
use crate::walker::{CollectAll, GraphWalker, TransientFields};
use crate::zip::ZipWriter;

/// Form in which a saved archive is handed back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputRepresentation {
    Base64,
    #[default]
    Bytes,
    Buffer,
    Blob,
}

#[derive(Debug, Clone)]
pub enum ArchiveOutput {
    Base64(String),
    Bytes(Vec<u8>),
    Buffer(Box<[u8]>),
    Blob(ContentReference),
}

impl ArchiveOutput {
    fn new(data: Vec<u8>, representation: OutputRepresentation) -> Self {
        match representation {
            OutputRepresentation::Base64 => ArchiveOutput::Base64(STANDARD.encode(&data)),
            OutputRepresentation::Bytes => ArchiveOutput::Bytes(data),
            OutputRepresentation::Buffer => ArchiveOutput::Buffer(data.into_boxed_slice()),
            OutputRepresentation::Blob => ArchiveOutput::Blob(ContentReference::blob(data)),
        }
    }

    /// Raw archive bytes, whatever the representation
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            ArchiveOutput::Base64(text) => STANDARD.decode(text).map_err(|e| ArchiveError::ResourceRead {
                url: "base64 output".to_string(),
                message: e.to_string(),
            }),
            ArchiveOutput::Bytes(data) => Ok(data.clone()),
            ArchiveOutput::Buffer(data) => Ok(data.to_vec()),
            ArchiveOutput::Blob(content) => match content.source() {
                ContentSource::Blob(data) => Ok(data.to_vec()),
                _ => Err(ArchiveError::ResourceRead {
                    url: content.url().to_string(),
                    message: "not an in-memory blob".to_string(),
                }),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct SaveOptions {
    pub manifest_entry: String,
    /// 0 stores entries, 1-9 deflates them
    pub compression_level: u32,
    /// Embed remote resources instead of writing their URL
    pub include_all_content: bool,
    pub use_worker: bool,
    pub representation: OutputRepresentation,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            manifest_entry: DEFAULT_MANIFEST_ENTRY.to_string(),
            compression_level: 6,
            include_all_content: false,
            use_worker: false,
            representation: OutputRepresentation::Bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SavedArchive {
    pub name: String,
    pub output: ArchiveOutput,
    /// Resource entries written besides the manifest
    pub resource_entries: usize,
    /// Output path of each embedded content URL
    pub paths: HashMap<String, String>,
}

/// One embedded resource and the output index it was given
struct Survivor {
    content: ContentReference,
    index: usize,
}

struct WorkerGuard(Arc<AtomicUsize>);

impl WorkerGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Worker task handle; the task is aborted when the handle is dropped
struct WorkerTask(JoinHandle<Result<SavedArchive>>);

impl Drop for WorkerTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ArchiveError::Aborted);
    }
    Ok(())
}

/// Output path of `content` stored under `index`: the bare index, or
/// `index/<remainder>` for an entry of a multi-part resource
fn output_path(content: &ContentReference, index: usize) -> String {
    match (content.directory_prefix(), content.entry_name()) {
        (Some(prefix), Some(entry)) => format!("{index}/{}", &entry[prefix.len()..]),
        _ => index.to_string(),
    }
}

/// Serializes a [`HomeGraph`] into a new container
#[derive(Clone)]
pub struct ArchiveWriter {
    digests: Arc<DigestManager>,
    schema: ManifestSchema,
    transient: TransientFields,
    workers: Arc<AtomicUsize>,
}

impl ArchiveWriter {
    pub fn new(digests: Arc<DigestManager>) -> Self {
        Self {
            digests,
            schema: ManifestSchema::default(),
            transient: TransientFields::home_defaults(),
            workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_schema(mut self, schema: ManifestSchema, transient: TransientFields) -> Self {
        self.schema = schema;
        self.transient = transient;
        self
    }

    pub fn digests(&self) -> &Arc<DigestManager> {
        &self.digests
    }

    /// Background save workers still alive
    pub fn running_workers(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }

    /// Save `graph` as the container `name`.
    ///
    /// With `use_worker`, the save runs on a spawned task and falls back to
    /// running here when the worker cannot reach some resource. Returns
    /// [`ArchiveError::Aborted`] once `cancel` fires; no partial archive is
    /// ever returned.
    pub async fn write(
        &self,
        graph: &HomeGraph,
        name: &str,
        options: &SaveOptions,
        cancel: &CancellationToken,
    ) -> Result<SavedArchive> {
        ensure_live(cancel)?;
        if options.use_worker {
            match self.write_in_worker(graph.clone(), name, options, cancel).await {
                Err(ArchiveError::WorkerUnavailable(reason)) => {
                    tracing::info!(name, %reason, "Worker unavailable, saving in process");
                }
                other => return other,
            }
        }
        self.assemble(graph.clone(), name, options, cancel, false).await
    }

    async fn write_in_worker(
        &self,
        graph: HomeGraph,
        name: &str,
        options: &SaveOptions,
        cancel: &CancellationToken,
    ) -> Result<SavedArchive> {
        let writer = self.clone();
        let name = name.to_string();
        let options = options.clone();
        let token = cancel.clone();
        let guard = WorkerGuard::new(&self.workers);

        let mut task = WorkerTask(tokio::spawn(async move {
            let _guard = guard;
            writer.assemble(graph, &name, &options, &token, true).await
        }));

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Save worker terminated");
                Err(ArchiveError::Aborted)
            }
            joined = &mut task.0 => match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(ArchiveError::WorkerFailed("worker panicked".to_string())),
                Err(e) => Err(ArchiveError::WorkerFailed(e.to_string())),
            },
        }
    }

    async fn assemble(
        &self,
        mut graph: HomeGraph,
        name: &str,
        options: &SaveOptions,
        cancel: &CancellationToken,
        in_worker: bool,
    ) -> Result<SavedArchive> {
        let walker = GraphWalker::new(&self.transient);
        let collected = walker.collect_from_root(&mut graph, &mut CollectAll).into_vec();

        if in_worker {
            for content in &collected {
                if let ContentSource::Cached { backend, .. } = content.source()
                    && !backend.available_in_worker()
                {
                    return Err(ArchiveError::WorkerUnavailable(format!(
                        "cache backend {} cannot be reached from a worker",
                        backend.id()
                    )));
                }
            }
        }

        let (embedded, linked): (Vec<_>, Vec<_>) = collected
            .into_iter()
            .partition(|c| options.include_all_content || !c.is_remote());

        ensure_live(cancel)?;
        let digests = join_all(embedded.iter().map(|content| async move {
            match self.digests.digest_of(content).await {
                Ok(digest) => Some(digest),
                Err(e) => {
                    tracing::warn!(url = %content.url(), error = %e, "Resource not deduplicated");
                    None
                }
            }
        }))
        .await;
        ensure_live(cancel)?;

        let mut paths: HashMap<String, String> = linked
            .iter()
            .map(|c| (c.url().to_string(), c.url().to_string()))
            .collect();
        let mut by_digest: HashMap<(Digest, bool), usize> = HashMap::new();
        let mut survivors: Vec<Survivor> = Vec::new();

        for (content, digest) in embedded.into_iter().zip(digests) {
            let key = digest.map(|d| (d, content.is_multi_part()));
            let index = match key.as_ref().and_then(|k| by_digest.get(k)) {
                Some(index) => *index,
                None => {
                    let index = survivors.len();
                    if let Some(key) = key {
                        by_digest.insert(key, index);
                    }
                    survivors.push(Survivor {
                        content: content.clone(),
                        index,
                    });
                    index
                }
            };
            paths.insert(content.url().to_string(), output_path(&content, index));
        }

        let manifest = ManifestWriter::new(&self.schema, &self.transient).write(&graph, &paths)?;
        ensure_live(cancel)?;

        let materialized = join_all(survivors.iter().map(|s| self.materialize(s))).await;
        ensure_live(cancel)?;

        let mut zip = ZipWriter::new(options.compression_level);
        zip.add_entry(&options.manifest_entry, &manifest)?;
        for files in materialized {
            for (path, data) in files? {
                zip.add_entry(&path, &data)?;
            }
        }
        let resource_entries = zip.len() - 1;
        let data = zip.finish()?;
        ensure_live(cancel)?;

        tracing::debug!(
            name,
            resources = survivors.len(),
            entries = resource_entries,
            bytes = data.len(),
            "Assembled archive"
        );
        Ok(SavedArchive {
            name: name.to_string(),
            output: ArchiveOutput::new(data, options.representation),
            resource_entries,
            paths,
        })
    }

    /// Bytes of a surviving resource keyed by output path. Multi-part
    /// resources bring every entry of their directory.
    async fn materialize(&self, survivor: &Survivor) -> Result<Vec<(String, Vec<u8>)>> {
        let content = &survivor.content;
        let read_error = |e: ArchiveError| match e {
            e @ ArchiveError::ResourceRead { .. } => e,
            other => ArchiveError::ResourceRead {
                url: content.url().to_string(),
                message: other.to_string(),
            },
        };

        let fetcher = self.digests.fetcher();
        match (content.archive(), content.directory_prefix()) {
            (Some(source), Some(prefix)) => {
                let archive = fetcher.open_archive(source).await.map_err(read_error)?;
                let mut files = Vec::new();
                for entry in archive.entries_under(prefix) {
                    let data = archive.read_entry(entry).await.map_err(read_error)?;
                    let remainder = &entry.file_name[prefix.len()..];
                    files.push((format!("{}/{remainder}", survivor.index), data));
                }
                Ok(files)
            }
            _ => {
                let data = fetcher.read_content(content).await.map_err(read_error)?;
                Ok(vec![(survivor.index.to_string(), data)])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ArchiveSource;
    use crate::fetch::DefaultFetcher;
    use crate::zip::Archive;

    fn writer() -> ArchiveWriter {
        let fetcher = Arc::new(DefaultFetcher::new().unwrap());
        ArchiveWriter::new(Arc::new(DigestManager::new(fetcher)))
    }

    fn furniture(graph: &mut HomeGraph, icon: ContentReference) {
        let piece = graph.add_child(graph.root(), "pieceOfFurniture");
        graph.set_attribute(piece, "icon", icon);
    }

    #[tokio::test]
    async fn identical_bytes_share_one_entry() {
        let mut graph = HomeGraph::new("home");
        let first = ContentReference::blob(b"same".to_vec());
        let second = ContentReference::blob(b"same".to_vec());
        let third = ContentReference::blob(b"different".to_vec());
        furniture(&mut graph, first.clone());
        furniture(&mut graph, second.clone());
        furniture(&mut graph, third.clone());

        let saved = writer()
            .write(&graph, "home.sh3d", &SaveOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(saved.resource_entries, 2);
        assert_eq!(saved.paths[first.url()], "0");
        assert_eq!(saved.paths[second.url()], "0");
        assert_eq!(saved.paths[third.url()], "1");

        let archive = Archive::from_bytes("saved", saved.output.to_bytes().unwrap())
            .await
            .unwrap();
        let names: Vec<_> = archive.entries().iter().map(|e| e.file_name.as_str()).collect();
        assert_eq!(names, ["Home.xml", "0", "1"]);
        assert_eq!(archive.read("1").await.unwrap(), b"different");
    }

    #[tokio::test]
    async fn multi_part_resources_keep_their_layout() {
        let mut source = ZipWriter::new(0);
        source.add_entry("Home.xml", b"<home/>").unwrap();
        source.add_entry("7/model.obj", b"v 0 0 0").unwrap();
        source.add_entry("7/texture.png", b"png").unwrap();
        source.add_entry("7/LICENSE.TXT", b"cc-by").unwrap();
        let source = ArchiveSource::memory("source", source.finish().unwrap());

        let mut graph = HomeGraph::new("home");
        let piece = graph.add_child(graph.root(), "pieceOfFurniture");
        graph.set_attribute(piece, "model", ContentReference::archive_entry(source, "7/model.obj"));

        let saved = writer()
            .write(&graph, "copy.sh3d", &SaveOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(saved.resource_entries, 3);

        let archive = Archive::from_bytes("copy", saved.output.to_bytes().unwrap())
            .await
            .unwrap();
        assert_eq!(archive.read("0/texture.png").await.unwrap(), b"png");
        assert_eq!(archive.read("0/LICENSE.TXT").await.unwrap(), b"cc-by");
        let manifest = String::from_utf8(archive.read("Home.xml").await.unwrap()).unwrap();
        assert!(manifest.contains("model=\"0/model.obj\""), "{manifest}");
    }

    #[tokio::test]
    async fn remote_references_are_linked_unless_included() {
        let mut graph = HomeGraph::new("home");
        furniture(&mut graph, ContentReference::remote("https://cdn.invalid/chair.png"));
        let options = SaveOptions {
            include_all_content: false,
            representation: OutputRepresentation::Base64,
            ..SaveOptions::default()
        };

        let saved = writer()
            .write(&graph, "linked.sh3d", &options, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(saved.output, ArchiveOutput::Base64(_)));
        assert_eq!(saved.resource_entries, 0);
        let archive = Archive::from_bytes("linked", saved.output.to_bytes().unwrap())
            .await
            .unwrap();
        let manifest = String::from_utf8(archive.read("Home.xml").await.unwrap()).unwrap();
        assert!(manifest.contains("icon=\"https://cdn.invalid/chair.png\""));
    }

    #[tokio::test]
    async fn unreadable_resource_fails_the_save() {
        let mut graph = HomeGraph::new("home");
        furniture(&mut graph, ContentReference::file("/nonexistent/homearc/icon.png"));
        let result = writer()
            .write(&graph, "broken.sh3d", &SaveOptions::default(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ArchiveError::ResourceRead { .. })));
    }

    #[tokio::test]
    async fn cancelled_before_start_is_aborted() {
        let token = CancellationToken::new();
        token.cancel();
        let result = writer()
            .write(&HomeGraph::new("home"), "x.sh3d", &SaveOptions::default(), &token)
            .await;
        assert!(matches!(result, Err(ArchiveError::Aborted)));
    }

    #[tokio::test]
    async fn worker_produces_the_same_archive() {
        let mut graph = HomeGraph::new("home");
        furniture(&mut graph, ContentReference::blob(b"icon".to_vec()));
        let writer = writer();

        let in_process = writer
            .write(&graph, "a.sh3d", &SaveOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        let options = SaveOptions {
            use_worker: true,
            ..SaveOptions::default()
        };
        let in_worker = writer
            .write(&graph, "a.sh3d", &options, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            in_process.output.to_bytes().unwrap(),
            in_worker.output.to_bytes().unwrap()
        );
        assert_eq!(writer.running_workers(), 0);
    }
}
