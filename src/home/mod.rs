//! Reading and writing home containers.
//!
//! [`ArchiveReader`] and [`ArchiveWriter`] are plain async pipelines.
//! [`HomeRecorder`] runs them as background tasks and reports to observer
//! callbacks: exactly one of success or error fires per operation, and
//! none fires once a save has been aborted.

mod reader;
mod writer;

pub use reader::{ArchiveReader, LoadOptions, LoadedHome, PhaseProgress};
pub use writer::{ArchiveOutput, ArchiveWriter, OutputRepresentation, SaveOptions, SavedArchive};

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheBackend;
use crate::config::RecorderConfig;
use crate::digest::DigestManager;
use crate::error::ArchiveError;
use crate::graph::HomeGraph;

/// Named phases of a load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadPhase {
    FetchContainer,
    ParseManifest,
}

pub trait HomeLoadObserver: Send + Sync {
    fn progress(&self, _phase: LoadPhase, _url: &str, _fraction: f64) {}
    fn home_loaded(&self, home: LoadedHome);
    fn home_error(&self, error: ArchiveError);
}

pub trait HomeSaveObserver: Send + Sync {
    fn home_saved(&self, saved: SavedArchive);
    fn home_error(&self, error: ArchiveError);
}

/// Handle on a running save
pub struct SaveHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SaveHandle {
    /// Stop the save. Already issued reads complete but their results are
    /// dropped, a worker is terminated, and no callback fires afterwards.
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until the save has reported or has been aborted
    pub async fn finished(self) {
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Save task failed");
        }
    }
}

/// Loads and saves homes in the background
pub struct HomeRecorder {
    reader: Arc<ArchiveReader>,
    writer: ArchiveWriter,
    save_options: SaveOptions,
}

impl HomeRecorder {
    pub fn new(
        digests: Arc<DigestManager>,
        config: &RecorderConfig,
        backend: Option<Arc<dyn CacheBackend>>,
    ) -> Self {
        let reader = ArchiveReader::new(digests.clone())
            .with_backend(backend)
            .with_options(config.load_options());
        Self {
            reader: Arc::new(reader),
            writer: ArchiveWriter::new(digests),
            save_options: config.save_options(),
        }
    }

    pub fn reader(&self) -> &ArchiveReader {
        &self.reader
    }

    pub fn writer(&self) -> &ArchiveWriter {
        &self.writer
    }

    pub fn read_home(&self, url: &str, observer: Arc<dyn HomeLoadObserver>) -> JoinHandle<()> {
        let reader = self.reader.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            let progress = |phase: LoadPhase, fraction: f64| observer.progress(phase, &url, fraction);
            match reader.read(&url, &progress).await {
                Ok(home) => observer.home_loaded(home),
                Err(e) => {
                    tracing::debug!(url = %url, error = %e, "Load failed");
                    observer.home_error(e);
                }
            }
        })
    }

    pub fn write_home(
        &self,
        graph: HomeGraph,
        name: &str,
        observer: Arc<dyn HomeSaveObserver>,
    ) -> SaveHandle {
        let writer = self.writer.clone();
        let options = self.save_options.clone();
        let name = name.to_string();
        let token = CancellationToken::new();
        let cancel = token.clone();

        let task = tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(ArchiveError::Aborted),
                result = writer.write(&graph, &name, &options, &cancel) => result,
            };
            if cancel.is_cancelled() {
                tracing::debug!(name = %name, "Save aborted");
                return;
            }
            match result {
                Ok(saved) => observer.home_saved(saved),
                Err(ArchiveError::Aborted) => {}
                Err(e) => observer.home_error(e),
            }
        });
        SaveHandle { token, task }
    }
}
