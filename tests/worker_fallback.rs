use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use homearc::cache::{CacheBackend, KeyPattern, MemoryRecordStore, RecordBackend};
use homearc::digest::{RustCryptoHasher, digest_bytes};
use homearc::zip::Archive;
use homearc::{
    ArchiveWriter, ContentReference, DefaultFetcher, DigestManager, HomeGraph, SaveOptions,
};

async fn record_backend(worker_access: bool) -> Arc<dyn CacheBackend> {
    let backend = RecordBackend::new(
        "idb",
        MemoryRecordStore::new(),
        "homearc",
        "resources",
        KeyPattern::with_prefix("res:"),
    )
    .with_worker_access(worker_access);
    let data = b"cached texture";
    backend
        .store("texture", &digest_bytes(&RustCryptoHasher, data).unwrap(), data)
        .await
        .unwrap();
    Arc::new(backend)
}

async fn save_with_worker(backend: Arc<dyn CacheBackend>) -> (ArchiveWriter, Vec<u8>) {
    let mut graph = HomeGraph::new("home");
    let room = graph.add_child(graph.root(), "room");
    graph.set_attribute(room, "image", ContentReference::cached(backend, "texture"));

    let fetcher = Arc::new(DefaultFetcher::new().unwrap());
    let writer = ArchiveWriter::new(Arc::new(DigestManager::new(fetcher)));
    let options = SaveOptions {
        use_worker: true,
        ..SaveOptions::default()
    };
    let saved = writer
        .write(&graph, "cached.sh3d", &options, &CancellationToken::new())
        .await
        .unwrap();
    (writer, saved.output.to_bytes().unwrap())
}

#[tokio::test]
async fn unavailable_backend_falls_back_to_in_process_save() {
    let (writer, data) = save_with_worker(record_backend(false).await).await;

    let archive = Archive::from_bytes("saved", data).await.unwrap();
    assert_eq!(archive.read("0").await.unwrap(), b"cached texture");
    assert_eq!(writer.running_workers(), 0);
}

#[tokio::test]
async fn reachable_backend_saves_in_worker() {
    let (writer, data) = save_with_worker(record_backend(true).await).await;

    let archive = Archive::from_bytes("saved", data).await.unwrap();
    let manifest = String::from_utf8(archive.read("Home.xml").await.unwrap()).unwrap();
    assert!(manifest.contains("image=\"0\""), "{manifest}");
    assert_eq!(writer.running_workers(), 0);
}
