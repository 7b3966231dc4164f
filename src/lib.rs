//! # homearc
//!
//! Content-addressed resource caching and ZIP serialization for home design
//! documents.
//!
//! A home is a ZIP container holding an XML manifest (`Home.xml`) and the
//! binary resources it references: icons, textures and 3D models. This
//! crate loads such containers into a [`HomeGraph`], substitutes resources
//! already known by digest, and saves graphs back with every resource
//! stored once, however many references point at identical bytes.
//!
//! ## Features
//!
//! - Containers from local files, HTTP/HTTPS URLs (Range requests or full
//!   download) and memory, including containers nested in other containers
//! - Stable base64 digests (SHA-1, SHA-256 fallback) with a multi-file policy
//!   for directory-backed resources
//! - Pluggable cache backends: key/value, record database, HTTP listing
//! - Saves offloaded to a background worker with in-process fallback and
//!   cancellation
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use homearc::{ArchiveReader, ArchiveWriter, DefaultFetcher, DigestManager, SaveOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let fetcher = Arc::new(DefaultFetcher::new()?);
//!     let digests = Arc::new(DigestManager::new(fetcher));
//!
//!     let home = ArchiveReader::new(digests.clone())
//!         .read("https://example.com/house.sh3d", &|_, _| {})
//!         .await?;
//!     for content in &home.contents {
//!         println!("{}  {}", digests.digest_of(content).await?, content);
//!     }
//!
//!     let saved = ArchiveWriter::new(digests)
//!         .write(&home.graph, "house.sh3d", &SaveOptions::default(), &CancellationToken::new())
//!         .await?;
//!     std::fs::write("house-copy.sh3d", saved.output.to_bytes()?)?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod content;
pub mod digest;
pub mod error;
pub mod fetch;
pub mod graph;
pub mod home;
pub mod io;
pub mod manifest;
pub mod walker;
pub mod zip;

pub use cli::Cli;
pub use config::RecorderConfig;
pub use content::{ArchiveSource, ContentReference, ContentSource};
pub use digest::{Digest, DigestManager};
pub use error::{ArchiveError, Result};
pub use fetch::{ContentFetcher, DefaultFetcher};
pub use graph::{ElementId, HomeGraph, Value};
pub use home::{
    ArchiveReader, ArchiveWriter, HomeLoadObserver, HomeRecorder, HomeSaveObserver, LoadPhase,
    LoadedHome, SaveOptions, SavedArchive,
};
