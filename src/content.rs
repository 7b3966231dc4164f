//! Content references: the indirection between the domain graph and the
//! binary resources it embeds.
//!
//! A reference is identified by its URL. Resources stored inside a
//! container use the composite form `jar:<archiveURL>!/<entryName>`.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::CacheBackend;
use crate::error::{ArchiveError, Result};

/// Where a container's bytes come from
#[derive(Clone)]
pub enum ArchiveSource {
    /// A file on the local filesystem
    Path(PathBuf),
    /// An `http://` or `https://` URL
    Url(String),
    /// Bytes already in memory. `instance` is fresh per construction, so
    /// two containers sharing a name never share a URL.
    Memory {
        name: String,
        instance: String,
        data: Arc<[u8]>,
    },
    /// An entry of another container holding a container itself
    Nested {
        outer: Box<ArchiveSource>,
        entry: String,
    },
}

impl ArchiveSource {
    /// Parse a container URL.
    ///
    /// Strings without a known scheme are taken as local paths. In-memory
    /// containers cannot be named by URL and must be constructed directly.
    pub fn parse(url: &str) -> Result<Self> {
        if let Some((outer, entry)) = split_jar_url(url) {
            return Ok(ArchiveSource::Nested {
                outer: Box::new(ArchiveSource::parse(outer)?),
                entry: entry.to_string(),
            });
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(ArchiveSource::Url(url.to_string()));
        }
        if let Some(path) = url.strip_prefix("file://") {
            return Ok(ArchiveSource::Path(PathBuf::from(path)));
        }
        if let Some(path) = url.strip_prefix("file:") {
            return Ok(ArchiveSource::Path(PathBuf::from(path)));
        }
        if url.starts_with("memory:") || url.starts_with("blob:") {
            return Err(ArchiveError::ContainerRead {
                url: url.to_string(),
                message: "in-memory container is not addressable by URL".to_string(),
            });
        }
        Ok(ArchiveSource::Path(PathBuf::from(url)))
    }

    pub fn memory(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        ArchiveSource::Memory {
            name: name.into(),
            instance: uuid::Uuid::new_v4().simple().to_string(),
            data: data.into(),
        }
    }

    /// URL identifying this container
    pub fn url(&self) -> String {
        match self {
            ArchiveSource::Path(path) => format!("file:{}", path.display()),
            ArchiveSource::Url(url) => url.clone(),
            ArchiveSource::Memory { name, instance, .. } => format!("memory:{name}@{instance}"),
            ArchiveSource::Nested { outer, entry } => jar_url(&outer.url(), entry),
        }
    }
}

impl fmt::Debug for ArchiveSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchiveSource({})", self.url())
    }
}

/// Build `jar:<archive>!/<entry>`
pub fn jar_url(archive_url: &str, entry: &str) -> String {
    format!("jar:{archive_url}!/{entry}")
}

/// Split a composite URL into archive URL and entry name.
///
/// The last `!/` separates them so that nested containers keep their own
/// composite URL on the archive side.
pub fn split_jar_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("jar:")?;
    let split = rest.rfind("!/")?;
    Some((&rest[..split], &rest[split + 2..]))
}

/// Byte source of a content reference
#[derive(Clone)]
pub enum ContentSource {
    /// A flat local file
    File(PathBuf),
    /// A single entry of a container
    ArchiveEntry { archive: ArchiveSource, entry: String },
    /// An entry standing for every entry under its directory prefix
    ArchiveDirectory { archive: ArchiveSource, entry: String },
    /// A remote resource fetched with a GET
    Remote(String),
    /// Bytes held in memory
    Blob(Arc<[u8]>),
    /// A resource kept by a cache backend
    Cached {
        backend: Arc<dyn CacheBackend>,
        name: String,
    },
}

impl fmt::Debug for ContentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentSource::File(path) => f.debug_tuple("File").field(path).finish(),
            ContentSource::ArchiveEntry { archive, entry } => f
                .debug_struct("ArchiveEntry")
                .field("archive", archive)
                .field("entry", entry)
                .finish(),
            ContentSource::ArchiveDirectory { archive, entry } => f
                .debug_struct("ArchiveDirectory")
                .field("archive", archive)
                .field("entry", entry)
                .finish(),
            ContentSource::Remote(url) => f.debug_tuple("Remote").field(url).finish(),
            ContentSource::Blob(data) => write!(f, "Blob({} bytes)", data.len()),
            ContentSource::Cached { backend, name } => f
                .debug_struct("Cached")
                .field("backend", &backend.id())
                .field("name", name)
                .finish(),
        }
    }
}

/// A binary resource referenced from the domain graph
#[derive(Clone, Debug)]
pub struct ContentReference {
    url: String,
    source: ContentSource,
}

impl ContentReference {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            url: format!("file:{}", path.display()),
            source: ContentSource::File(path),
        }
    }

    /// Reference an entry of `archive`. Entries inside a directory stand for
    /// the whole directory.
    pub fn archive_entry(archive: ArchiveSource, entry: impl Into<String>) -> Self {
        let entry = entry.into();
        let url = jar_url(&archive.url(), &entry);
        let source = if entry.contains('/') {
            ContentSource::ArchiveDirectory { archive, entry }
        } else {
            ContentSource::ArchiveEntry { archive, entry }
        };
        Self { url, source }
    }

    pub fn remote(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            source: ContentSource::Remote(url.clone()),
            url,
        }
    }

    /// Wrap in-memory bytes under a fresh `blob:` URL
    pub fn blob(data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            url: format!("blob:{}", uuid::Uuid::new_v4()),
            source: ContentSource::Blob(data.into()),
        }
    }

    pub fn cached(backend: Arc<dyn CacheBackend>, name: impl Into<String>) -> Self {
        let name = name.into();
        match backend.content_url(&name) {
            Some(url) => Self::remote(url),
            None => Self {
                url: format!("cache://{}/{}", backend.id(), name),
                source: ContentSource::Cached { backend, name },
            },
        }
    }

    /// Parse a URL as found in a manifest. Relative values name entries of
    /// `base`, the container being read.
    pub fn from_manifest_value(value: &str, base: &ArchiveSource) -> Result<Self> {
        if let Some((archive, entry)) = split_jar_url(value) {
            return Ok(Self::archive_entry(ArchiveSource::parse(archive)?, entry));
        }
        if value.starts_with("http://") || value.starts_with("https://") {
            return Ok(Self::remote(value));
        }
        if let Some(path) = value.strip_prefix("file:") {
            return Ok(Self::file(path));
        }
        Ok(Self::archive_entry(base.clone(), value))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn source(&self) -> &ContentSource {
        &self.source
    }

    /// Whether this reference covers every entry under a directory prefix
    pub fn is_multi_part(&self) -> bool {
        matches!(self.source, ContentSource::ArchiveDirectory { .. })
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.source, ContentSource::Remote(_))
    }

    /// Container holding this resource, if any
    pub fn archive(&self) -> Option<&ArchiveSource> {
        match &self.source {
            ContentSource::ArchiveEntry { archive, .. }
            | ContentSource::ArchiveDirectory { archive, .. } => Some(archive),
            _ => None,
        }
    }

    /// Entry name inside the container, if any
    pub fn entry_name(&self) -> Option<&str> {
        match &self.source {
            ContentSource::ArchiveEntry { entry, .. }
            | ContentSource::ArchiveDirectory { entry, .. } => Some(entry),
            _ => None,
        }
    }

    /// Directory prefix of a multi-part resource, up to and including the
    /// first `/` of its entry name
    pub fn directory_prefix(&self) -> Option<&str> {
        match &self.source {
            ContentSource::ArchiveDirectory { entry, .. } => {
                entry.find('/').map(|i| &entry[..=i])
            }
            _ => None,
        }
    }
}

impl PartialEq for ContentReference {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for ContentReference {}

impl std::hash::Hash for ContentReference {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.url.hash(state);
    }
}

impl fmt::Display for ContentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jar_url_splits_on_last_separator() {
        let (archive, entry) = split_jar_url("jar:jar:https://x/a.zip!/b.sh3d!/Home.xml").unwrap();
        assert_eq!(archive, "jar:https://x/a.zip!/b.sh3d");
        assert_eq!(entry, "Home.xml");

        match ArchiveSource::parse(archive).unwrap() {
            ArchiveSource::Nested { outer, entry } => {
                assert_eq!(entry, "b.sh3d");
                assert_eq!(outer.url(), "https://x/a.zip");
            }
            other => panic!("unexpected source {other:?}"),
        }
        assert!(split_jar_url("https://x/a.zip").is_none());
    }

    #[test]
    fn directory_entries_are_multi_part() {
        let archive = ArchiveSource::memory("home", Vec::new());
        let single = ContentReference::archive_entry(archive.clone(), "0");
        let multi = ContentReference::archive_entry(archive.clone(), "3/sofa/model.obj");

        assert!(!single.is_multi_part());
        assert!(multi.is_multi_part());
        assert_eq!(multi.directory_prefix(), Some("3/"));
        assert_eq!(multi.url(), jar_url(&archive.url(), "3/sofa/model.obj"));
    }

    #[test]
    fn manifest_values_resolve_against_base() {
        let base = ArchiveSource::Path(PathBuf::from("/tmp/house.sh3d"));
        let relative = ContentReference::from_manifest_value("12", &base).unwrap();
        assert_eq!(relative.url(), "jar:file:/tmp/house.sh3d!/12");

        let remote = ContentReference::from_manifest_value("https://cdn/x.png", &base).unwrap();
        assert!(remote.is_remote());

        let other =
            ContentReference::from_manifest_value("jar:https://cdn/cat.zip!/chair/icon.png", &base)
                .unwrap();
        assert!(other.is_multi_part());
        assert_eq!(other.archive().unwrap().url(), "https://cdn/cat.zip");
    }

    #[test]
    fn memory_containers_get_distinct_urls() {
        let a = ArchiveSource::memory("house", b"one".to_vec());
        let b = ArchiveSource::memory("house", b"two".to_vec());
        assert_ne!(a.url(), b.url());
        assert_eq!(a.url(), a.clone().url());
        assert!(a.url().starts_with("memory:house@"));
    }

    #[test]
    fn blobs_get_distinct_urls() {
        let a = ContentReference::blob(b"x".to_vec());
        let b = ContentReference::blob(b"x".to_vec());
        assert_ne!(a, b);
        assert!(a.url().starts_with("blob:"));
    }
}
