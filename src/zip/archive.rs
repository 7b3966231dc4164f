use std::sync::Arc;

use crate::error::{ArchiveError, Result};
use crate::io::{MemoryReader, ReadAt};

use super::extractor::ZipExtractor;
use super::structures::ZipFileEntry;

/// An opened container with its Central Directory already listed
///
/// Opening reads the directory once; entry lookups afterwards are in memory
/// and reads go straight to the entry's data.
pub struct Archive {
    url: String,
    extractor: ZipExtractor<dyn ReadAt>,
    entries: Vec<ZipFileEntry>,
}

impl Archive {
    pub async fn open(url: impl Into<String>, reader: Arc<dyn ReadAt>) -> Result<Self> {
        let url = url.into();
        let extractor = ZipExtractor::new(reader);
        let entries = extractor
            .list_files()
            .await
            .map_err(|e| ArchiveError::ContainerRead {
                url: url.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            url,
            extractor,
            entries,
        })
    }

    pub async fn from_bytes(url: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Result<Self> {
        let reader: Arc<dyn ReadAt> = Arc::new(MemoryReader::new(data));
        Self::open(url, reader).await
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn entries(&self) -> &[ZipFileEntry] {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<&ZipFileEntry> {
        self.entries.iter().find(|e| e.file_name == name)
    }

    /// File entries whose name starts with `prefix`, in directory order
    pub fn entries_under(&self, prefix: &str) -> Vec<&ZipFileEntry> {
        self.entries
            .iter()
            .filter(|e| !e.is_directory && e.file_name.starts_with(prefix))
            .collect()
    }

    /// Read and decompress the entry called `name`
    pub async fn read(&self, name: &str) -> Result<Vec<u8>> {
        let entry = self.entry(name).ok_or_else(|| ArchiveError::ResourceRead {
            url: format!("jar:{}!/{}", self.url, name),
            message: "no such entry".to_string(),
        })?;
        self.read_entry(entry).await
    }

    pub async fn read_entry(&self, entry: &ZipFileEntry) -> Result<Vec<u8>> {
        self.extractor.extract_to_memory(entry).await
    }
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("url", &self.url)
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zip::ZipWriter;

    #[tokio::test]
    async fn directory_prefix_lookup() {
        let mut writer = ZipWriter::new(1);
        writer.add_entry("0", b"icon").unwrap();
        writer.add_entry("1/model.obj", b"obj").unwrap();
        writer.add_entry("1/texture.png", b"png").unwrap();
        let archive = Archive::from_bytes("memory:a", writer.finish().unwrap())
            .await
            .unwrap();

        let names: Vec<_> = archive
            .entries_under("1/")
            .iter()
            .map(|e| e.file_name.clone())
            .collect();
        assert_eq!(names, ["1/model.obj", "1/texture.png"]);
        assert!(archive.entry("2").is_none());
        assert!(matches!(
            archive.read("2").await,
            Err(ArchiveError::ResourceRead { .. })
        ));
    }

    #[tokio::test]
    async fn garbage_is_a_container_error() {
        let err = Archive::from_bytes("memory:junk", b"not a zip at all, clearly".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::ContainerRead { .. }));
    }
}
