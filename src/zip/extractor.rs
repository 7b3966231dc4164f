use flate2::Crc;
use flate2::read::DeflateDecoder;
use std::io::Read;
use std::sync::Arc;

use crate::error::{ArchiveError, Result};
use crate::io::ReadAt;

use super::parser::ZipParser;
use super::structures::{CompressionMethod, ZipFileEntry};

/// Largest expansion DEFLATE can achieve
const MAX_DEFLATE_RATIO: u64 = 1032;

/// ZIP entry extractor
pub struct ZipExtractor<R: ReadAt + ?Sized> {
    parser: ZipParser<R>,
}

impl<R: ReadAt + ?Sized> ZipExtractor<R> {
    pub fn new(reader: Arc<R>) -> Self {
        Self {
            parser: ZipParser::new(reader),
        }
    }

    /// List all entries in the archive
    pub async fn list_files(&self) -> Result<Vec<ZipFileEntry>> {
        self.parser.list_files().await
    }

    /// Extract entry data to memory, inflating DEFLATE entries and checking
    /// the CRC-32 recorded in the central directory
    pub async fn extract_to_memory(&self, entry: &ZipFileEntry) -> Result<Vec<u8>> {
        let data_offset = self.parser.get_data_offset(entry).await?;
        let data_end = data_offset.checked_add(entry.compressed_size);
        if data_end.is_none_or(|end| end > self.parser.reader().size()) {
            return Err(ArchiveError::InvalidZip(format!(
                "data of {} lies outside the archive",
                entry.file_name
            )));
        }

        let mut raw = vec![0u8; entry.compressed_size as usize];
        self.parser.reader().read_exact_at(data_offset, &mut raw).await?;

        let data = match entry.compression_method {
            CompressionMethod::Stored => raw,
            CompressionMethod::Deflate => {
                let hint = entry
                    .uncompressed_size
                    .min(entry.compressed_size.saturating_mul(MAX_DEFLATE_RATIO));
                let mut data = Vec::with_capacity(hint as usize);
                // One byte past the declared size is enough to detect a mismatch
                DeflateDecoder::new(raw.as_slice())
                    .take(entry.uncompressed_size.saturating_add(1))
                    .read_to_end(&mut data)?;
                data
            }
            CompressionMethod::Unknown(method) => {
                return Err(ArchiveError::InvalidZip(format!(
                    "unsupported compression method {} for {}",
                    method, entry.file_name
                )));
            }
        };

        let mut crc = Crc::new();
        crc.update(&data);
        if crc.sum() != entry.crc32 || data.len() as u64 != entry.uncompressed_size {
            return Err(ArchiveError::InvalidZip(format!(
                "checksum mismatch for {}",
                entry.file_name
            )));
        }

        Ok(data)
    }
}
