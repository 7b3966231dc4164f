//! ZIP container writer.
//!
//! Entries are compressed as they are added and the Central Directory is
//! appended by [`ZipWriter::finish`]. Output is built in memory since saved
//! homes are handed back to callers as a single buffer.

use byteorder::{LittleEndian, WriteBytesExt};
use flate2::write::DeflateEncoder;
use flate2::{Compression, Crc};
use std::collections::HashSet;
use std::io::Write;

use crate::error::{ArchiveError, Result};

use super::structures::*;

struct CentralRecord {
    name: String,
    name_len: u16,
    method: CompressionMethod,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    lfh_offset: u32,
}

/// In-memory ZIP writer
///
/// Level 0 stores entries, levels 1-9 deflate them.
pub struct ZipWriter {
    out: Vec<u8>,
    records: Vec<CentralRecord>,
    names: HashSet<String>,
    level: u32,
}

fn write_error(path: &str, message: impl std::fmt::Display) -> ArchiveError {
    ArchiveError::ResourceWrite {
        path: path.to_string(),
        message: message.to_string(),
    }
}

fn to_u32(path: &str, value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| write_error(path, "entry exceeds 4 GiB"))
}

impl ZipWriter {
    pub fn new(compression_level: u32) -> Self {
        Self {
            out: Vec::new(),
            records: Vec::new(),
            names: HashSet::new(),
            level: compression_level.min(9),
        }
    }

    /// Number of entries written so far
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Compress `data` and append it as entry `name`
    pub fn add_entry(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let name_len =
            u16::try_from(name.len()).map_err(|_| write_error(name, "entry name exceeds 65535 bytes"))?;
        if !self.names.insert(name.to_string()) {
            return Err(write_error(name, "duplicate entry"));
        }
        if self.records.len() >= u16::MAX as usize {
            return Err(write_error(name, "too many entries"));
        }

        let mut crc = Crc::new();
        crc.update(data);

        let (method, payload) = if self.level == 0 {
            (CompressionMethod::Stored, data.to_vec())
        } else {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(self.level));
            encoder.write_all(data)?;
            (CompressionMethod::Deflate, encoder.finish()?)
        };

        let record = CentralRecord {
            name: name.to_string(),
            name_len,
            method,
            crc32: crc.sum(),
            compressed_size: to_u32(name, payload.len())?,
            uncompressed_size: to_u32(name, data.len())?,
            lfh_offset: to_u32(name, self.out.len())?,
        };

        let out = &mut self.out;
        out.write_all(LFH_SIGNATURE)?;
        out.write_u16::<LittleEndian>(VERSION_NEEDED)?;
        out.write_u16::<LittleEndian>(FLAG_UTF8)?;
        out.write_u16::<LittleEndian>(record.method.as_u16())?;
        out.write_u16::<LittleEndian>(DOS_EPOCH_TIME)?;
        out.write_u16::<LittleEndian>(DOS_EPOCH_DATE)?;
        out.write_u32::<LittleEndian>(record.crc32)?;
        out.write_u32::<LittleEndian>(record.compressed_size)?;
        out.write_u32::<LittleEndian>(record.uncompressed_size)?;
        out.write_u16::<LittleEndian>(record.name_len)?;
        out.write_u16::<LittleEndian>(0)?;
        out.write_all(name.as_bytes())?;
        out.write_all(&payload)?;

        self.records.push(record);
        Ok(())
    }

    /// Append the Central Directory and return the finished archive
    pub fn finish(mut self) -> Result<Vec<u8>> {
        let cd_offset = to_u32("central directory", self.out.len())?;

        for record in &self.records {
            let out = &mut self.out;
            out.write_all(CDFH_SIGNATURE)?;
            out.write_u16::<LittleEndian>(VERSION_NEEDED)?; // made by
            out.write_u16::<LittleEndian>(VERSION_NEEDED)?;
            out.write_u16::<LittleEndian>(FLAG_UTF8)?;
            out.write_u16::<LittleEndian>(record.method.as_u16())?;
            out.write_u16::<LittleEndian>(DOS_EPOCH_TIME)?;
            out.write_u16::<LittleEndian>(DOS_EPOCH_DATE)?;
            out.write_u32::<LittleEndian>(record.crc32)?;
            out.write_u32::<LittleEndian>(record.compressed_size)?;
            out.write_u32::<LittleEndian>(record.uncompressed_size)?;
            out.write_u16::<LittleEndian>(record.name_len)?;
            out.write_u16::<LittleEndian>(0)?; // extra
            out.write_u16::<LittleEndian>(0)?; // comment
            out.write_u16::<LittleEndian>(0)?; // disk
            out.write_u16::<LittleEndian>(0)?; // internal attributes
            out.write_u32::<LittleEndian>(0)?; // external attributes
            out.write_u32::<LittleEndian>(record.lfh_offset)?;
            out.write_all(record.name.as_bytes())?;
        }

        let cd_size = to_u32("central directory", self.out.len())? - cd_offset;
        let total = self.records.len() as u16;
        EndOfCentralDirectory {
            disk_number: 0,
            disk_with_cd: 0,
            disk_entries: total,
            total_entries: total,
            cd_size,
            cd_offset,
            comment_len: 0,
        }
        .write_to(&mut self.out)?;

        Ok(self.out)
    }
}
