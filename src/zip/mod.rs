//! ZIP container codec.
//!
//! Home documents are ZIP containers holding a manifest entry and the
//! binary resources it references.
//!
//! ## Architecture
//!
//! - [`structures`]: ZIP format records (EOCD, file headers, etc.)
//! - [`parser`]: low-level parsing of those records from a [`ReadAt`](crate::io::ReadAt) source
//! - [`extractor`]: entry extraction with DEFLATE and CRC-32 checks
//! - [`archive`]: an opened container with its directory cached
//! - [`writer`]: in-memory container assembly
//!
//! ## Supported Features
//!
//! - Standard ZIP format (PKZIP APPNOTE 6.3.x compatible)
//! - ZIP64 extensions when reading
//! - STORED and DEFLATE compression methods
//!
//! ## Limitations
//!
//! - No encryption support
//! - No multi-disk archive support
//! - Written archives are limited to 65535 entries of less than 4 GiB

mod archive;
mod extractor;
mod parser;
mod structures;
mod writer;

pub use archive::Archive;
pub use extractor::ZipExtractor;
pub use parser::ZipParser;
pub use structures::*;
pub use writer::ZipWriter;
