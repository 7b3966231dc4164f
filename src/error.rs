//! Error kinds shared by the load and save pipelines.
//!
//! Container and manifest failures abort a whole load. Per-resource failures
//! during optional enrichment (cache lookup, extraction) are logged by the
//! callers and tolerated, while resource failures while assembling a saved
//! archive abort the save. [`ArchiveError::Aborted`] is not a failure: it is
//! the result of an explicit cancellation and never reaches an error callback.

use thiserror::Error;

/// Errors raised while reading, digesting or writing home archives.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// The container has no manifest entry with the expected name.
    #[error("entry {entry} not found in {archive}")]
    ManifestMissing { archive: String, entry: String },

    /// The container could not be fetched or opened.
    #[error("cannot read container {url}: {message}")]
    ContainerRead { url: String, message: String },

    /// The manifest is not well-formed.
    #[error("cannot parse manifest: {0}")]
    Parse(String),

    /// A digest could not be computed. `status` is the HTTP status when the
    /// bytes came from the network, 0 otherwise.
    #[error("digest computation failed ({status}): {message}")]
    Digest { status: u16, message: String },

    /// Bytes of a resource could not be read.
    #[error("cannot read resource {url}: {message}")]
    ResourceRead { url: String, message: String },

    /// A resource could not be written to the output container.
    #[error("cannot write {path}: {message}")]
    ResourceWrite { path: String, message: String },

    /// A cache backend refused a query or a store.
    #[error("cache backend error: {0}")]
    CacheBackend(String),

    /// The operation was cancelled by its caller.
    #[error("operation aborted")]
    Aborted,

    /// The background worker cannot run in this environment.
    #[error("background worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// The background worker stopped without producing a result.
    #[error("background worker failed: {0}")]
    WorkerFailed(String),

    /// The bytes are not a ZIP container this codec understands.
    #[error("invalid zip archive: {0}")]
    InvalidZip(String),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ArchiveError {
    /// HTTP status carried by this error, if it came from a response.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ArchiveError::Http(e) => e.status().map(|s| s.as_u16()),
            ArchiveError::Digest { status, .. } if *status != 0 => Some(*status),
            _ => None,
        }
    }

    /// Wrap this error as the digest failure of a resource.
    pub fn into_digest_error(self) -> ArchiveError {
        match self {
            e @ ArchiveError::Digest { .. } => e,
            e @ ArchiveError::Aborted => e,
            other => ArchiveError::Digest {
                status: other.http_status().unwrap_or(0),
                message: other.to_string(),
            },
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, ArchiveError::Aborted)
    }
}

pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_wrapping_keeps_message() {
        let err = ArchiveError::ResourceRead {
            url: "blob:1".to_string(),
            message: "gone".to_string(),
        }
        .into_digest_error();
        match err {
            ArchiveError::Digest { status, message } => {
                assert_eq!(status, 0);
                assert!(message.contains("blob:1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn aborted_is_not_rewrapped() {
        assert!(ArchiveError::Aborted.into_digest_error().is_aborted());
    }
}
