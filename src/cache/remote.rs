use async_trait::async_trait;
use reqwest::Client;

use super::{CacheBackend, CachedDigest, backend_error};
use crate::digest::Digest;
use crate::error::Result;

/// Read-only backend listing `{name, digest}` pairs as a JSON array
///
/// Listed resources are served from `<resource base>/<name>` and are
/// referenced by that URL directly.
pub struct RemoteListingBackend {
    id: String,
    client: Client,
    listing_url: String,
    resource_base: String,
}

impl RemoteListingBackend {
    pub fn new(
        id: impl Into<String>,
        client: Client,
        listing_url: impl Into<String>,
        resource_base: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            client,
            listing_url: listing_url.into(),
            resource_base: resource_base.into(),
        }
    }

    fn resource_url(&self, name: &str) -> String {
        format!("{}/{}", self.resource_base.trim_end_matches('/'), name)
    }
}

#[async_trait]
impl CacheBackend for RemoteListingBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn list_digests(&self) -> Result<Vec<CachedDigest>> {
        let resp = self
            .client
            .get(&self.listing_url)
            .send()
            .await?
            .error_for_status()?;
        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| {
            backend_error(format!("invalid listing from {}: {e}", self.listing_url))
        })
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(self.resource_url(name))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn store(&self, name: &str, _digest: &Digest, _data: &[u8]) -> Result<()> {
        Err(backend_error(format!(
            "{} is read-only, cannot store {name}",
            self.listing_url
        )))
    }

    fn content_url(&self, name: &str) -> Option<String> {
        Some(self.resource_url(name))
    }
}
