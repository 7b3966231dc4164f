use async_trait::async_trait;
use reqwest::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::ReadAt;
use crate::error::{ArchiveError, Result};

/// HTTP Range reader for remote archives
///
/// Used to open catalog archives referenced by `jar:http...` content without
/// downloading them whole.
pub struct HttpRangeReader {
    client: Client,
    url: String,
    size: u64,
    transferred_bytes: AtomicU64,
    max_retry: u32,
}

impl HttpRangeReader {
    /// Create a new HTTP Range reader
    ///
    /// This will send a HEAD request to verify Range support and get file size
    pub async fn new(client: Client, url: String) -> Result<Self> {
        let resp = client.head(&url).send().await?;

        if !resp.status().is_success() {
            return Err(container_error(
                &url,
                format!("HTTP request failed with status: {}", resp.status()),
            ));
        }

        let accept_ranges = resp
            .headers()
            .get("accept-ranges")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none");

        if !accept_ranges.contains("bytes") {
            return Err(container_error(
                &url,
                "remote server does not support Range requests",
            ));
        }

        let size = resp
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| container_error(&url, "remote server did not return Content-Length"))?;

        Ok(Self {
            client,
            url,
            size,
            transferred_bytes: AtomicU64::new(0),
            max_retry: 10,
        })
    }
}

impl Drop for HttpRangeReader {
    fn drop(&mut self) {
        tracing::debug!(
            url = %self.url,
            size = self.size,
            transferred = self.transferred_bytes.load(Ordering::Relaxed),
            "Closed remote container"
        );
    }
}

fn container_error(url: &str, message: impl Into<String>) -> ArchiveError {
    ArchiveError::ContainerRead {
        url: url.to_string(),
        message: message.into(),
    }
}

#[async_trait]
impl ReadAt for HttpRangeReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || offset >= self.size {
            return Ok(0);
        }

        let end = offset + buf.len() as u64 - 1;
        let end = end.min(self.size - 1);
        let expected_size = (end - offset + 1) as usize;

        let mut received = 0;
        let mut retry_count = 0;

        while received < expected_size {
            let current_start = offset + received as u64;
            let range = format!("bytes={}-{}", current_start, end);

            let result = self
                .client
                .get(&self.url)
                .header("Range", &range)
                .send()
                .await;

            match result {
                Ok(resp) => {
                    if resp.status() != reqwest::StatusCode::PARTIAL_CONTENT {
                        return Err(container_error(
                            &self.url,
                            format!("HTTP request failed with status: {}", resp.status()),
                        ));
                    }

                    let bytes = resp.bytes().await?;
                    if bytes.is_empty() {
                        break;
                    }
                    let chunk_len = bytes.len().min(expected_size - received);
                    buf[received..received + chunk_len].copy_from_slice(&bytes[..chunk_len]);
                    received += chunk_len;

                    self.transferred_bytes
                        .fetch_add(chunk_len as u64, Ordering::Relaxed);
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    retry_count += 1;
                    if retry_count >= self.max_retry {
                        return Err(container_error(&self.url, "max retries exceeded"));
                    }
                    tracing::warn!(
                        url = %self.url,
                        retry = retry_count,
                        max_retry = self.max_retry,
                        error = %e,
                        "Connection error, retrying range request"
                    );
                    tokio::time::sleep(Duration::from_millis(500 * retry_count as u64)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(received)
    }

    fn size(&self) -> u64 {
        self.size
    }
}
