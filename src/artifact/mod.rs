//! Artifact handler: resolves signed download URLs, streams artifact
//! bytes under a hard size cap, and validates ZIP framing.
//!
//! The streaming-with-a-cap loop is grounded on this crate's original
//! `stream_to_file` helper (`response.bytes_stream()` drained
//! chunk-by-chunk into a writer); here the writer is an in-memory
//! `Vec<u8>` bounded by `maxSizeBytes` instead of a file; the caller
//! never needed the resume/range-request machinery that helper's
//! surrounding code carried, so none of that ships.

use std::time::Duration;

use dashmap::DashMap;
use futures_util::StreamExt;
use tracing::{debug, instrument};

use crate::error::ArtifactError;
use crate::platform::PlatformClient;

/// Config for the artifact handler.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactHandlerConfig {
    pub max_size_bytes: u64,
    pub url_cache_ttl: Duration,
}

impl Default for ArtifactHandlerConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 1024 * 1024 * 1024,
            url_cache_ttl: Duration::from_secs(50),
        }
    }
}

struct CachedUrl {
    url: String,
    fetched_at: tokio::time::Instant,
}

/// Resolves and downloads workflow-run artifacts, caching signed URLs for
/// [`ArtifactHandlerConfig::url_cache_ttl`] so repeated reads of the same
/// artifact within one ingestion pass don't re-hit the platform.
pub struct ArtifactHandler {
    platform: PlatformClient,
    config: ArtifactHandlerConfig,
    url_cache: DashMap<(String, i64), CachedUrl>,
}

impl ArtifactHandler {
    #[must_use]
    pub fn new(platform: PlatformClient, config: ArtifactHandlerConfig) -> Self {
        Self {
            platform,
            config,
            url_cache: DashMap::new(),
        }
    }

    /// Resolves the signed download URL for `artifact_id`, reusing a
    /// cached URL if it was fetched within `url_cache_ttl`.
    ///
    /// # Errors
    /// Propagates [`PlatformError`](crate::error::PlatformError) as
    /// [`ArtifactError::Platform`].
    #[instrument(skip(self))]
    async fn resolve_url(&self, repo: &str, artifact_id: i64, correlation_id: &str) -> Result<String, ArtifactError> {
        let key = (repo.to_string(), artifact_id);
        if let Some(cached) = self.url_cache.get(&key) {
            if cached.fetched_at.elapsed() < self.config.url_cache_ttl {
                return Ok(cached.url.clone());
            }
        }
        let url = self.platform.download_artifact_url(repo, artifact_id, correlation_id).await?;
        self.url_cache.insert(
            key,
            CachedUrl {
                url: url.clone(),
                fetched_at: tokio::time::Instant::now(),
            },
        );
        Ok(url)
    }

    /// Downloads one artifact's full body, enforcing `maxSizeBytes` as a
    /// hard cap (the stream is aborted mid-flight on overrun, never
    /// buffered past the limit) and validating the leading ZIP magic
    /// bytes (`PK\x03\x04`) before returning.
    ///
    /// # Errors
    /// - [`ArtifactError::UntrustedUrl`] if the signed URL isn't `https`.
    /// - [`ArtifactError::TooLarge`] if the body exceeds the cap.
    /// - [`ArtifactError::InvalidZip`] if the leading bytes aren't a ZIP.
    /// - [`ArtifactError::Platform`] for any transport failure.
    #[instrument(skip(self, artifact_name))]
    pub async fn download(
        &self,
        repo: &str,
        artifact_id: i64,
        artifact_name: &str,
        correlation_id: &str,
    ) -> Result<Vec<u8>, ArtifactError> {
        let url = self.resolve_url(repo, artifact_id, correlation_id).await?;
        match self.download_from_url(&url, artifact_name, correlation_id).await {
            Err(ArtifactError::Platform(crate::error::PlatformError::AuthenticationFailed { .. })) => {
                debug!(artifact_name, "signed URL rejected, refreshing and retrying once");
                self.url_cache.remove(&(repo.to_string(), artifact_id));
                let refreshed = self.resolve_url(repo, artifact_id, correlation_id).await?;
                self.download_from_url(&refreshed, artifact_name, correlation_id).await
            }
            other => other,
        }
    }

    /// Streams a single signed URL's body through the platform client's
    /// resilience stack, enforcing the size cap mid-stream and
    /// validating ZIP framing once complete.
    async fn download_from_url(&self, url: &str, artifact_name: &str, correlation_id: &str) -> Result<Vec<u8>, ArtifactError> {
        let parsed = url::Url::parse(url).map_err(|_| ArtifactError::untrusted_url(artifact_name))?;
        if parsed.scheme() != "https" {
            return Err(ArtifactError::untrusted_url(artifact_name));
        }

        let response = self.platform.fetch_signed_url(url, "download_artifact", correlation_id).await?;

        let mut buffer = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ArtifactError::Platform(crate::error::PlatformError::network(artifact_name, e)))?;
            if buffer.len() as u64 + chunk.len() as u64 > self.config.max_size_bytes {
                return Err(ArtifactError::too_large(artifact_name, self.config.max_size_bytes));
            }
            buffer.extend_from_slice(&chunk);
        }

        validate_zip_magic(artifact_name, &buffer)?;
        debug!(artifact_name, bytes = buffer.len(), "artifact downloaded");
        Ok(buffer)
    }
}

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
/// An empty ZIP archive (no entries) carries this alternate magic.
const ZIP_EMPTY_MAGIC: [u8; 4] = [0x50, 0x4B, 0x05, 0x06];

fn validate_zip_magic(name: &str, bytes: &[u8]) -> Result<(), ArtifactError> {
    if bytes.len() < 4 {
        return Err(ArtifactError::invalid_zip(name));
    }
    let head = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if head == ZIP_MAGIC || head == ZIP_EMPTY_MAGIC {
        Ok(())
    } else {
        Err(ArtifactError::invalid_zip(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_zip_magic() {
        let mut bytes = ZIP_MAGIC.to_vec();
        bytes.extend_from_slice(b"rest of archive");
        assert!(validate_zip_magic("a.zip", &bytes).is_ok());
    }

    #[test]
    fn accepts_empty_zip_magic() {
        assert!(validate_zip_magic("empty.zip", &ZIP_EMPTY_MAGIC).is_ok());
    }

    #[test]
    fn rejects_non_zip_bytes() {
        let result = validate_zip_magic("not-a-zip.txt", b"plain text content");
        assert!(matches!(result, Err(ArtifactError::InvalidZip { .. })));
    }

    #[test]
    fn rejects_truncated_input() {
        let result = validate_zip_magic("short.zip", &[0x50, 0x4B]);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_non_https_signed_url() {
        let Ok(parsed) = url::Url::parse("http://example.com/artifact.zip") else {
            panic!("test URL should parse");
        };
        assert_ne!(parsed.scheme(), "https");
    }
}
