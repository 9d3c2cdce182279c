//! HTTP byte-range backend with conditional requests.
//!
//! Every ranged GET carries the validators seen at probe time (`If-Match`,
//! `If-Unmodified-Since`). If the object changed in the meantime the server
//! answers 412 (or 416 when it shrank), and the read fails with
//! [`CacheError::StaleContent`] instead of mixing bytes from two versions.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{header, Client, StatusCode};
use tracing::{debug, instrument, warn};

use block_cache::RangeSource;
use cache_common::{CacheError, CacheResult, Clock, ContentVersion};

/// Metadata returned by a HEAD probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub content_length: u64,
    pub etag: Option<String>,
    /// Last-Modified as unix seconds.
    pub last_modified: Option<i64>,
}

impl RemoteMetadata {
    pub fn version(&self) -> ContentVersion {
        ContentVersion::new(self.etag.clone(), self.last_modified)
    }
}

/// Parse an HTTP date (`Wed, 21 Oct 2015 07:28:00 GMT`) into unix seconds.
pub fn parse_http_date(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.timestamp())
}

/// Format unix seconds as an HTTP date.
pub fn format_http_date(secs: i64) -> Option<String> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .map(|dt| dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
}

fn map_reqwest_error(url: &str, err: reqwest::Error) -> CacheError {
    if err.is_timeout() {
        CacheError::Timeout(format!("{}: {}", url, err))
    } else {
        CacheError::Network(format!("{}: {}", url, err))
    }
}

/// HEAD `url`. Returns `Ok(None)` on 404.
#[instrument(skip(client), fields(url = %url))]
pub async fn probe_metadata(client: &Client, url: &str) -> CacheResult<Option<RemoteMetadata>> {
    let response = client
        .head(url)
        .send()
        .await
        .map_err(|e| map_reqwest_error(url, e))?;

    match response.status() {
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            debug!("Remote file not found");
            return Ok(None);
        }
        status if !status.is_success() => {
            return Err(CacheError::Network(format!(
                "HEAD {} returned {}",
                url, status
            )));
        }
        _ => {}
    }

    // Content-Length of a HEAD response describes the body a GET would return,
    // so it is read from the header rather than from the (empty) body.
    let headers = response.headers();
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| {
            CacheError::InvalidFormat(format!("HEAD {} has no Content-Length", url))
        })?;
    let etag = headers
        .get(header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let last_modified = headers
        .get(header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date);

    debug!(content_length, etag = ?etag, last_modified = ?last_modified, "Probed remote file");

    Ok(Some(RemoteMetadata {
        content_length,
        etag,
        last_modified,
    }))
}

/// Range source for one version of one remote object.
pub struct RemoteRangeBackend {
    client: Client,
    url: String,
    metadata: RemoteMetadata,
    clock: Arc<dyn Clock>,
    last_validated: AtomicI64,
}

impl std::fmt::Debug for RemoteRangeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteRangeBackend")
            .field("url", &self.url)
            .field("metadata", &self.metadata)
            .field("last_validated", &self.last_validated())
            .finish()
    }
}

impl RemoteRangeBackend {
    /// Probe `url` and build a backend for its current version.
    pub async fn probe(
        client: Client,
        url: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> CacheResult<Option<Self>> {
        let url = url.into();
        let Some(metadata) = probe_metadata(&client, &url).await? else {
            return Ok(None);
        };
        let validated_at = clock.now_secs();
        Ok(Some(Self::from_metadata(
            client,
            url,
            metadata,
            clock,
            validated_at,
        )))
    }

    /// Build a backend from metadata obtained earlier, e.g. from the meta-cache.
    pub fn from_metadata(
        client: Client,
        url: impl Into<String>,
        metadata: RemoteMetadata,
        clock: Arc<dyn Clock>,
        validated_at: i64,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            metadata,
            clock,
            last_validated: AtomicI64::new(validated_at),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn metadata(&self) -> &RemoteMetadata {
        &self.metadata
    }

    pub fn version(&self) -> ContentVersion {
        self.metadata.version()
    }

    /// Last time the server confirmed this version, in unix seconds.
    pub fn last_validated(&self) -> i64 {
        self.last_validated.load(Ordering::Relaxed)
    }

    pub fn mark_validated(&self, now: i64) {
        self.last_validated.fetch_max(now, Ordering::Relaxed);
    }

    #[instrument(skip(self), fields(url = %self.url))]
    async fn fetch(&self, offset: u64, len: u64) -> CacheResult<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.metadata.content_length)
            .ok_or(CacheError::InvalidRange {
                offset,
                len,
                file_len: self.metadata.content_length,
            })?;

        let mut request = self
            .client
            .get(&self.url)
            .header(header::RANGE, format!("bytes={}-{}", offset, end - 1));
        if let Some(etag) = &self.metadata.etag {
            request = request.header(header::IF_MATCH, etag.as_str());
        }
        if let Some(date) = self.metadata.last_modified.and_then(format_http_date) {
            request = request.header(header::IF_UNMODIFIED_SINCE, date);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_reqwest_error(&self.url, e))?;

        let status = response.status();
        match status {
            StatusCode::PRECONDITION_FAILED | StatusCode::RANGE_NOT_SATISFIABLE => {
                warn!(status = %status, "Remote file changed under an open backend");
                return Err(CacheError::stale(format!("{} returned {}", self.url, status)));
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                return Err(CacheError::stale(format!("{} disappeared", self.url)));
            }
            StatusCode::PARTIAL_CONTENT => {}
            // A server ignoring Range sends the whole object; accept it when
            // only the whole object was asked for.
            StatusCode::OK if offset == 0 && len == self.metadata.content_length => {}
            status => {
                return Err(CacheError::Network(format!(
                    "GET {} returned {}",
                    self.url, status
                )));
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(&self.url, e))?;
        if body.len() as u64 != len {
            warn!(expected = len, got = body.len(), "Range response has wrong length");
            return Err(CacheError::stale(format!(
                "{} returned {} bytes for a {} byte range",
                self.url,
                body.len(),
                len
            )));
        }

        self.mark_validated(self.clock.now_secs());
        Ok(body)
    }
}

#[async_trait]
impl RangeSource for RemoteRangeBackend {
    fn len(&self) -> u64 {
        self.metadata.content_length
    }

    async fn get_range(&self, offset: u64, len: u64) -> CacheResult<Bytes> {
        self.fetch(offset, len).await
    }
}
