//! In-process HTTP object store for tests.
//!
//! Serves objects put into it with `ETag` and `Last-Modified`, answers
//! `HEAD`, `Range: bytes=a-b`, and honours `If-Match` and
//! `If-Unmodified-Since` the way S3 does (412 on mismatch, 416 for a range
//! starting past the end).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use tokio::task::JoinHandle;

/// One stored object version.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub etag: String,
    pub last_modified: i64,
}

/// A request seen by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub range: Option<String>,
}

#[derive(Default)]
struct ServerState {
    objects: RwLock<HashMap<String, StoredObject>>,
    requests: RwLock<Vec<RecordedRequest>>,
    head_count: AtomicUsize,
    get_count: AtomicUsize,
    versions: AtomicU64,
    delay_ms: AtomicU64,
    ignore_preconditions: AtomicBool,
}

/// Running test server. Stops when dropped.
pub struct RangeServer {
    base_url: String,
    state: Arc<ServerState>,
    handle: JoinHandle<()>,
}

impl RangeServer {
    /// Bind to an ephemeral localhost port and start serving.
    pub async fn start() -> std::io::Result<Self> {
        let state = Arc::new(ServerState::default());
        let app = Router::new()
            .route("/*path", get(serve_object))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self {
            base_url: format!("http://{}", addr),
            state,
            handle,
        })
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Store a new version of `path`, modified now.
    pub fn put(&self, path: &str, data: impl Into<Bytes>) -> StoredObject {
        self.put_modified_at(path, data, Utc::now().timestamp())
    }

    /// Store a new version of `path` with an explicit Last-Modified.
    pub fn put_modified_at(
        &self,
        path: &str,
        data: impl Into<Bytes>,
        last_modified: i64,
    ) -> StoredObject {
        let version = self.state.versions.fetch_add(1, Ordering::SeqCst) + 1;
        let object = StoredObject {
            data: data.into(),
            etag: format!("\"v{}\"", version),
            last_modified,
        };
        if let Ok(mut objects) = self.state.objects.write() {
            objects.insert(path.trim_start_matches('/').to_string(), object.clone());
        }
        object
    }

    pub fn remove(&self, path: &str) {
        if let Ok(mut objects) = self.state.objects.write() {
            objects.remove(path.trim_start_matches('/'));
        }
    }

    /// Delay every response, to widen race windows.
    pub fn set_delay(&self, delay: Duration) {
        self.state
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Serve ranges of the current version regardless of validators, like a
    /// server without conditional request support.
    pub fn set_ignore_preconditions(&self, ignore: bool) {
        self.state
            .ignore_preconditions
            .store(ignore, Ordering::SeqCst);
    }

    pub fn head_count(&self) -> usize {
        self.state.head_count.load(Ordering::SeqCst)
    }

    pub fn get_count(&self) -> usize {
        self.state.get_count.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state
            .requests
            .read()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn reset_counts(&self) {
        self.state.head_count.store(0, Ordering::SeqCst);
        self.state.get_count.store(0, Ordering::SeqCst);
        if let Ok(mut requests) = self.state.requests.write() {
            requests.clear();
        }
    }
}

impl Drop for RangeServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Format unix seconds as an HTTP date.
pub fn http_date(secs: i64) -> String {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or_default()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

fn parse_http_date(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.timestamp())
}

/// Parse `bytes=a-b` or `bytes=a-` into an inclusive range clamped to `len`.
/// `Err(())` means unsatisfiable.
fn parse_range(value: &str, len: u64) -> Option<Result<(u64, u64), ()>> {
    let bounds = value.strip_prefix("bytes=")?;
    let (start, end) = bounds.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = match end.trim() {
        "" => len.saturating_sub(1),
        end => end.parse().ok()?,
    };
    if start >= len || end < start {
        return Some(Err(()));
    }
    Some(Ok((start, end.min(len - 1))))
}

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn serve_object(
    State(state): State<Arc<ServerState>>,
    Path(path): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let range = header_str(&headers, header::RANGE).map(str::to_string);
    if let Ok(mut requests) = state.requests.write() {
        requests.push(RecordedRequest {
            method: method.to_string(),
            path: path.clone(),
            range: range.clone(),
        });
    }
    if method == Method::HEAD {
        state.head_count.fetch_add(1, Ordering::SeqCst);
    } else {
        state.get_count.fetch_add(1, Ordering::SeqCst);
    }

    let delay = state.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let object = state
        .objects
        .read()
        .ok()
        .and_then(|objects| objects.get(&path).cloned());
    let Some(object) = object else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let validators = [
        (header::ETAG, object.etag.clone()),
        (header::LAST_MODIFIED, http_date(object.last_modified)),
        (header::ACCEPT_RANGES, "bytes".to_string()),
    ];

    // HEAD describes the whole object; the body is dropped by the server.
    if method == Method::HEAD {
        let content_length = [(header::CONTENT_LENGTH, object.data.len().to_string())];
        return (StatusCode::OK, validators, content_length, Body::from(object.data))
            .into_response();
    }

    if !state.ignore_preconditions.load(Ordering::SeqCst) {
        if let Some(expected) = header_str(&headers, header::IF_MATCH) {
            if expected != "*" && expected != object.etag {
                return StatusCode::PRECONDITION_FAILED.into_response();
            }
        }
        if let Some(since) =
            header_str(&headers, header::IF_UNMODIFIED_SINCE).and_then(parse_http_date)
        {
            if object.last_modified > since {
                return StatusCode::PRECONDITION_FAILED.into_response();
            }
        }
    }

    let len = object.data.len() as u64;
    match range.as_deref().and_then(|r| parse_range(r, len)) {
        None => (StatusCode::OK, validators, Body::from(object.data)).into_response(),
        Some(Err(())) => (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, format!("bytes */{}", len))],
        )
            .into_response(),
        Some(Ok((start, end))) => {
            let body = object.data.slice(start as usize..end as usize + 1);
            (
                StatusCode::PARTIAL_CONTENT,
                validators,
                [(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, end, len),
                )],
                Body::from(body),
            )
                .into_response()
        }
    }
}
