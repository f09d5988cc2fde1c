//! Local HTTP bridge
//!
//! Serves the published [`VirtualFileSet`] at `/stream/<index>` on a loopback
//! port so the player can pull and seek through files that only exist in the
//! piece cache. Every request gets its own [`FileReader`]; a request for bytes
//! that have not arrived yet simply waits, and the player sees a slow server.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::stream::{self, Stream};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::reader::{readahead_window_with_min, FileReader, MIN_READAHEAD};
use crate::engine::TransferEngine;
use crate::models::FileEntry;
use crate::storage::{CacheError, MemTransfer};

/// Largest chunk handed to the response body at once
const CHUNK_SIZE: u64 = 64 * 1024;

/// Errors from the streaming bridge
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind stream server: {0}")]
    Bind(#[source] std::io::Error),
    #[error("stream server failed: {0}")]
    Serve(#[source] std::io::Error),
    #[error("stream server is already serving")]
    AlreadyServing,
    #[error("no files published")]
    NotPublished,
    #[error("file index {index} out of range ({len} published)")]
    IndexOutOfRange { index: usize, len: usize },
}

// =============================================================================
// Virtual File Set
// =============================================================================

/// Ordered set of playable files backed by one transfer
pub struct VirtualFileSet {
    transfer: Arc<MemTransfer>,
    engine: Arc<dyn TransferEngine>,
    entries: Vec<FileEntry>,
}

impl VirtualFileSet {
    pub fn new(
        transfer: Arc<MemTransfer>,
        engine: Arc<dyn TransferEngine>,
        entries: Vec<FileEntry>,
    ) -> Self {
        Self {
            transfer,
            engine,
            entries,
        }
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&FileEntry> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn reader(&self, entry: &FileEntry) -> FileReader {
        FileReader::new(
            Arc::clone(&self.transfer),
            Arc::clone(&self.engine),
            entry.clone(),
        )
    }
}

impl std::fmt::Debug for VirtualFileSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualFileSet")
            .field("transfer", self.transfer.id())
            .field("entries", &self.entries)
            .finish()
    }
}

// =============================================================================
// Server
// =============================================================================

struct Shared {
    files: RwLock<Option<Arc<VirtualFileSet>>>,
    readahead_min: u64,
    shutdown: CancellationToken,
}

impl Shared {
    /// Current set, taken under the read lock and released before any I/O
    fn snapshot(&self) -> Option<Arc<VirtualFileSet>> {
        self.files.read().clone()
    }
}

/// Loopback HTTP server for the published files
pub struct StreamServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    listener: Mutex<Option<TcpListener>>,
    shutdown: CancellationToken,
}

impl StreamServer {
    /// Bind an OS-assigned port on 127.0.0.1.
    pub async fn bind() -> Result<Self, ServerError> {
        Self::bind_with_readahead(MIN_READAHEAD).await
    }

    /// Like [`StreamServer::bind`], with a custom read-ahead floor.
    pub async fn bind_with_readahead(readahead_min: u64) -> Result<Self, ServerError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(ServerError::Bind)?;
        let addr = listener.local_addr().map_err(ServerError::Bind)?;
        info!("Stream server bound on {}", addr);

        let shutdown = CancellationToken::new();
        Ok(Self {
            addr,
            shared: Arc::new(Shared {
                files: RwLock::new(None),
                readahead_min,
                shutdown: shutdown.clone(),
            }),
            listener: Mutex::new(Some(listener)),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Replace the servable files. In-flight requests keep the set they started with.
    pub fn publish(&self, files: VirtualFileSet) {
        debug!(entries = files.len(), "publishing file set");
        *self.shared.files.write() = Some(Arc::new(files));
    }

    /// Withdraw the published set; later requests get `503`.
    pub fn unpublish(&self) {
        *self.shared.files.write() = None;
    }

    pub fn published(&self) -> Option<Arc<VirtualFileSet>> {
        self.shared.snapshot()
    }

    /// URL the player should open for entry `index` of the current set.
    pub fn build_url(&self, index: usize) -> Result<String, ServerError> {
        let files = self.shared.snapshot().ok_or(ServerError::NotPublished)?;
        if index >= files.len() {
            return Err(ServerError::IndexOutOfRange {
                index,
                len: files.len(),
            });
        }
        Ok(format!("http://{}/stream/{}", self.addr, index))
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/stream", get(stream_single).head(stream_single))
            .route("/stream/:index", get(stream_index).head(stream_index))
            .with_state(Arc::clone(&self.shared))
    }

    /// Accept connections until [`StreamServer::shutdown`] is called.
    pub async fn serve(&self) -> Result<(), ServerError> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or(ServerError::AlreadyServing)?;
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let shutdown = self.shutdown.clone();

        info!("Stream server listening on http://{}", self.addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(ServerError::Serve)?;
        info!("Stream server stopped");
        Ok(())
    }

    /// Stop accepting connections and end in-flight bodies; the port is
    /// released once `serve` returns.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn stream_index(
    State(shared): State<Arc<Shared>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(raw): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    if !peer.ip().is_loopback() {
        warn!(%peer, "rejected non-local client");
        return StatusCode::FORBIDDEN.into_response();
    }
    // negative indices are well formed but never published
    let Ok(index) = raw.parse::<i64>() else {
        return (StatusCode::BAD_REQUEST, "invalid file index").into_response();
    };
    let Some(files) = shared.snapshot().filter(|files| !files.is_empty()) else {
        return (StatusCode::SERVICE_UNAVAILABLE, "nothing published").into_response();
    };
    let Ok(index) = usize::try_from(index) else {
        return (StatusCode::NOT_FOUND, "no such file").into_response();
    };
    respond(&shared, &files, index, &method, &headers)
}

async fn stream_single(
    State(shared): State<Arc<Shared>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    if !peer.ip().is_loopback() {
        warn!(%peer, "rejected non-local client");
        return StatusCode::FORBIDDEN.into_response();
    }
    let Some(files) = shared.snapshot().filter(|files| !files.is_empty()) else {
        return (StatusCode::SERVICE_UNAVAILABLE, "nothing published").into_response();
    };
    if files.len() != 1 {
        return (StatusCode::BAD_REQUEST, "file index required").into_response();
    }
    respond(&shared, &files, 0, &method, &headers)
}

fn respond(
    shared: &Shared,
    files: &VirtualFileSet,
    index: usize,
    method: &Method,
    headers: &HeaderMap,
) -> Response {
    let Some(entry) = files.get(index) else {
        return (StatusCode::NOT_FOUND, "no such file").into_response();
    };
    let length = entry.length;
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());

    let (status, start, end) = match parse_range(range, length) {
        ByteRange::Full => (StatusCode::OK, 0, length),
        ByteRange::Partial { start, end } => (StatusCode::PARTIAL_CONTENT, start, end + 1),
        ByteRange::Unsatisfiable => {
            return Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{}", length))
                .header(header::ACCEPT_RANGES, "bytes")
                .body(Body::empty())
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }
    };
    debug!(index, file = %entry.name, start, end, %method, "stream request");

    let mime = mime_guess::from_path(&entry.name).first_or_octet_stream();
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, mime.as_ref())
        .header(header::CONTENT_LENGTH, end - start)
        .header(header::ACCEPT_RANGES, "bytes");
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, end - 1, length),
        );
    }

    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        let mut reader = files.reader(entry);
        reader.set_readahead(readahead_window_with_min(length, shared.readahead_min));
        reader.seek(start);
        Body::from_stream(body_stream(reader, end - start, shared.shutdown.clone()))
    };

    match builder.body(body) {
        Ok(response) => response,
        Err(e) => {
            warn!("failed to build response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Stream `remaining` bytes from `reader`; dropping the stream drops any pending read.
fn body_stream(
    reader: FileReader,
    remaining: u64,
    shutdown: CancellationToken,
) -> impl Stream<Item = Result<Bytes, CacheError>> + Send + 'static {
    stream::unfold(
        (reader, remaining, shutdown),
        |(mut reader, remaining, shutdown)| async move {
            if remaining == 0 {
                return None;
            }
            let mut buf = vec![0u8; remaining.min(CHUNK_SIZE) as usize];
            let read = tokio::select! {
                read = reader.read(&mut buf) => read,
                _ = shutdown.cancelled() => return None,
            };
            match read {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(Bytes::from(buf)), (reader, remaining - n as u64, shutdown)))
                }
                Err(e) => {
                    debug!("stream aborted: {}", e);
                    Some((Err(e), (reader, 0, shutdown)))
                }
            }
        },
    )
}

// =============================================================================
// Range parsing
// =============================================================================

/// Outcome of interpreting a `Range` header against a body of known length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// No usable range; send the whole body
    Full,
    /// Inclusive byte span
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Interpret a single `bytes=` range (`a-b`, `a-`, `-n`).
///
/// Multi-range requests, other units and malformed values fall back to the
/// full body.
pub fn parse_range(header: Option<&str>, length: u64) -> ByteRange {
    let Some(header) = header else {
        return ByteRange::Full;
    };
    let header = header.trim().to_ascii_lowercase();
    let Some(spec) = header.strip_prefix("bytes=") else {
        return ByteRange::Full;
    };
    if spec.contains(',') {
        return ByteRange::Full;
    }
    let Some((a, b)) = spec.trim().split_once('-') else {
        return ByteRange::Full;
    };

    if a.is_empty() {
        let Ok(suffix) = b.parse::<u64>() else {
            return ByteRange::Full;
        };
        if suffix == 0 || length == 0 {
            return ByteRange::Unsatisfiable;
        }
        return ByteRange::Partial {
            start: length.saturating_sub(suffix),
            end: length - 1,
        };
    }

    let Ok(start) = a.parse::<u64>() else {
        return ByteRange::Full;
    };
    let end = if b.is_empty() {
        None
    } else {
        match b.parse::<u64>() {
            Ok(end) => Some(end),
            Err(_) => return ByteRange::Full,
        }
    };
    if end.is_some_and(|end| end < start) {
        return ByteRange::Full;
    }
    if start >= length {
        return ByteRange::Unsatisfiable;
    }
    let last = length - 1;
    ByteRange::Partial {
        start,
        end: end.map_or(last, |end| end.min(last)),
    }
}
