//! # axum-sendfile
//!
//! Throttled single-file HTTP responses for [`axum`][1], with support for
//! byte-range requests (resumable downloads), `If-Range` revalidation, and
//! per-connection bandwidth pacing.
//!
//! [`SendFile`] is the entry point: it snapshots the file, negotiates the
//! byte window against the request's `Range`/`If-Range` headers, and
//! responds with a [`ThrottledStream`] body that emits the window in paced
//! chunks. The negotiation itself is the pure [`resolve`] function, and the
//! body works over any type implementing [`AsyncRead`] and
//! [`AsyncSeekStart`], so both halves can be used on their own.
//!
//! [`AsyncSeekStart`] is a trait defined by this crate which only allows
//! seeking from the start of a file. It is automatically implemented for any
//! type implementing [`AsyncSeek`].
//!
//! ```no_run
//! use axum::http::HeaderMap;
//! use axum::response::{IntoResponse, Response};
//!
//! use axum_sendfile::{SendFile, ThrottleConfig, TransferOptions};
//!
//! async fn download(headers: HeaderMap) -> Response {
//!     SendFile::new("document.txt")
//!         .options(TransferOptions::default())
//!         .throttle(ThrottleConfig::default())
//!         .respond(&headers)
//!         .await
//!         .into_response()
//! }
//! ```
//!
//! [1]: https://docs.rs/axum
//! [`AsyncRead`]: tokio::io::AsyncRead

mod error;
mod file;
mod resolve;
mod stream;

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use tokio::fs::File;
use tokio::io::AsyncSeek;

pub use error::SendError;
pub use file::{detect_mime_type, FileMetadata};
pub use resolve::{resolve, ByteWindow, TransferOptions, TransferPlan};
pub use stream::{stream_range, ThrottleConfig, ThrottledStream, DEFAULT_CHUNK_BYTES, DEFAULT_DELAY};

/// [`AsyncSeek`] narrowed to only allow seeking from start.
pub trait AsyncSeekStart {
    /// Same semantics as [`AsyncSeek::start_seek`], always passing position as the `SeekFrom::Start` variant.
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()>;

    /// Same semantics as [`AsyncSeek::poll_complete`], returning `()` instead of the new stream position.
    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

impl<T: AsyncSeek> AsyncSeekStart for T {
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()> {
        AsyncSeek::start_seek(self, io::SeekFrom::Start(position))
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncSeek::poll_complete(self, cx).map_ok(|_| ())
    }
}

/// One file transfer: path plus per-call options, consumed by
/// [`respond`](SendFile::respond).
///
/// Options and throttle are plain values scoped to this call; nothing is
/// shared across transfers.
#[derive(Debug, Clone)]
pub struct SendFile {
    path: PathBuf,
    options: TransferOptions,
    throttle: ThrottleConfig,
}

impl SendFile {
    /// Transfer `path` with default options and throttling.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SendFile {
            path: path.into(),
            options: TransferOptions::default(),
            throttle: ThrottleConfig::default(),
        }
    }

    pub fn options(mut self, options: TransferOptions) -> Self {
        self.options = options;
        self
    }

    pub fn throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }

    /// Negotiate against `request` and build the response.
    ///
    /// Metadata and open failures are returned before anything is written,
    /// so the caller can still answer with a clean error status. Once the
    /// response is handed to the server, I/O failures and client
    /// disconnects only truncate the body.
    pub async fn respond(self, request: &HeaderMap) -> Result<Response, SendError> {
        let meta = FileMetadata::for_path(&self.path).await?;
        let etag = meta.etag();

        let mut options = self.options;
        if options.content_type.is_none() {
            options.content_type = detect_mime_type(&self.path);
        }

        let plan = resolve(request, &meta, &etag, &options);

        let file = File::open(&self.path)
            .await
            .map_err(|source| SendError::OpenFailed { path: self.path.clone(), source })?;

        tracing::debug!(
            path = %self.path.display(),
            status = %plan.status,
            start = plan.window.start,
            len = plan.window.len(),
            "sending file"
        );

        let mut response = ThrottledStream::new(file, plan.window, self.throttle).into_response();
        *response.status_mut() = plan.status;

        let headers = response.headers_mut();
        // paced chunks are pointless if an intermediary buffers them up
        headers.insert(
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        );
        headers.extend(plan.headers);

        Ok(response)
    }
}
