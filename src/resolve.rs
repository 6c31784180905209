//! Range negotiation: turning request headers into a transfer plan.
//!
//! Pure computation over the request headers and a [`FileMetadata`]
//! snapshot; no I/O happens here. The driver writes the plan's status and
//! headers and then streams the plan's byte window.

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;

use crate::file::FileMetadata;

/// Far-past `Expires` value; with `Cache-Control: private` it keeps shared
/// caches from holding on to the download.
const EXPIRES_IN_THE_PAST: &str = "Mon, 26 Jul 1997 05:00:00 GMT";

/// Byte window selected for transfer, start inclusive, end exclusive.
///
/// The inclusive form used on the wire (`Content-Range`) is
/// `start..=end_exclusive - 1`; `len()` is the number of bytes transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteWindow {
    pub start: u64,
    pub end_exclusive: u64,
}

impl ByteWindow {
    pub fn new(start: u64, end_exclusive: u64) -> Self {
        ByteWindow { start, end_exclusive }
    }

    /// Window covering a whole file of `size` bytes.
    pub fn full(size: u64) -> Self {
        ByteWindow { start: 0, end_exclusive: size }
    }

    pub fn len(&self) -> u64 {
        self.end_exclusive - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-call presentation options for a transfer.
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    /// Filename to advertise in `Content-Disposition`; defaults to the
    /// file's base name.
    pub file_name: Option<String>,
    /// `Content-Type` override; defaults to an extension-based guess, or
    /// `application/octet-stream` when nothing matches.
    pub content_type: Option<String>,
    /// Serve inline instead of as an attachment.
    pub inline: bool,
}

/// Status, byte window, and response headers for one transfer.
///
/// Built once per request from immutable inputs and consumed once by the
/// driver; the header map preserves insertion order.
#[derive(Debug, Clone)]
pub struct TransferPlan {
    pub status: StatusCode,
    pub window: ByteWindow,
    pub headers: HeaderMap,
}

/// Resolve the request into a [`TransferPlan`].
///
/// A request is served partially (206) only when it carries a `Range` header
/// whose first sub-range resolves to a valid window, and any `If-Range`
/// validator matches `etag`. Everything else, including malformed or
/// out-of-bounds ranges, falls back to a full 200 response: a bad range hint
/// is ignored rather than rejected.
pub fn resolve(
    request: &HeaderMap,
    meta: &FileMetadata,
    etag: &str,
    options: &TransferOptions,
) -> TransferPlan {
    let (status, window) = match requested_window(request, etag, meta.size) {
        Some(window) => (StatusCode::PARTIAL_CONTENT, window),
        None => (StatusCode::OK, ByteWindow::full(meta.size)),
    };

    let mut headers = HeaderMap::new();

    let content_type = options
        .content_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    insert_str(&mut headers, header::CONTENT_TYPE, content_type);

    let kind = if options.inline { "inline" } else { "attachment" };
    let file_name = options.file_name.as_deref().unwrap_or(&meta.name);
    insert_str(
        &mut headers,
        header::CONTENT_DISPOSITION,
        &format!("{}; filename=\"{}\"", kind, sanitize_file_name(file_name)),
    );

    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    insert_str(&mut headers, header::ETAG, etag);
    insert_str(&mut headers, header::LAST_MODIFIED, &meta.last_modified());

    // The three below make the download non-cacheable.
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("private"));
    headers.insert(header::EXPIRES, HeaderValue::from_static(EXPIRES_IN_THE_PAST));

    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(window.len()));
    if status == StatusCode::PARTIAL_CONTENT {
        insert_str(
            &mut headers,
            header::CONTENT_RANGE,
            &format!(
                "bytes {}-{}/{}",
                window.start,
                window.end_exclusive - 1,
                meta.size
            ),
        );
    }

    TransferPlan { status, window, headers }
}

/// The window asked for by the request, if the request is honored as a range
/// request. `None` means serve the whole file.
fn requested_window(request: &HeaderMap, etag: &str, size: u64) -> Option<ByteWindow> {
    let range = request.get(header::RANGE)?.to_str().ok()?;

    // If-Range guards against the file having changed since the client
    // cached its earlier part; on mismatch the range is not honored.
    if let Some(if_range) = request.get(header::IF_RANGE) {
        if if_range.to_str().ok() != Some(etag) {
            tracing::debug!("if-range validator mismatch, serving full content");
            return None;
        }
    }

    let window = parse_first_range(range, size);
    if window.is_none() {
        tracing::debug!(range, "ignoring invalid range header");
    }
    window
}

/// Parse the first sub-range of a `bytes=<start>-[<end>]` header value.
///
/// Additional comma-separated sub-ranges are discarded. A missing end means
/// "through the last byte"; an end past the last byte is reduced to it.
fn parse_first_range(value: &str, size: u64) -> Option<ByteWindow> {
    let set = value.strip_prefix("bytes=")?;
    let first = set.split(',').next()?.trim();
    let (start, end) = first.split_once('-')?;

    let start: u64 = start.trim().parse().ok()?;
    let end = end.trim();
    let end: u64 = if end.is_empty() {
        size.checked_sub(1)?
    } else {
        end.parse().ok()?
    };

    if end < start || start >= size {
        return None;
    }

    Some(ByteWindow::new(start, end.min(size - 1) + 1))
}

fn insert_str(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c == '"' || (!c.is_ascii_graphic() && c != ' ') {
                '_'
            } else {
                c
            }
        })
        .collect()
}
