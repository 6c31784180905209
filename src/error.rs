//! Error types for file transfers.

use std::io;
use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors raised while preparing or running a file transfer.
///
/// [`SendError::NotFound`] and [`SendError::OpenFailed`] are surfaced before
/// any body byte is written, so the caller can still produce a clean error
/// response. I/O failures after streaming has begun terminate the transfer;
/// the status line is already on the wire by then and cannot be amended.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("file not found or unreadable: {path}")]
    NotFound { path: PathBuf },

    #[error("cannot open {path} for streaming: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("i/o error during transfer: {0}")]
    Io(#[from] io::Error),
}

impl SendError {
    /// HTTP status code this error translates to.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::OpenFailed { .. } | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for SendError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, "file transfer failed");
        }
        (status, self.to_string()).into_response()
    }
}
