//! File metadata and cache validators.
//!
//! A transfer starts by snapshotting the target file: size, modification
//! time, and a stable identity string. The ETag is derived from that
//! snapshot, so it stays constant across requests for an unchanged file and
//! changes whenever the file is replaced, truncated, or touched.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use sha1::{Digest, Sha1};

use crate::error::SendError;

/// Read-only snapshot of the file being served.
#[derive(Debug, Clone)]
pub struct FileMetadata {
    /// Total file size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: SystemTime,
    /// Opaque stable identifier for the file (inode on unix).
    pub identity: String,
    /// Base name of the file, used for the default disposition filename.
    pub name: String,
}

impl FileMetadata {
    /// Snapshot `path` via [`tokio::fs::metadata`].
    ///
    /// Any failure here, including the path naming a directory, is reported
    /// as [`SendError::NotFound`] so the caller can answer before a single
    /// header has been written.
    pub async fn for_path(path: &Path) -> Result<FileMetadata, SendError> {
        let not_found = || SendError::NotFound { path: path.to_path_buf() };

        let meta = tokio::fs::metadata(path).await.map_err(|_| not_found())?;
        if !meta.is_file() {
            return Err(not_found());
        }

        let modified = meta.modified().map_err(|_| not_found())?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());

        Ok(FileMetadata {
            size: meta.len(),
            modified,
            identity: identity_of(&meta),
            name,
        })
    }

    /// Cache validator: SHA-1 over identity, mtime, and size.
    ///
    /// Used both as the `Etag` response header and as the comparand for
    /// `If-Range` revalidation.
    pub fn etag(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.identity.as_bytes());
        hasher.update(unix_seconds(self.modified).to_string().as_bytes());
        hasher.update(self.size.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// `Last-Modified` value, RFC-1123 formatted in GMT.
    pub fn last_modified(&self) -> String {
        httpdate::fmt_http_date(self.modified)
    }
}

#[cfg(unix)]
fn identity_of(meta: &std::fs::Metadata) -> String {
    use std::os::unix::fs::MetadataExt;
    format!("{}:{}", meta.dev(), meta.ino())
}

#[cfg(not(unix))]
fn identity_of(meta: &std::fs::Metadata) -> String {
    // No stable per-file id on this platform; the mtime and size folded into
    // the ETag still catch content changes.
    format!("len:{}", meta.len())
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Best-effort MIME type lookup by file extension.
pub fn detect_mime_type(path: &Path) -> Option<String> {
    mime_guess::from_path(path)
        .first()
        .map(|mime| mime.essence_str().to_string())
}
