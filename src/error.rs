//! Error types for the mdimage-kit library.
//!
//! Two layers reflect two distinct failure modes:
//!
//! * [`KitError`] is **fatal**: the call cannot proceed at all (invalid
//!   configuration, unreadable document, a rewrite plan that does not fit the
//!   text). Returned as `Err(KitError)` from the top-level entry points.
//!
//! * [`TaskError`] is **non-fatal**: a single image failed (unreadable file,
//!   corrupt pixels, upload rejected) but every sibling image is unaffected.
//!   Stored inside [`crate::pipeline::UploadResult`] so the caller sees
//!   exactly which references were left untouched and why.
//!
//! The component-level enums ([`StorageError`], [`ThumbnailError`],
//! [`CacheError`]) classify failures at their source and are folded into a
//! [`TaskError`] by the pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the mdimage-kit library.
///
/// Per-image failures use [`TaskError`] and never surface here.
#[derive(Debug, Error)]
pub enum KitError {
    // ── Document errors ───────────────────────────────────────────────────
    /// The document file was not found at the given path.
    #[error("Document not found: '{path}'\nCheck the path exists and is readable.")]
    DocumentNotFound { path: PathBuf },

    /// The document could not be read.
    #[error("Failed to read document '{path}': {source}")]
    DocumentReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The rewritten document could not be written.
    #[error("Failed to write document '{path}': {source}")]
    DocumentWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A rewrite plan does not fit the text it was applied to.
    ///
    /// Nothing is written when this is returned: plans are all-or-nothing.
    #[error("Rewrite plan rejected: {0}")]
    RewriteConflict(#[from] RewriteError),

    // ── Backend errors ────────────────────────────────────────────────────
    /// The selected backend is missing required settings.
    #[error("Storage backend '{backend}' is not configured.\n{hint}")]
    BackendNotConfigured { backend: String, hint: String },

    /// `backendIdentifier` names no known backend.
    #[error("Unknown storage backend '{0}' (expected one of: local, github, http, custom)")]
    UnknownBackend(String),

    // ── Cache errors ──────────────────────────────────────────────────────
    /// The upload cache could not be saved.
    #[error("Failed to save upload cache: {0}")]
    CacheSaveFailed(#[source] CacheError),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder or options-map validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single image.
///
/// Stored alongside [`crate::pipeline::UploadResult`] when an image fails.
/// The reference it belongs to is left untouched in the document.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    /// The local asset could not be read.
    #[error("cannot read '{path}': {detail}")]
    ReadError { path: String, detail: String },

    /// The asset is not an image format we can process.
    #[error("unsupported image format: {detail}")]
    UnsupportedFormat { detail: String },

    /// The image data is corrupt or could not be re-encoded.
    #[error("image processing failed: {detail}")]
    ProcessingError { detail: String },

    /// The storage backend refused the upload (after retries if transient).
    #[error("upload failed after {attempts} attempt(s) [{kind}]: {detail}")]
    Upload {
        #[serde(rename = "error_kind")]
        kind: StorageErrorKind,
        attempts: u32,
        detail: String,
    },

    /// Cancellation arrived before the task was admitted.
    #[error("cancelled before upload started")]
    Cancelled,

    /// The overall run timeout elapsed before the task finished.
    #[error("run timed out before upload finished")]
    TimedOut,
}

impl From<ThumbnailError> for TaskError {
    fn from(e: ThumbnailError) -> Self {
        match e {
            ThumbnailError::UnsupportedFormat(detail) => TaskError::UnsupportedFormat { detail },
            ThumbnailError::ProcessingError(detail) => TaskError::ProcessingError { detail },
        }
    }
}

// ── Storage ──────────────────────────────────────────────────────────────────

/// Classified failure from a storage backend.
///
/// Every backend maps its transport and HTTP failures onto these variants so
/// the coordinator can decide between retrying and giving up without knowing
/// which backend it talks to.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Credentials missing, expired or rejected (HTTP 401/403).
    #[error("authentication rejected: {0}")]
    AuthError(String),

    /// Storage quota or object size limit exhausted.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Transport failure, timeout or server-side 5xx.
    #[error("network error: {0}")]
    NetworkError(String),

    /// HTTP 429: back off before trying again.
    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The backend understood the request and refused it.
    #[error("rejected by backend (status {status:?}): {detail}")]
    BackendRejected { status: Option<u16>, detail: String },
}

/// Serialisable discriminant of [`StorageError`], kept in task reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageErrorKind {
    Auth,
    Quota,
    Network,
    RateLimited,
    Rejected,
}

impl std::fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StorageErrorKind::Auth => "auth",
            StorageErrorKind::Quota => "quota",
            StorageErrorKind::Network => "network",
            StorageErrorKind::RateLimited => "rate-limited",
            StorageErrorKind::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

impl StorageError {
    /// Transient conditions worth another attempt after a backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            StorageError::NetworkError(_) | StorageError::RateLimited { .. }
        )
    }

    pub fn kind(&self) -> StorageErrorKind {
        match self {
            StorageError::AuthError(_) => StorageErrorKind::Auth,
            StorageError::QuotaExceeded(_) => StorageErrorKind::Quota,
            StorageError::NetworkError(_) => StorageErrorKind::Network,
            StorageError::RateLimited { .. } => StorageErrorKind::RateLimited,
            StorageError::BackendRejected { .. } => StorageErrorKind::Rejected,
        }
    }

    /// Server-requested delay, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            StorageError::RateLimited { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }

    pub(crate) fn into_task_error(self, attempts: u32) -> TaskError {
        TaskError::Upload {
            kind: self.kind(),
            attempts,
            detail: self.to_string(),
        }
    }
}

// ── Thumbnail ────────────────────────────────────────────────────────────────

/// Failure from the thumbnail generator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThumbnailError {
    /// Input bytes are not a recognised image format.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Input is an image but could not be decoded or re-encoded.
    #[error("processing error: {0}")]
    ProcessingError(String),
}

// ── Cache ────────────────────────────────────────────────────────────────────

/// Failure while loading or saving the persisted upload cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The persisted cache exists but cannot be understood.
    #[error("cache corrupted: {0}")]
    Corruption(String),

    #[error("cache I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache serialisation failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ── Rewrite ──────────────────────────────────────────────────────────────────

/// Why a rewrite plan could not be applied to a text buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RewriteError {
    #[error("span {start}..{end} is outside the document ({len} bytes)")]
    OutOfBounds { start: usize, end: usize, len: usize },

    #[error("span {start}..{end} does not fall on UTF-8 character boundaries")]
    NotCharBoundary { start: usize, end: usize },

    #[error("spans {first_start}..{first_end} and {second_start}..{second_end} overlap")]
    Overlap {
        first_start: usize,
        first_end: usize,
        second_start: usize,
        second_end: usize,
    },

    #[error("text at {start}..{end} changed: expected {expected:?}, found {found:?}")]
    StaleSpan {
        start: usize,
        end: usize,
        expected: String,
        found: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_and_rate_limit_are_retriable() {
        assert!(StorageError::NetworkError("reset".into()).is_retriable());
        assert!(StorageError::RateLimited {
            retry_after_secs: Some(2)
        }
        .is_retriable());
    }

    #[test]
    fn auth_quota_and_rejection_are_terminal() {
        assert!(!StorageError::AuthError("bad token".into()).is_retriable());
        assert!(!StorageError::QuotaExceeded("full".into()).is_retriable());
        assert!(!StorageError::BackendRejected {
            status: Some(400),
            detail: "bad key".into()
        }
        .is_retriable());
    }

    #[test]
    fn upload_task_error_display() {
        let e = StorageError::AuthError("invalid key".into()).into_task_error(1);
        let msg = e.to_string();
        assert!(msg.contains("1 attempt"), "got: {msg}");
        assert!(msg.contains("[auth]"), "got: {msg}");
        assert!(msg.contains("invalid key"), "got: {msg}");
    }

    #[test]
    fn thumbnail_errors_map_onto_task_errors() {
        let t: TaskError = ThumbnailError::UnsupportedFormat("text/plain".into()).into();
        assert!(matches!(t, TaskError::UnsupportedFormat { .. }));
        let t: TaskError = ThumbnailError::ProcessingError("truncated".into()).into();
        assert!(matches!(t, TaskError::ProcessingError { .. }));
    }

    #[test]
    fn task_error_serialises_with_kind_tag() {
        let json = serde_json::to_string(&TaskError::Cancelled).unwrap();
        assert_eq!(json, r#"{"kind":"cancelled"}"#);
    }

    #[test]
    fn upload_task_error_roundtrips_through_json() {
        let e = StorageError::QuotaExceeded("bucket full".into()).into_task_error(3);
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["kind"], "upload");
        assert_eq!(json["error_kind"], "quota");
        assert_eq!(json["attempts"], 3);

        let back: TaskError = serde_json::from_value(json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn rewrite_conflict_wraps_source() {
        let e: KitError = RewriteError::OutOfBounds {
            start: 10,
            end: 20,
            len: 5,
        }
        .into();
        assert!(e.to_string().contains("10..20"));
    }
}
