//! Local directory backend.
//!
//! Objects are plain files under `root`; returned URLs are `base_url/key`,
//! or `file://` URLs when no base URL is configured. Useful for static-site
//! publishing, offline work and tests.

use super::{join_url, RemoteLocation, StorageBackend};
use crate::error::StorageError;
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// ENOSPC / ERROR_DISK_FULL.
#[cfg(unix)]
const DISK_FULL: i32 = 28;
#[cfg(windows)]
const DISK_FULL: i32 = 112;
#[cfg(not(any(unix, windows)))]
const DISK_FULL: i32 = -1;

#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    base_url: String,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `key` under the root, refusing anything that could escape it.
    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(key);
        let safe = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StorageError::BackendRejected {
                status: None,
                detail: format!("invalid object key '{key}'"),
            });
        }
        Ok(self.root.join(rel))
    }

    fn url_for(&self, key: &str, path: &Path) -> String {
        if self.base_url.is_empty() {
            let abs = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
            format!("file://{}", abs.display())
        } else {
            join_url(&self.base_url, key)
        }
    }
}

fn classify_io(e: io::Error) -> StorageError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => StorageError::AuthError(e.to_string()),
        _ if e.raw_os_error() == Some(DISK_FULL) => StorageError::QuotaExceeded(e.to_string()),
        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            StorageError::NetworkError(e.to_string())
        }
        _ => StorageError::BackendRejected {
            status: None,
            detail: e.to_string(),
        },
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn identifier(&self) -> &str {
        "local"
    }

    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        _content_type: &str,
    ) -> Result<RemoteLocation, StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(classify_io)?;
        }
        // Temp file + rename so a concurrent reader never sees a partial object.
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(".{file_name}.part"));
        tokio::fs::write(&tmp, &bytes).await.map_err(classify_io)?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(classify_io(e));
        }
        debug!("Stored {} bytes at {}", bytes.len(), path.display());
        Ok(RemoteLocation {
            url: self.url_for(key, &path),
            key: key.to_string(),
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.resolve(key)?;
        tokio::fs::try_exists(&path).await.map_err(classify_io)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(classify_io(e)),
        }
    }
}
