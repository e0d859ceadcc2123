//! Storage backends: one capability trait, one implementation per store.
//!
//! The coordinator only ever sees `Arc<dyn StorageBackend>`. Everything a
//! backend knows about its wire protocol stays in its own module, and every
//! failure is classified into a [`StorageError`] before it leaves.
//!
//! | Identifier | Module | Store |
//! |------------|--------|-------|
//! | `local` | [`local`] | A directory, served under a base URL |
//! | `github` | [`github`] | Repository contents API |
//! | `http` | [`http`] | S3-compatible `{endpoint}/{bucket}/{key}` |
//! | `custom` | [`custom`] | Multipart upload API with a JSON response |

pub mod custom;
pub mod github;
pub mod http;
pub mod local;

use crate::error::{KitError, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Addressable result of a successful `put`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLocation {
    /// Public URL written into the document.
    pub url: String,
    /// Backend-specific key, used for `exists` and `delete`.
    pub key: String,
}

/// Uniform interface over a remote object store.
///
/// Implementations must be cheap to share across tasks; every method may be
/// called concurrently.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Stable identifier recorded in cache entries (`"local"`, `"github"`, …).
    fn identifier(&self) -> &str;

    /// Store `bytes` under `key`.
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<RemoteLocation, StorageError>;

    /// Whether an object is stored under `key`.
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Remove the object under `key`. Deleting an absent object succeeds.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

// ── Configuration ────────────────────────────────────────────────────────────

fn default_local_root() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

fn default_raw_base() -> String {
    "https://raw.githubusercontent.com".to_string()
}

fn default_commit_message() -> String {
    "mdimage-kit upload".to_string()
}

fn default_file_field() -> String {
    "file".to_string()
}

fn default_url_path() -> String {
    "url".to_string()
}

/// Backend selection plus its settings, as found in the `backend` option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Local {
        #[serde(default = "default_local_root")]
        root: PathBuf,
        /// Prefix of returned URLs; `file://` URLs are produced when empty.
        #[serde(default)]
        base_url: String,
    },
    Github {
        /// `owner/name`.
        repo: String,
        #[serde(default)]
        token: String,
        #[serde(default = "default_branch")]
        branch: String,
        #[serde(default = "default_github_api")]
        api_base: String,
        #[serde(default = "default_raw_base")]
        raw_base: String,
        #[serde(default = "default_commit_message")]
        commit_message: String,
    },
    Http {
        endpoint: String,
        bucket: String,
        #[serde(default)]
        token: Option<String>,
        /// Base for returned URLs when objects are served from a CDN.
        #[serde(default)]
        public_base_url: Option<String>,
    },
    Custom {
        url: String,
        /// `POST` or `PUT`.
        #[serde(default)]
        method: custom::UploadMethod,
        #[serde(default = "default_file_field")]
        file_field: String,
        /// Dotted path to the URL in the JSON response, e.g. `data.url`.
        #[serde(default = "default_url_path")]
        url_path: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        form: BTreeMap<String, String>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local {
            root: default_local_root(),
            base_url: String::new(),
        }
    }
}

impl BackendConfig {
    /// The identifier the backend built from this config will report.
    pub fn identifier(&self) -> &'static str {
        match self {
            BackendConfig::Local { .. } => "local",
            BackendConfig::Github { .. } => "github",
            BackendConfig::Http { .. } => "http",
            BackendConfig::Custom { .. } => "custom",
        }
    }
}

/// Known backend identifiers.
pub const BACKEND_IDENTIFIERS: &[&str] = &["local", "github", "http", "custom"];

/// Build the backend selected by `config`.
///
/// `request_timeout` bounds every individual HTTP request.
pub fn create_backend(
    config: &BackendConfig,
    request_timeout: Duration,
) -> Result<Arc<dyn StorageBackend>, KitError> {
    let backend: Arc<dyn StorageBackend> = match config {
        BackendConfig::Local { root, base_url } => {
            Arc::new(local::LocalBackend::new(root.clone(), base_url.clone()))
        }
        BackendConfig::Github {
            repo,
            token,
            branch,
            api_base,
            raw_base,
            commit_message,
        } => {
            if repo.split('/').filter(|s| !s.is_empty()).count() != 2 {
                return Err(not_configured(
                    "github",
                    "Set backend.repo to 'owner/name'.",
                ));
            }
            if token.is_empty() {
                return Err(not_configured(
                    "github",
                    "Set backend.token to a token with contents:write.",
                ));
            }
            Arc::new(github::GithubBackend::new(
                http_client(request_timeout)?,
                github::GithubSettings {
                    repo: repo.clone(),
                    token: token.clone(),
                    branch: branch.clone(),
                    api_base: api_base.clone(),
                    raw_base: raw_base.clone(),
                    commit_message: commit_message.clone(),
                },
            ))
        }
        BackendConfig::Http {
            endpoint,
            bucket,
            token,
            public_base_url,
        } => {
            if endpoint.is_empty() || bucket.is_empty() {
                return Err(not_configured(
                    "http",
                    "Set backend.endpoint and backend.bucket.",
                ));
            }
            Arc::new(http::HttpObjectBackend::new(
                http_client(request_timeout)?,
                endpoint.clone(),
                bucket.clone(),
                token.clone(),
                public_base_url.clone(),
            ))
        }
        BackendConfig::Custom {
            url,
            method,
            file_field,
            url_path,
            headers,
            form,
        } => {
            if url.is_empty() {
                return Err(not_configured("custom", "Set backend.url to the upload API."));
            }
            Arc::new(custom::CustomBackend::new(
                http_client(request_timeout)?,
                custom::CustomSettings {
                    url: url.clone(),
                    method: *method,
                    file_field: file_field.clone(),
                    url_path: url_path.clone(),
                    headers: headers.clone(),
                    form: form.clone(),
                },
            ))
        }
    };
    Ok(backend)
}

fn not_configured(backend: &str, hint: &str) -> KitError {
    KitError::BackendNotConfigured {
        backend: backend.to_string(),
        hint: hint.to_string(),
    }
}

// ── Shared HTTP plumbing ─────────────────────────────────────────────────────

pub(crate) const USER_AGENT: &str = concat!("mdimage-kit/", env!("CARGO_PKG_VERSION"));

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, KitError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| KitError::Internal(format!("HTTP client: {e}")))
}

/// Classify a non-success HTTP status.
///
/// | Status | Error |
/// |--------|-------|
/// | 401, 403 | `AuthError` |
/// | 402, 413, 507 | `QuotaExceeded` |
/// | 429 | `RateLimited` |
/// | 408, 5xx | `NetworkError` |
/// | anything else | `BackendRejected` |
pub fn classify_status(status: u16, retry_after_secs: Option<u64>, body: &str) -> StorageError {
    let detail = summarise_body(status, body);
    match status {
        401 | 403 => StorageError::AuthError(detail),
        402 | 413 | 507 => StorageError::QuotaExceeded(detail),
        429 => StorageError::RateLimited { retry_after_secs },
        408 | 500..=599 => StorageError::NetworkError(detail),
        _ => StorageError::BackendRejected {
            status: Some(status),
            detail,
        },
    }
}

fn summarise_body(status: u16, body: &str) -> String {
    const MAX: usize = 200;
    let body = body.trim();
    if body.is_empty() {
        return format!("HTTP {status}");
    }
    let mut end = body.len().min(MAX);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    let ellipsis = if end < body.len() { "…" } else { "" };
    format!("HTTP {status}: {}{ellipsis}", &body[..end])
}

/// Seconds form of a `Retry-After` header. HTTP-date values are ignored.
pub(crate) fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Classify an unsuccessful response, consuming its body for the detail.
pub(crate) async fn error_from_response(response: reqwest::Response) -> StorageError {
    let status = response.status().as_u16();
    let wait = retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    classify_status(status, wait, &body)
}

/// Transport failures (DNS, connect, TLS, timeouts, truncated bodies).
pub(crate) fn transport_error(e: reqwest::Error) -> StorageError {
    if e.is_builder() {
        StorageError::BackendRejected {
            status: None,
            detail: e.to_string(),
        }
    } else {
        StorageError::NetworkError(e.to_string())
    }
}

/// Join URL pieces with exactly one `/` between them.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_table() {
        assert!(matches!(classify_status(401, None, ""), StorageError::AuthError(_)));
        assert!(matches!(classify_status(403, None, ""), StorageError::AuthError(_)));
        assert!(matches!(classify_status(413, None, ""), StorageError::QuotaExceeded(_)));
        assert!(matches!(classify_status(507, None, ""), StorageError::QuotaExceeded(_)));
        assert_eq!(
            classify_status(429, Some(3), ""),
            StorageError::RateLimited {
                retry_after_secs: Some(3)
            }
        );
        assert!(matches!(classify_status(503, None, ""), StorageError::NetworkError(_)));
        assert!(matches!(classify_status(408, None, ""), StorageError::NetworkError(_)));
        assert!(matches!(
            classify_status(400, None, "bad"),
            StorageError::BackendRejected {
                status: Some(400),
                ..
            }
        ));
    }

    #[test]
    fn long_bodies_are_truncated_on_char_boundary() {
        let body = "é".repeat(300);
        let e = classify_status(400, None, &body);
        let StorageError::BackendRejected { detail, .. } = e else {
            panic!("expected rejection");
        };
        assert!(detail.ends_with('…'));
        assert!(detail.len() < 260);
    }

    #[test]
    fn retry_after_reads_seconds_only() {
        let mut h = reqwest::header::HeaderMap::new();
        h.insert(reqwest::header::RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(retry_after(&h), Some(7));
        h.insert(
            reqwest::header::RETRY_AFTER,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(retry_after(&h), None);
    }

    #[test]
    fn backend_config_deserialises_with_defaults() {
        let cfg: BackendConfig =
            serde_json::from_str(r#"{"type":"github","repo":"me/pics","token":"t"}"#).unwrap();
        match &cfg {
            BackendConfig::Github { branch, api_base, .. } => {
                assert_eq!(branch, "main");
                assert_eq!(api_base, "https://api.github.com");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(cfg.identifier(), "github");
    }

    #[test]
    fn incomplete_backends_are_not_configured() {
        let cfg = BackendConfig::Github {
            repo: "me/pics".into(),
            token: String::new(),
            branch: default_branch(),
            api_base: default_github_api(),
            raw_base: default_raw_base(),
            commit_message: default_commit_message(),
        };
        let err = create_backend(&cfg, Duration::from_secs(5)).err().unwrap();
        assert!(matches!(err, KitError::BackendNotConfigured { .. }));

        let cfg = BackendConfig::Http {
            endpoint: String::new(),
            bucket: "b".into(),
            token: None,
            public_base_url: None,
        };
        assert!(create_backend(&cfg, Duration::from_secs(5)).is_err());
    }

    #[test]
    fn join_url_normalises_slashes() {
        assert_eq!(join_url("https://a/", "/b/c"), "https://a/b/c");
        assert_eq!(join_url("https://a", "b"), "https://a/b");
    }
}
