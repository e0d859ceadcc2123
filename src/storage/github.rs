//! GitHub repository contents backend.
//!
//! `PUT /repos/{repo}/contents/{key}` creates a file from base64 content on
//! the configured branch. The API answers 422 when the path already exists;
//! that counts as success only when the stored file holds the same bytes.
//! Objects are served from `raw.githubusercontent.com/{repo}/{branch}/{key}`.

use super::{error_from_response, join_url, transport_error, RemoteLocation, StorageBackend};
use crate::error::StorageError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct GithubSettings {
    pub repo: String,
    pub token: String,
    pub branch: String,
    pub api_base: String,
    pub raw_base: String,
    pub commit_message: String,
}

pub struct GithubBackend {
    client: Client,
    settings: GithubSettings,
}

#[derive(Serialize)]
struct CreateFile<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
}

#[derive(Serialize)]
struct DeleteFile<'a> {
    message: &'a str,
    sha: &'a str,
    branch: &'a str,
}

#[derive(Deserialize)]
struct ContentInfo {
    sha: String,
}

impl GithubBackend {
    pub fn new(client: Client, settings: GithubSettings) -> Self {
        Self { client, settings }
    }

    fn contents_url(&self, key: &str) -> String {
        join_url(
            &self.settings.api_base,
            &format!("repos/{}/contents/{}", self.settings.repo, key.trim_start_matches('/')),
        )
    }

    fn raw_url(&self, key: &str) -> String {
        join_url(
            &self.settings.raw_base,
            &format!(
                "{}/{}/{}",
                self.settings.repo,
                self.settings.branch,
                key.trim_start_matches('/')
            ),
        )
    }

    fn authorised(&self, req: RequestBuilder) -> RequestBuilder {
        self.with_token(req)
            .header("Accept", "application/vnd.github+json")
    }

    fn with_token(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("Authorization", format!("token {}", self.settings.token))
    }

    /// Raw bytes of the file at `key` on the branch.
    async fn file_bytes(&self, key: &str) -> Result<Bytes, StorageError> {
        let req = self
            .client
            .get(self.contents_url(key))
            .query(&[("ref", self.settings.branch.as_str())])
            .header("Accept", "application/vnd.github.raw+json");
        let resp = self.with_token(req).send().await.map_err(transport_error)?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        resp.bytes().await.map_err(transport_error)
    }

    /// Blob SHA of the file at `key` on the branch, if it exists.
    async fn file_sha(&self, key: &str) -> Result<Option<String>, StorageError> {
        let req = self
            .client
            .get(self.contents_url(key))
            .query(&[("ref", self.settings.branch.as_str())]);
        let resp = self.authorised(req).send().await.map_err(transport_error)?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let info: ContentInfo = resp.json().await.map_err(transport_error)?;
                Ok(Some(info.sha))
            }
            _ => Err(error_from_response(resp).await),
        }
    }
}

#[async_trait]
impl StorageBackend for GithubBackend {
    fn identifier(&self) -> &str {
        "github"
    }

    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        _content_type: &str,
    ) -> Result<RemoteLocation, StorageError> {
        let body = CreateFile {
            message: &self.settings.commit_message,
            content: STANDARD.encode(&bytes),
            branch: &self.settings.branch,
        };
        let req = self.client.put(self.contents_url(key)).json(&body);
        let resp = self.authorised(req).send().await.map_err(transport_error)?;
        match resp.status() {
            s if s.is_success() => debug!("GitHub created {}", key),
            StatusCode::UNPROCESSABLE_ENTITY => {
                if self.file_bytes(key).await? != bytes {
                    return Err(StorageError::BackendRejected {
                        status: Some(422),
                        detail: format!("'{key}' already exists with different content"),
                    });
                }
                info!("GitHub already has {}; reusing it", key);
            }
            _ => return Err(error_from_response(resp).await),
        }
        Ok(RemoteLocation {
            url: self.raw_url(key),
            key: key.to_string(),
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.file_sha(key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let Some(sha) = self.file_sha(key).await? else {
            return Ok(());
        };
        let body = DeleteFile {
            message: &self.settings.commit_message,
            sha: &sha,
            branch: &self.settings.branch,
        };
        let req = self.client.delete(self.contents_url(key)).json(&body);
        let resp = self.authorised(req).send().await.map_err(transport_error)?;
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(error_from_response(resp).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> GithubBackend {
        backend_at("https://api.github.com/")
    }

    fn backend_at(api_base: &str) -> GithubBackend {
        GithubBackend::new(
            Client::new(),
            GithubSettings {
                repo: "octo/pics".into(),
                token: "t".into(),
                branch: "main".into(),
                api_base: api_base.into(),
                raw_base: "https://raw.githubusercontent.com".into(),
                commit_message: "upload".into(),
            },
        )
    }

    #[test]
    fn url_shapes() {
        let b = backend();
        assert_eq!(
            b.contents_url("img/a.png"),
            "https://api.github.com/repos/octo/pics/contents/img/a.png"
        );
        assert_eq!(
            b.raw_url("img/a.png"),
            "https://raw.githubusercontent.com/octo/pics/main/img/a.png"
        );
    }

    #[test]
    fn create_body_is_base64() {
        let body = CreateFile {
            message: "m",
            content: STANDARD.encode(b"hi"),
            branch: "main",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["content"], "aGk=");
        assert_eq!(json["branch"], "main");
    }

    /// Contents API stand-in where every path already exists and holds
    /// `existing`.
    async fn github_with_existing_file(existing: &'static [u8]) -> String {
        use axum::{http::StatusCode, routing::put, Router};
        let app = Router::new().route(
            "/repos/octo/pics/contents/*key",
            put(|| async { StatusCode::UNPROCESSABLE_ENTITY }).get(move || async move { existing }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn existing_path_is_reused_only_with_identical_bytes() {
        let b = backend_at(&github_with_existing_file(b"same pixels").await);

        let loc = b
            .put("img/a.png", Bytes::from_static(b"same pixels"), "image/png")
            .await
            .unwrap();
        assert_eq!(loc.key, "img/a.png");

        let err = b
            .put("img/a.png", Bytes::from_static(b"other pixels"), "image/png")
            .await
            .unwrap_err();
        assert!(
            matches!(err, StorageError::BackendRejected { status: Some(422), .. }),
            "{err:?}"
        );
        assert!(!err.is_retriable());
    }
}
