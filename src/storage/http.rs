//! S3-compatible object store over plain HTTP verbs.
//!
//! Objects live at `{endpoint}/{bucket}/{key}`: `PUT` stores, `HEAD` probes,
//! `DELETE` removes. Authentication is an optional bearer token (presigning
//! proxies, MinIO with a gateway, R2 workers). Returned URLs use
//! `public_base_url` when objects are served from a CDN.

use super::{error_from_response, join_url, transport_error, RemoteLocation, StorageBackend};
use crate::error::StorageError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::debug;

pub struct HttpObjectBackend {
    client: Client,
    endpoint: String,
    bucket: String,
    token: Option<String>,
    public_base_url: Option<String>,
}

impl HttpObjectBackend {
    pub fn new(
        client: Client,
        endpoint: String,
        bucket: String,
        token: Option<String>,
        public_base_url: Option<String>,
    ) -> Self {
        Self {
            client,
            endpoint,
            bucket,
            token,
            public_base_url,
        }
    }

    fn object_url(&self, key: &str) -> String {
        join_url(&join_url(&self.endpoint, &self.bucket), key)
    }

    fn public_url(&self, key: &str) -> String {
        match &self.public_base_url {
            Some(base) if !base.is_empty() => join_url(base, key),
            _ => self.object_url(key),
        }
    }

    fn authorised(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(t) if !t.is_empty() => req.bearer_auth(t),
            _ => req,
        }
    }
}

#[async_trait]
impl StorageBackend for HttpObjectBackend {
    fn identifier(&self) -> &str {
        "http"
    }

    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<RemoteLocation, StorageError> {
        let len = bytes.len();
        let req = self
            .client
            .put(self.object_url(key))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes);
        let resp = self.authorised(req).send().await.map_err(transport_error)?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        debug!("PUT {} ({} bytes) → {}", key, len, resp.status());
        Ok(RemoteLocation {
            url: self.public_url(key),
            key: key.to_string(),
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let req = self.client.head(self.object_url(key));
        let resp = self.authorised(req).send().await.map_err(transport_error)?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(error_from_response(resp).await),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let req = self.client.delete(self.object_url(key));
        let resp = self.authorised(req).send().await.map_err(transport_error)?;
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(error_from_response(resp).await)
        }
    }
}
