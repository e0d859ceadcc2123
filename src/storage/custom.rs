//! User-defined upload API.
//!
//! Sends the image as a multipart form (field name configurable, extra text
//! fields and headers allowed) and reads the public URL out of the JSON
//! response by a dotted path such as `data.url` or `files.0.link`. Such APIs
//! rarely offer lookup or deletion, so `exists` always answers `false` and
//! `delete` is rejected.

use super::{error_from_response, transport_error, RemoteLocation, StorageBackend};
use crate::error::StorageError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UploadMethod {
    #[default]
    Post,
    Put,
}

#[derive(Debug, Clone)]
pub struct CustomSettings {
    pub url: String,
    pub method: UploadMethod,
    pub file_field: String,
    pub url_path: String,
    pub headers: BTreeMap<String, String>,
    pub form: BTreeMap<String, String>,
}

pub struct CustomBackend {
    client: Client,
    settings: CustomSettings,
}

/// Follow a dotted path through objects and arrays; numeric segments index
/// arrays. The target must be a string.
pub fn extract_by_path<'a>(value: &'a Value, path: &str) -> Option<&'a str> {
    let mut cur = value;
    for seg in path.split('.').filter(|s| !s.is_empty()) {
        cur = match cur {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    cur.as_str()
}

impl CustomBackend {
    pub fn new(client: Client, settings: CustomSettings) -> Self {
        Self { client, settings }
    }
}

#[async_trait]
impl StorageBackend for CustomBackend {
    fn identifier(&self) -> &str {
        "custom"
    }

    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<RemoteLocation, StorageError> {
        let file_name = key.rsplit('/').next().unwrap_or(key).to_string();
        let part = Part::bytes(bytes.to_vec())
            .file_name(file_name)
            .mime_str(content_type)
            .map_err(|e| StorageError::BackendRejected {
                status: None,
                detail: format!("content type '{content_type}': {e}"),
            })?;
        let mut form = Form::new().part(self.settings.file_field.clone(), part);
        for (k, v) in &self.settings.form {
            form = form.text(k.clone(), v.clone());
        }

        let mut req = match self.settings.method {
            UploadMethod::Post => self.client.post(&self.settings.url),
            UploadMethod::Put => self.client.put(&self.settings.url),
        };
        for (k, v) in &self.settings.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req
            .header(reqwest::header::ACCEPT, "application/json")
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let status = resp.status().as_u16();
        let body: Value = resp.json().await.map_err(|e| StorageError::BackendRejected {
            status: Some(status),
            detail: format!("response is not JSON: {e}"),
        })?;
        let url = extract_by_path(&body, &self.settings.url_path).ok_or_else(|| {
            StorageError::BackendRejected {
                status: Some(status),
                detail: format!("no string at '{}' in response", self.settings.url_path),
            }
        })?;
        debug!("Custom upload {} → {}", key, url);
        Ok(RemoteLocation {
            url: url.to_string(),
            key: key.to_string(),
        })
    }

    async fn exists(&self, _key: &str) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        Err(StorageError::BackendRejected {
            status: None,
            detail: format!("custom upload API cannot delete '{key}'"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_nested_and_indexed_urls() {
        let body = json!({
            "code": 0,
            "data": { "url": "https://img.example.com/a.png" },
            "files": [ { "link": "https://f.example.com/1" } ]
        });
        assert_eq!(extract_by_path(&body, "data.url"), Some("https://img.example.com/a.png"));
        assert_eq!(extract_by_path(&body, "files.0.link"), Some("https://f.example.com/1"));
        assert_eq!(extract_by_path(&body, "files.3.link"), None);
        assert_eq!(extract_by_path(&body, "code"), None);
        assert_eq!(extract_by_path(&body, "data.missing"), None);
    }

    #[tokio::test]
    async fn delete_is_rejected_and_exists_is_false() {
        let b = CustomBackend::new(
            Client::new(),
            CustomSettings {
                url: "https://upload.example.com".into(),
                method: UploadMethod::Post,
                file_field: "file".into(),
                url_path: "url".into(),
                headers: BTreeMap::new(),
                form: BTreeMap::new(),
            },
        );
        assert!(!b.exists("a.png").await.unwrap());
        let err = b.delete("a.png").await.unwrap_err();
        assert!(matches!(err, StorageError::BackendRejected { .. }));
    }

    #[test]
    fn method_deserialises_uppercase() {
        let m: UploadMethod = serde_json::from_str("\"PUT\"").unwrap();
        assert_eq!(m, UploadMethod::Put);
    }
}
