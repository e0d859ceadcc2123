//! Migration between backends.
//!
//! Images that already live on a remote host are downloaded and pushed
//! through the normal pipeline, so the configured backend receives them with
//! the same dedup, naming, thumbnails and label style as local images. Only
//! `http(s)` targets containing the filter's domain are touched; everything
//! else in the document stays as written.
//!
//! Downloads share the upload slot count as their own concurrency bound. A
//! download that fails leaves its reference untouched and is reported like
//! any other per-image failure.

use crate::asset::ImageAsset;
use crate::document::{DocumentSnapshot, ImageReference};
use crate::error::{KitError, TaskError};
use crate::fsutil::write_atomic;
use crate::pipeline::{
    read_text, FailureReport, Pipeline, PipelineOutput, ReferenceInfo, UploadOutcome, UploadResult,
};
use crate::scan::{self, FoundTarget};
use bytes::Bytes;
use reqwest::Client;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Which remote images to move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFilter {
    domain: String,
}

impl MigrationFilter {
    /// Match every `http(s)` target whose URL contains `domain`.
    pub fn new(domain: impl Into<String>) -> Result<Self, KitError> {
        let domain = domain.into().trim().to_string();
        if domain.is_empty() {
            return Err(KitError::InvalidConfig(
                "migration needs a non-empty source domain".into(),
            ));
        }
        Ok(Self { domain })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn matches(&self, target: &str) -> bool {
        target.contains(&self.domain)
    }
}

/// File name for a downloaded image: the last path segment of the URL,
/// without query or fragment, percent-decoded.
pub fn file_name_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last = path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let decoded = urlencoding::decode(last)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| last.to_string());
    if decoded.is_empty() || decoded.contains(':') {
        "image".to_string()
    } else {
        decoded
    }
}

async fn download(client: &Client, url: &str) -> Result<Bytes, TaskError> {
    let read_error = |detail: String| TaskError::ReadError {
        path: url.to_string(),
        detail,
    };
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| read_error(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(read_error(format!("HTTP {}", resp.status())));
    }
    resp.bytes().await.map_err(|e| read_error(e.to_string()))
}

fn failed_result(found: &FoundTarget, error: TaskError) -> UploadResult {
    UploadResult {
        fingerprint: None,
        outcome: UploadOutcome::Failed { error },
        reference: ReferenceInfo {
            span: found.span.clone(),
            target: found.target.clone(),
            origin: found.target.clone(),
            markup: found.markup.clone(),
        },
        from_cache: false,
        thumbnail_url: None,
    }
}

impl Pipeline {
    /// Move every remote image in `text` matched by `filter` to this
    /// pipeline's backend and rewrite the references.
    ///
    /// Targets that already point at an object this cache recorded are left
    /// alone.
    pub async fn migrate(
        &self,
        text: &str,
        filter: &MigrationFilter,
        cancel: CancellationToken,
    ) -> Result<PipelineOutput, KitError> {
        let known: Vec<String> = self
            .cache()
            .snapshot()
            .values()
            .map(|e| e.remote_url.clone())
            .collect();
        let targets: Vec<FoundTarget> = scan::find_remote_targets(text)
            .into_iter()
            .filter(|f| filter.matches(&f.target) && !known.contains(&f.target))
            .collect();
        info!(
            "Migrating {} image(s) from '{}' → backend '{}'",
            targets.len(),
            filter.domain(),
            self.backend().identifier()
        );

        let client = Client::builder()
            .timeout(self.config().request_timeout())
            .build()
            .map_err(|e| KitError::Internal(format!("HTTP client: {e}")))?;
        let slots = Arc::new(Semaphore::new(self.config().max_concurrent_uploads.max(1)));
        let mut downloads: JoinSet<(usize, Result<Bytes, TaskError>)> = JoinSet::new();
        let mut fetched: Vec<Option<Result<Bytes, TaskError>>> = vec![None; targets.len()];

        for (i, found) in targets.iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&slots).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                fetched[i] = Some(Err(TaskError::Cancelled));
                continue;
            };
            let client = client.clone();
            let url = found.target.clone();
            downloads.spawn(async move {
                let _permit = permit;
                debug!("Downloading {}", url);
                (i, download(&client, &url).await)
            });
        }
        while let Some(joined) = downloads.join_next().await {
            match joined {
                Ok((i, result)) => fetched[i] = Some(result),
                Err(e) => warn!("Download task ended abnormally: {}", e),
            }
        }

        let mut references = Vec::new();
        let mut failures = Vec::new();
        for (found, result) in targets.iter().zip(fetched) {
            let result = result.unwrap_or_else(|| {
                Err(TaskError::ReadError {
                    path: found.target.clone(),
                    detail: "download did not finish".into(),
                })
            });
            match result {
                Ok(bytes) => {
                    let asset = ImageAsset::from_bytes(file_name_from_url(&found.target), bytes);
                    references.push(
                        ImageReference::new(found.span.clone(), found.target.clone(), asset)
                            .with_markup(found.markup.clone()),
                    );
                }
                Err(e) => {
                    warn!("Cannot migrate {}: {}", found.target, e);
                    failures.push(failed_result(found, e));
                }
            }
        }

        let snapshot = DocumentSnapshot::new(text, references);
        let mut out = self.run(&snapshot, cancel).await?;
        for failure in failures {
            if let UploadOutcome::Failed { error } = &failure.outcome {
                out.summary.failures.push(FailureReport {
                    target: failure.reference.target.clone(),
                    reason: error.clone(),
                });
            }
            out.summary.failed += 1;
            out.results.push(failure);
        }
        out.results.sort_by_key(|r| r.reference.span.start);
        Ok(out)
    }

    /// [`Pipeline::migrate`] over a file, written to `output` atomically.
    pub async fn migrate_file(
        &self,
        input: &Path,
        output: &Path,
        filter: &MigrationFilter,
        cancel: CancellationToken,
    ) -> Result<PipelineOutput, KitError> {
        let text = read_text(input).await?;
        let out = self.migrate(&text, filter, cancel).await?;
        let path = output.to_path_buf();
        let rewritten = out.text.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, rewritten.as_bytes()))
            .await
            .map_err(|e| KitError::Internal(format!("write task: {e}")))?
            .map_err(|e| KitError::DocumentWriteFailed {
                path: output.to_path_buf(),
                source: e,
            })?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matches_by_domain() {
        let f = MigrationFilter::new(" old.cdn.example ").unwrap();
        assert!(f.matches("https://old.cdn.example/a.png"));
        assert!(!f.matches("https://new.cdn.example/a.png"));
        assert!(MigrationFilter::new("  ").is_err());
    }

    #[test]
    fn file_names_from_urls() {
        assert_eq!(file_name_from_url("https://h/x/y/cat.png?w=10#top"), "cat.png");
        assert_eq!(file_name_from_url("https://h/%E5%9B%BE.png"), "图.png");
        assert_eq!(file_name_from_url("https://h/"), "image");
    }
}
