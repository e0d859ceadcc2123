//! End-to-end pipeline run over one document snapshot.
//!
//! ```text
//! DocumentSnapshot
//!   │ for each reference, in order
//!   ├─ read + fingerprint            (spawn_blocking)
//!   ├─ same fingerprint earlier?     → share that task's result
//!   ├─ cache hit?                    → reuse the remote URL, no network
//!   ├─ thumbnail + key naming        (spawn_blocking)
//!   └─ UploadRun::submit             (blocks while all slots are busy)
//! UploadRun::finish                  → every task terminal (or timed out)
//! RewritePlan::from_results → apply  → PipelineOutput
//! ```
//!
//! Per-image failures are isolated: they become a failed [`UploadResult`]
//! and leave that reference untouched. Only configuration and document I/O
//! problems abort a run.

use crate::asset::{AssetSource, ImageKind};
use crate::cache::{CacheEntry, UploadCache};
use crate::config::PipelineConfig;
use crate::coordinator::{Admission, TaskOutcome, UploadCoordinator, UploadPayload, UploadTask};
use crate::document::{DocumentSnapshot, ImageMarkup, ImageReference};
use crate::error::{KitError, TaskError};
use crate::fingerprint::{self, Fingerprint};
use crate::fsutil::write_atomic;
use crate::naming;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::rewrite::RewritePlan;
use crate::scan;
use crate::storage::{create_backend, StorageBackend};
use crate::thumbnail::{self, ThumbnailConstraints};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ── Results ──────────────────────────────────────────────────────────────────

/// Where a reference sits in the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceInfo {
    pub span: Range<usize>,
    /// The link target as written.
    pub target: String,
    /// Resolved local path (or buffer name).
    pub origin: String,
    /// The whole Markdown image construct, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markup: Option<ImageMarkup>,
}

impl From<&ImageReference> for ReferenceInfo {
    fn from(r: &ImageReference) -> Self {
        Self {
            span: r.span.clone(),
            target: r.target.clone(),
            origin: r.asset.display_origin(),
            markup: r.markup.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UploadOutcome {
    Succeeded { url: String },
    Failed { error: TaskError },
}

/// Result for one reference, consumed by the rewriter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    /// `None` when the asset could not even be read.
    pub fingerprint: Option<Fingerprint>,
    pub outcome: UploadOutcome,
    pub reference: ReferenceInfo,
    /// Satisfied by an entry recorded in an earlier run.
    pub from_cache: bool,
    /// Where the uploaded thumbnail lives, if one was stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

impl UploadResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, UploadOutcome::Succeeded { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub target: String,
    pub reason: TaskError,
}

/// User-facing totals for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Distinct images sent over the network in this run.
    pub uploaded: usize,
    /// References satisfied without an upload of their own (cache hits and
    /// byte-identical repeats).
    pub skipped_duplicate: usize,
    /// References left untouched because their image failed.
    pub failed: usize,
    pub failures: Vec<FailureReport>,
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// The rewritten document text.
    pub text: String,
    pub plan: RewritePlan,
    /// One result per reference, in document order.
    pub results: Vec<UploadResult>,
    pub summary: RunSummary,
    /// Cancellation was requested during the run.
    pub cancelled: bool,
}

/// Cache status of one reference, from [`Pipeline::probe`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub reference: ReferenceInfo,
    pub fingerprint: Option<Fingerprint>,
    pub cached_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// A configured pipeline: backend, cache and coordinator, reusable across
/// runs and documents.
pub struct Pipeline {
    config: PipelineConfig,
    backend: Arc<dyn StorageBackend>,
    cache: Arc<UploadCache>,
    coordinator: UploadCoordinator,
    progress: ProgressCallback,
}

/// How one distinct fingerprint was handled.
enum Group {
    Cached(CacheEntry),
    Submitted,
    Rejected(TaskError),
}

impl Pipeline {
    /// Build with the backend described by `config.backend`.
    pub fn from_config(config: PipelineConfig, cache: Arc<UploadCache>) -> Result<Self, KitError> {
        let backend = create_backend(&config.backend, config.request_timeout())?;
        Ok(Self::new(config, backend, cache))
    }

    /// Build around an existing backend.
    pub fn new(
        config: PipelineConfig,
        backend: Arc<dyn StorageBackend>,
        cache: Arc<UploadCache>,
    ) -> Self {
        let progress: ProgressCallback = config
            .progress_callback
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgressCallback));
        let coordinator = UploadCoordinator::with_progress(
            Arc::clone(&backend),
            Arc::clone(&cache),
            config.retry_policy(),
            config.max_concurrent_uploads,
            Arc::clone(&progress),
        );
        Self {
            config,
            backend,
            cache,
            coordinator,
            progress,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn cache(&self) -> &Arc<UploadCache> {
        &self.cache
    }

    /// Upload every image the snapshot references and rewrite the text.
    ///
    /// Blocks until every task is terminal or the run timeout elapses.
    /// `cancel` stops admission of new uploads; finished uploads and cache
    /// hits are still applied.
    pub async fn run(
        &self,
        snapshot: &DocumentSnapshot,
        cancel: CancellationToken,
    ) -> Result<PipelineOutput, KitError> {
        let refs = snapshot.references();
        let deadline = Instant::now() + self.config.run_timeout();
        info!(
            "Pipeline run: {} reference(s) → backend '{}'",
            refs.len(),
            self.backend.identifier()
        );
        self.progress.on_run_start(refs.len());

        let mut run = self.coordinator.start(cancel.clone(), deadline);
        let mut per_ref: Vec<Result<Fingerprint, TaskError>> = Vec::with_capacity(refs.len());
        let mut groups: HashMap<Fingerprint, Group> = HashMap::new();

        for reference in refs {
            let (bytes, fp) = match load_and_fingerprint(reference).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!("Skipping {}: {}", reference.target, e);
                    per_ref.push(Err(e));
                    continue;
                }
            };
            per_ref.push(Ok(fp));
            if groups.contains_key(&fp) {
                debug!("{} repeats {:?}; sharing its upload", reference.target, fp);
                continue;
            }

            if let Some(entry) = self.cache.lookup(&fp) {
                debug!("Cache hit for {}: {}", reference.target, entry.remote_url);
                self.progress.on_cache_hit(&fp, &entry.remote_url);
                groups.insert(fp, Group::Cached(entry));
                continue;
            }

            if cancel.is_cancelled() {
                groups.insert(fp, Group::Rejected(TaskError::Cancelled));
                continue;
            }
            if Instant::now() >= deadline {
                groups.insert(fp, Group::Rejected(TaskError::TimedOut));
                continue;
            }

            let task = match self.prepare(reference, bytes, fp).await {
                Ok(task) => task,
                Err(e) => {
                    warn!("Cannot upload {}: {}", reference.target, e);
                    self.progress.on_task_error(&fp, &e.to_string());
                    groups.insert(fp, Group::Rejected(e));
                    continue;
                }
            };
            match run.submit(task).await {
                Admission::Admitted | Admission::Duplicate => {}
                Admission::Joined | Admission::Cached => {
                    debug!("{} shares an upload owned elsewhere", reference.target)
                }
                Admission::Cancelled => info!("Cancelled before {} was admitted", reference.target),
                Admission::TimedOut => warn!("Run timed out before {} was admitted", reference.target),
            }
            groups.insert(fp, Group::Submitted);
        }

        let outcomes: HashMap<Fingerprint, TaskOutcome> = run
            .finish()
            .await
            .into_iter()
            .map(|o| (o.fingerprint, o))
            .collect();

        let results = assemble_results(refs, per_ref, &groups, &outcomes);
        let summary = summarise(&results, &outcomes);
        let plan = RewritePlan::from_results(&results, &self.config.label_style);
        let text = plan.apply(snapshot.text())?;

        info!(
            "Run complete: {} uploaded, {} skipped as duplicate, {} failed",
            summary.uploaded, summary.skipped_duplicate, summary.failed
        );
        self.progress.on_run_complete(&summary);

        Ok(PipelineOutput {
            text,
            plan,
            results,
            summary,
            cancelled: cancel.is_cancelled(),
        })
    }

    /// Read, fingerprint and look up every reference without uploading.
    pub async fn probe(&self, snapshot: &DocumentSnapshot) -> Vec<ProbeReport> {
        let mut reports = Vec::with_capacity(snapshot.references().len());
        for reference in snapshot.references() {
            let info = ReferenceInfo::from(reference);
            let report = match load_and_fingerprint(reference).await {
                Ok((_, fp)) => ProbeReport {
                    reference: info,
                    fingerprint: Some(fp),
                    cached_url: self.cache.lookup(&fp).map(|e| e.remote_url),
                    error: None,
                },
                Err(e) => ProbeReport {
                    reference: info,
                    fingerprint: None,
                    cached_url: None,
                    error: Some(e),
                },
            };
            reports.push(report);
        }
        reports
    }

    /// Read `input`, run the pipeline over its Markdown images and write the
    /// result to `output` atomically (`output` may equal `input`).
    ///
    /// Nothing is written if the run fails as a whole.
    pub async fn rewrite_file(
        &self,
        input: &Path,
        output: &Path,
        cancel: CancellationToken,
    ) -> Result<PipelineOutput, KitError> {
        let snapshot = read_markdown(input).await?;
        let out = self.run(&snapshot, cancel).await?;
        let path = output.to_path_buf();
        let text = out.text.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, text.as_bytes()))
            .await
            .map_err(|e| KitError::Internal(format!("write task: {e}")))?
            .map_err(|e| KitError::DocumentWriteFailed {
                path: output.to_path_buf(),
                source: e,
            })?;
        Ok(out)
    }

    /// Thumbnail, name and package one image for upload, off the async
    /// workers.
    async fn prepare(
        &self,
        reference: &ImageReference,
        bytes: Bytes,
        fp: Fingerprint,
    ) -> Result<UploadTask, TaskError> {
        let name = reference.asset.name().to_string();
        let declared = reference.asset.kind();
        let constraints = self.config.thumbnail;
        let with_thumbnail = self.config.generate_thumbnails;
        let naming = self.config.naming;
        let prefix = self.config.key_prefix.clone();

        tokio::task::spawn_blocking(move || {
            build_task(
                fp,
                name,
                declared,
                bytes,
                with_thumbnail.then_some(constraints),
                naming,
                &prefix,
            )
        })
        .await
        .map_err(|e| TaskError::ProcessingError {
            detail: format!("preparation task failed: {e}"),
        })?
    }
}

/// Read a Markdown file and scan it relative to its own directory.
pub async fn read_markdown(path: &Path) -> Result<DocumentSnapshot, KitError> {
    let text = read_text(path).await?;
    let base = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    Ok(scan::scan_markdown(&text, base))
}

pub(crate) async fn read_text(path: &Path) -> Result<String, KitError> {
    match tokio::fs::read_to_string(path).await {
        Ok(t) => Ok(t),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(KitError::DocumentNotFound {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(KitError::DocumentReadFailed {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

async fn load_and_fingerprint(
    reference: &ImageReference,
) -> Result<(Bytes, Fingerprint), TaskError> {
    let origin = reference.asset.display_origin();
    let read_error = |detail: String| TaskError::ReadError {
        path: origin.clone(),
        detail,
    };
    let (bytes, fp) = match reference.asset.source() {
        AssetSource::Bytes(b) => (b.clone(), fingerprint::fingerprint(b)),
        AssetSource::Path(p) => {
            let path = p.clone();
            tokio::task::spawn_blocking(move || {
                std::fs::read(&path).map(|data| {
                    let fp = fingerprint::fingerprint(&data);
                    (Bytes::from(data), fp)
                })
            })
            .await
            .map_err(|e| read_error(e.to_string()))?
            .map_err(|e| read_error(e.to_string()))?
        }
    };
    let adopted = reference.asset.adopt_fingerprint(fp);
    if adopted != fp {
        warn!("{} changed since it was first fingerprinted", origin);
    }
    Ok((bytes, fp))
}

/// Pure preparation step: validate the image, derive keys, make the
/// thumbnail.
fn build_task(
    fp: Fingerprint,
    name: String,
    declared: ImageKind,
    bytes: Bytes,
    thumbnail: Option<ThumbnailConstraints>,
    naming: naming::NamingStrategy,
    prefix: &str,
) -> Result<UploadTask, TaskError> {
    let sniffed = ImageKind::sniff(&bytes);
    let kind = match sniffed {
        ImageKind::Unknown if declared == ImageKind::Svg && looks_like_svg(&bytes) => ImageKind::Svg,
        ImageKind::Unknown => {
            return Err(TaskError::UnsupportedFormat {
                detail: format!("{name} is not a recognised image"),
            })
        }
        k => k,
    };

    let key = naming::object_key(
        naming,
        prefix,
        &name,
        kind.extension(),
        &fp,
        Utc::now().date_naive(),
    );

    // Vector images are uploaded as-is: there is nothing to downscale.
    let thumb = match thumbnail {
        Some(constraints) if kind != ImageKind::Svg => {
            let t = thumbnail::generate(&bytes, &constraints)?;
            Some(UploadPayload {
                key: naming::thumbnail_key(&key, t.extension),
                bytes: t.bytes,
                content_type: t.content_type.to_string(),
            })
        }
        _ => None,
    };

    let original = UploadPayload {
        key,
        bytes,
        content_type: kind.mime_type().to_string(),
    };
    Ok(UploadTask::new(fp, name, original, thumb))
}

fn looks_like_svg(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(1024)];
    String::from_utf8_lossy(head).contains("<svg")
}

fn assemble_results(
    refs: &[ImageReference],
    per_ref: Vec<Result<Fingerprint, TaskError>>,
    groups: &HashMap<Fingerprint, Group>,
    outcomes: &HashMap<Fingerprint, TaskOutcome>,
) -> Vec<UploadResult> {
    refs.iter()
        .zip(per_ref)
        .map(|(reference, fp)| {
            let info = ReferenceInfo::from(reference);
            let fp = match fp {
                Ok(fp) => fp,
                Err(error) => {
                    return UploadResult {
                        fingerprint: None,
                        outcome: UploadOutcome::Failed { error },
                        reference: info,
                        from_cache: false,
                        thumbnail_url: None,
                    }
                }
            };
            let failed = |error: TaskError| -> (UploadOutcome, bool, Option<String>) {
                (UploadOutcome::Failed { error }, false, None)
            };
            let (outcome, from_cache, thumbnail_url) = match groups.get(&fp) {
                Some(Group::Cached(entry)) => (
                    UploadOutcome::Succeeded {
                        url: entry.remote_url.clone(),
                    },
                    true,
                    entry.thumbnail_url.clone(),
                ),
                Some(Group::Rejected(error)) => failed(error.clone()),
                Some(Group::Submitted) => match outcomes.get(&fp).map(|o| &o.result) {
                    Some(Ok(entry)) => (
                        UploadOutcome::Succeeded {
                            url: entry.remote_url.clone(),
                        },
                        false,
                        entry.thumbnail_url.clone(),
                    ),
                    Some(Err(error)) => failed(error.clone()),
                    None => failed(TaskError::ProcessingError {
                        detail: "no result recorded for task".into(),
                    }),
                },
                None => failed(TaskError::ProcessingError {
                    detail: "reference was never scheduled".into(),
                }),
            };
            UploadResult {
                fingerprint: Some(fp),
                outcome,
                reference: info,
                from_cache,
                thumbnail_url,
            }
        })
        .collect()
}

fn summarise(results: &[UploadResult], outcomes: &HashMap<Fingerprint, TaskOutcome>) -> RunSummary {
    // Outcomes borrowed from another run carry no attempts of their own.
    let uploaded = outcomes
        .values()
        .filter(|o| o.result.is_ok() && o.attempts > 0)
        .count();
    let succeeded = results.iter().filter(|r| r.is_success()).count();
    let failures: Vec<FailureReport> = results
        .iter()
        .filter_map(|r| match &r.outcome {
            UploadOutcome::Failed { error } => Some(FailureReport {
                target: r.reference.target.clone(),
                reason: error.clone(),
            }),
            UploadOutcome::Succeeded { .. } => None,
        })
        .collect();
    RunSummary {
        uploaded,
        skipped_duplicate: succeeded.saturating_sub(uploaded),
        failed: failures.len(),
        failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png(w: u32, h: u32) -> Bytes {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([5, 6, 7])))
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        Bytes::from(buf)
    }

    #[test]
    fn build_task_names_original_and_thumbnail() {
        let bytes = png(300, 150);
        let fp = fingerprint::fingerprint(&bytes);
        let task = build_task(
            fp,
            "chart.png".into(),
            ImageKind::Png,
            bytes,
            Some(ThumbnailConstraints {
                max_width: 100,
                max_height: 100,
                quality: 80,
            }),
            naming::NamingStrategy::ContentHash,
            "notes",
        )
        .unwrap();
        assert_eq!(task.original.key, format!("notes/{}.png", fp.short(16)));
        assert_eq!(task.original.content_type, "image/png");
        let thumb = task.thumbnail.unwrap();
        assert_eq!(thumb.key, format!("notes/thumbs/{}.png", fp.short(16)));
    }

    #[test]
    fn build_task_refuses_non_images() {
        let bytes = Bytes::from_static(b"definitely not an image");
        let err = build_task(
            fingerprint::fingerprint(&bytes),
            "fake.png".into(),
            ImageKind::Png,
            bytes,
            None,
            naming::NamingStrategy::FileName,
            "",
        )
        .unwrap_err();
        assert!(matches!(err, TaskError::UnsupportedFormat { .. }));
    }

    #[test]
    fn svg_is_uploaded_without_thumbnail() {
        let bytes = Bytes::from_static(br#"<?xml version="1.0"?><svg xmlns="http://www.w3.org/2000/svg"/>"#);
        let task = build_task(
            fingerprint::fingerprint(&bytes),
            "diagram.svg".into(),
            ImageKind::Svg,
            bytes,
            Some(ThumbnailConstraints::default()),
            naming::NamingStrategy::FileName,
            "",
        )
        .unwrap();
        assert_eq!(task.original.key, "diagram.svg");
        assert_eq!(task.original.content_type, "image/svg+xml");
        assert!(task.thumbnail.is_none());
    }

    #[test]
    fn summary_counts_duplicates_against_uploads() {
        let fp = fingerprint::fingerprint(b"a");
        let info = |t: &str| ReferenceInfo {
            span: 0..1,
            target: t.into(),
            origin: t.into(),
            markup: None,
        };
        let ok = |t: &str| UploadResult {
            fingerprint: Some(fp),
            outcome: UploadOutcome::Succeeded {
                url: "https://cdn/a".into(),
            },
            reference: info(t),
            from_cache: false,
            thumbnail_url: None,
        };
        let results = vec![
            ok("a.png"),
            ok("copy.png"),
            UploadResult {
                fingerprint: None,
                outcome: UploadOutcome::Failed {
                    error: TaskError::ReadError {
                        path: "gone.png".into(),
                        detail: "not found".into(),
                    },
                },
                reference: info("gone.png"),
                from_cache: false,
                thumbnail_url: None,
            },
        ];
        let mut outcomes = HashMap::new();
        outcomes.insert(
            fp,
            TaskOutcome {
                fingerprint: fp,
                result: Ok(CacheEntry {
                    remote_url: "https://cdn/a".into(),
                    remote_key: "a".into(),
                    uploaded_at: Utc::now(),
                    backend: "local".into(),
                    thumbnail_url: None,
                    thumbnail_key: None,
                }),
                attempts: 1,
            },
        );
        let s = summarise(&results, &outcomes);
        assert_eq!(s.uploaded, 1);
        assert_eq!(s.skipped_duplicate, 1);
        assert_eq!(s.failed, 1);
        assert_eq!(s.failures[0].target, "gone.png");
    }
}
