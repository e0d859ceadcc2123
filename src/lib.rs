//! # mdimage-kit
//!
//! Upload the local images a Markdown document references to object storage,
//! then rewrite the references to point at the uploaded copies.
//!
//! ## Pipeline Overview
//!
//! ```text
//! Markdown
//!  │
//!  ├─ 1. Scan         local image targets + byte spans (fences skipped)
//!  ├─ 2. Fingerprint  SHA-256 of the bytes (spawn_blocking)
//!  ├─ 3. Cache        fingerprint → remote URL, skip what is already stored
//!  ├─ 4. Thumbnail    bounded, aspect-preserving downscale (spawn_blocking)
//!  ├─ 5. Upload       bounded concurrency, retry with backoff + jitter
//!  └─ 6. Rewrite      all-or-nothing span replacement; failures stay local
//! ```
//!
//! Identical bytes are uploaded once no matter how many times, or in how
//! many runs, they are referenced. An image that cannot be uploaded keeps its
//! original reference: a failed upload never breaks a document.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mdimage_kit::{JsonFileStore, Pipeline, PipelineConfig, UploadCache};
//! use std::path::Path;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = JsonFileStore::new("notes/.mdik-cache.json");
//!     let cache = Arc::new(UploadCache::open(&store));
//!     let pipeline = Pipeline::from_config(PipelineConfig::default(), cache.clone())?;
//!
//!     let doc = Path::new("notes/index.md");
//!     let out = pipeline.rewrite_file(doc, doc, CancellationToken::new()).await?;
//!     cache.save_to(&store)?;
//!     eprintln!("{} uploaded, {} failed", out.summary.uploaded, out.summary.failed);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `mdik` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! mdimage-kit = { version = "0.1", default-features = false }
//! ```
//!
//! ## Storage Backends
//!
//! | Identifier | Stores to | Notes |
//! |------------|-----------|-------|
//! | `local`  | a directory | `file://` URLs unless `base_url` is set |
//! | `github` | a repository via the contents API | needs a token with `contents:write` |
//! | `http`   | an S3-style object endpoint | `PUT`/`HEAD`/`DELETE` with bearer auth |
//! | `custom` | any multipart upload endpoint | URL extracted from the JSON reply |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod asset;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod fingerprint;
pub mod fsutil;
pub mod migrate;
pub mod naming;
pub mod pipeline;
pub mod progress;
pub mod rewrite;
pub mod scan;
pub mod storage;
pub mod thumbnail;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use asset::{AssetSource, ImageAsset, ImageKind};
pub use cache::{CacheEntry, CachePersistence, JsonFileStore, Recorded, UploadCache};
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use coordinator::{Admission, RetryPolicy, TaskOutcome, TaskState, UploadCoordinator, UploadTask};
pub use document::{DocumentSnapshot, ImageMarkup, ImageReference};
pub use error::{CacheError, KitError, RewriteError, StorageError, TaskError, ThumbnailError};
pub use fingerprint::{fingerprint, Fingerprint};
pub use migrate::MigrationFilter;
pub use naming::NamingStrategy;
pub use pipeline::{
    read_markdown, Pipeline, PipelineOutput, ProbeReport, RunSummary, UploadOutcome, UploadResult,
};
pub use progress::{NoopProgressCallback, ProgressCallback, UploadProgressCallback};
pub use rewrite::{Edit, LabelStyle, RewritePlan};
pub use scan::scan_markdown;
pub use storage::{create_backend, BackendConfig, RemoteLocation, StorageBackend};
pub use thumbnail::{ThumbnailAsset, ThumbnailConstraints};
