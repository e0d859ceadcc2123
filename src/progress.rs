//! Progress-callback trait for per-image upload events.
//!
//! Inject an [`Arc<dyn UploadProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the pipeline fingerprints, uploads and retries each image.
//!
//! # Example
//!
//! ```rust
//! use mdimage_kit::{Fingerprint, PipelineConfig, UploadProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     uploaded: AtomicUsize,
//! }
//!
//! impl UploadProgressCallback for CountingCallback {
//!     fn on_task_complete(&self, _fingerprint: &Fingerprint, url: &str) {
//!         self.uploaded.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("uploaded → {url}");
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { uploaded: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::fingerprint::Fingerprint;
use crate::pipeline::RunSummary;
use std::sync::Arc;
use std::time::Duration;

/// Called by the pipeline as images move through a run.
///
/// Task events arrive concurrently from different worker tasks, so
/// implementations must protect shared mutable state (`Mutex`, atomics).
/// Every method defaults to a no-op.
pub trait UploadProgressCallback: Send + Sync {
    /// Called once before the first image is read.
    ///
    /// * `references`: image references listed in the document snapshot
    fn on_run_start(&self, references: usize) {
        let _ = references;
    }

    /// An image was already uploaded in an earlier run.
    fn on_cache_hit(&self, fingerprint: &Fingerprint, url: &str) {
        let _ = (fingerprint, url);
    }

    /// A task was admitted to a concurrency slot.
    fn on_task_start(&self, fingerprint: &Fingerprint, name: &str) {
        let _ = (fingerprint, name);
    }

    /// A transient failure will be retried after `delay`.
    ///
    /// `attempt` is the 1-indexed attempt that just failed.
    fn on_task_retry(&self, fingerprint: &Fingerprint, attempt: u32, delay: Duration, error: &str) {
        let _ = (fingerprint, attempt, delay, error);
    }

    fn on_task_complete(&self, fingerprint: &Fingerprint, url: &str) {
        let _ = (fingerprint, url);
    }

    /// A task reached `Failed`; its references stay untouched.
    fn on_task_error(&self, fingerprint: &Fingerprint, error: &str) {
        let _ = (fingerprint, error);
    }

    /// Called once after every task is terminal and the rewrite is applied.
    fn on_run_complete(&self, summary: &RunSummary) {
        let _ = summary;
    }
}

/// The default when no callback is configured.
pub struct NoopProgressCallback;

impl UploadProgressCallback for NoopProgressCallback {}

/// The type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn UploadProgressCallback>;
