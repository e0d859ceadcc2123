//! Configuration types for an upload pipeline run.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`] or loaded from a host's loose options map
//! with [`PipelineConfig::from_options`].

use crate::coordinator::RetryPolicy;
use crate::error::KitError;
use crate::naming::NamingStrategy;
use crate::progress::ProgressCallback;
use crate::rewrite::LabelStyle;
use crate::storage::{BackendConfig, BACKEND_IDENTIFIERS};
use crate::thumbnail::ThumbnailConstraints;
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Configuration for one pipeline run.
///
/// Built via [`PipelineConfig::builder()`] or using
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use mdimage_kit::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .max_concurrent_uploads(6)
///     .max_retry_attempts(5)
///     .thumbnail_size(800, 600)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Upload slots; submission beyond this blocks. Default: 4.
    ///
    /// Uploads are network-bound. A handful of parallel transfers saturates
    /// a typical uplink while staying under hosted APIs' abuse limits; raise
    /// it for a private object store, lower it if you see `429`s.
    pub max_concurrent_uploads: usize,

    /// Retries after the first attempt for transient failures. Default: 3.
    ///
    /// A task is attempted at most `max_retry_attempts + 1` times. Auth,
    /// quota and rejection errors are never retried.
    pub max_retry_attempts: u32,

    /// Base backoff in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Upper bound for any single backoff delay. Default: 8000.
    pub max_backoff_ms: u64,

    /// Thumbnail bounds and JPEG quality. Default: 1024×1024 at 80.
    pub thumbnail: ThumbnailConstraints,

    /// Upload a thumbnail next to each original. Default: true.
    ///
    /// When disabled, images are still decoded-checked by magic bytes so a
    /// non-image file is never uploaded.
    pub generate_thumbnails: bool,

    /// Remote key naming. Default: [`NamingStrategy::ContentHash`].
    pub naming: NamingStrategy,

    /// Directory prefix for every remote key. Default: empty.
    pub key_prefix: String,

    /// Markup emitted around rewritten Markdown images. Default:
    /// [`LabelStyle::Original`].
    pub label_style: LabelStyle,

    /// Wall-clock bound for a whole run, in seconds. Default: 600.
    pub run_timeout_secs: u64,

    /// Per-request HTTP timeout, in seconds. Default: 60.
    pub request_timeout_secs: u64,

    /// Storage backend and its settings. Default: local `uploads/`.
    pub backend: BackendConfig,

    /// Optional per-image progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 4,
            max_retry_attempts: 3,
            retry_backoff_ms: 500,
            max_backoff_ms: 8000,
            thumbnail: ThumbnailConstraints::default(),
            generate_thumbnails: true,
            naming: NamingStrategy::default(),
            key_prefix: String::new(),
            label_style: LabelStyle::default(),
            run_timeout_secs: 600,
            request_timeout_secs: 60,
            backend: BackendConfig::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("max_concurrent_uploads", &self.max_concurrent_uploads)
            .field("max_retry_attempts", &self.max_retry_attempts)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("max_backoff_ms", &self.max_backoff_ms)
            .field("thumbnail", &self.thumbnail)
            .field("generate_thumbnails", &self.generate_thumbnails)
            .field("naming", &self.naming)
            .field("key_prefix", &self.key_prefix)
            .field("label_style", &self.label_style)
            .field("run_timeout_secs", &self.run_timeout_secs)
            .field("backend", &self.backend.identifier())
            .field(
                "progress_callback",
                &self
                    .progress_callback
                    .as_ref()
                    .map(|_| "<dyn UploadProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Load from a loose options map (host settings, `--options` JSON).
    ///
    /// Recognised keys: `maxConcurrentUploads`, `maxRetryAttempts`,
    /// `thumbnailMaxWidth`, `thumbnailMaxHeight`, `backendIdentifier`,
    /// `retryBackoffMs`, `maxBackoffMs`, `thumbnailQuality`,
    /// `generateThumbnails`, `keyPrefix`, `naming`, `labelStyle`,
    /// `labelTemplate`, `runTimeoutSecs`, `backend`. Unrecognised keys are ignored. A recognised key with the
    /// wrong type is [`KitError::InvalidConfig`].
    pub fn from_options(options: &Map<String, Value>) -> Result<Self, KitError> {
        Self::builder().options(options)?.build()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retry_attempts,
            base_delay: Duration::from_millis(self.retry_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
        }
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn max_concurrent_uploads(mut self, n: usize) -> Self {
        self.config.max_concurrent_uploads = n.max(1);
        self
    }

    pub fn max_retry_attempts(mut self, n: u32) -> Self {
        self.config.max_retry_attempts = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.config.max_backoff_ms = ms;
        self
    }

    pub fn thumbnail_size(mut self, max_width: u32, max_height: u32) -> Self {
        self.config.thumbnail.max_width = max_width.max(1);
        self.config.thumbnail.max_height = max_height.max(1);
        self
    }

    pub fn thumbnail_quality(mut self, q: u8) -> Self {
        self.config.thumbnail.quality = q.clamp(1, 100);
        self
    }

    pub fn generate_thumbnails(mut self, v: bool) -> Self {
        self.config.generate_thumbnails = v;
        self
    }

    pub fn naming(mut self, strategy: NamingStrategy) -> Self {
        self.config.naming = strategy;
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.key_prefix = prefix.into();
        self
    }

    pub fn label_style(mut self, style: LabelStyle) -> Self {
        self.config.label_style = style;
        self
    }

    pub fn run_timeout_secs(mut self, secs: u64) -> Self {
        self.config.run_timeout_secs = secs;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    pub fn backend(mut self, backend: BackendConfig) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Apply every recognised key of an options map on top of the current
    /// settings.
    pub fn options(mut self, options: &Map<String, Value>) -> Result<Self, KitError> {
        let mut identifier: Option<String> = None;
        let mut backend_settings: Option<Map<String, Value>> = None;
        let mut label_style: Option<String> = None;
        let mut label_template: Option<String> = None;

        for (key, value) in options {
            match key.as_str() {
                "maxConcurrentUploads" => {
                    self = self.max_concurrent_uploads(as_u64(key, value)? as usize)
                }
                "maxRetryAttempts" => self = self.max_retry_attempts(as_u32(key, value)?),
                "retryBackoffMs" => self = self.retry_backoff_ms(as_u64(key, value)?),
                "maxBackoffMs" => self = self.max_backoff_ms(as_u64(key, value)?),
                "thumbnailMaxWidth" => {
                    let h = self.config.thumbnail.max_height;
                    self = self.thumbnail_size(as_u32(key, value)?, h);
                }
                "thumbnailMaxHeight" => {
                    let w = self.config.thumbnail.max_width;
                    self = self.thumbnail_size(w, as_u32(key, value)?);
                }
                "thumbnailQuality" => {
                    let q = as_u64(key, value)?.min(100) as u8;
                    self = self.thumbnail_quality(q);
                }
                "generateThumbnails" => {
                    let v = value.as_bool().ok_or_else(|| wrong_type(key, "a boolean"))?;
                    self = self.generate_thumbnails(v);
                }
                "keyPrefix" => self = self.key_prefix(as_str(key, value)?),
                "naming" => {
                    let strategy = as_str(key, value)?
                        .parse()
                        .map_err(KitError::InvalidConfig)?;
                    self = self.naming(strategy);
                }
                "labelStyle" => label_style = Some(as_str(key, value)?.to_string()),
                "labelTemplate" => label_template = Some(as_str(key, value)?.to_string()),
                "runTimeoutSecs" => self = self.run_timeout_secs(as_u64(key, value)?),
                "backendIdentifier" => identifier = Some(as_str(key, value)?.to_string()),
                "backend" => {
                    let obj = value
                        .as_object()
                        .ok_or_else(|| wrong_type(key, "an object"))?;
                    backend_settings = Some(obj.clone());
                }
                other => debug!("Ignoring unrecognised option '{}'", other),
            }
        }

        match (label_style.as_deref(), label_template) {
            (None | Some("custom"), Some(template)) => {
                self = self.label_style(LabelStyle::Custom(template))
            }
            (Some("custom"), None) => {
                return Err(KitError::InvalidConfig(
                    "labelStyle 'custom' needs a labelTemplate".into(),
                ))
            }
            (Some(name), _) => {
                self = self.label_style(name.parse().map_err(KitError::InvalidConfig)?)
            }
            (None, None) => {}
        }

        if identifier.is_some() || backend_settings.is_some() {
            self.config.backend = resolve_backend(identifier, backend_settings)?;
        }
        Ok(self)
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, KitError> {
        let c = &self.config;
        if c.max_concurrent_uploads == 0 {
            return Err(KitError::InvalidConfig(
                "maxConcurrentUploads must be ≥ 1".into(),
            ));
        }
        if c.max_backoff_ms < c.retry_backoff_ms {
            return Err(KitError::InvalidConfig(format!(
                "maxBackoffMs ({}) must be ≥ retryBackoffMs ({})",
                c.max_backoff_ms, c.retry_backoff_ms
            )));
        }
        if c.run_timeout_secs == 0 {
            return Err(KitError::InvalidConfig(
                "runTimeoutSecs must be ≥ 1".into(),
            ));
        }
        if c.request_timeout_secs == 0 {
            return Err(KitError::InvalidConfig(
                "request timeout must be ≥ 1 second".into(),
            ));
        }
        Ok(self.config)
    }
}

/// Combine `backendIdentifier` with the `backend` settings object.
fn resolve_backend(
    identifier: Option<String>,
    settings: Option<Map<String, Value>>,
) -> Result<BackendConfig, KitError> {
    let mut settings = settings.unwrap_or_default();
    let declared = settings
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string);

    let id = match (identifier, declared) {
        (Some(id), Some(declared)) if id != declared => {
            return Err(KitError::InvalidConfig(format!(
                "backendIdentifier '{id}' contradicts backend.type '{declared}'"
            )))
        }
        (Some(id), _) => id,
        (None, Some(declared)) => declared,
        (None, None) => "local".to_string(),
    };
    if !BACKEND_IDENTIFIERS.contains(&id.as_str()) {
        return Err(KitError::UnknownBackend(id));
    }

    settings.insert("type".into(), Value::String(id.clone()));
    serde_json::from_value(Value::Object(settings)).map_err(|e| KitError::BackendNotConfigured {
        backend: id,
        hint: e.to_string(),
    })
}

fn wrong_type(key: &str, expected: &str) -> KitError {
    KitError::InvalidConfig(format!("option '{key}' must be {expected}"))
}

fn as_u64(key: &str, value: &Value) -> Result<u64, KitError> {
    value
        .as_u64()
        .ok_or_else(|| wrong_type(key, "a non-negative integer"))
}

fn as_u32(key: &str, value: &Value) -> Result<u32, KitError> {
    u32::try_from(as_u64(key, value)?).map_err(|_| wrong_type(key, "a 32-bit integer"))
}

fn as_str<'a>(key: &str, value: &'a Value) -> Result<&'a str, KitError> {
    value.as_str().ok_or_else(|| wrong_type(key, "a string"))
}
