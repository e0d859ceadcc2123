//! CLI binary for mdimage-kit.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, runs one document and prints the results.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use mdimage_kit::{
    read_markdown, Fingerprint, JsonFileStore, KitError, MigrationFilter, NamingStrategy, Pipeline,
    PipelineConfig, PipelineOutput, ProgressCallback, RunSummary, UploadCache, UploadOutcome, UploadProgressCallback,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar over the document's references plus
/// a log line per image. Tasks finish out of order, so per-image timings are
/// keyed by fingerprint.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<Fingerprint, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(spinner_style);
        bar.set_prefix("Scanning");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} images  \
             ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        self.bar.set_length(total as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Uploading");
    }

    fn elapsed(&self, fp: &Fingerprint) -> String {
        let secs = self
            .start_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(fp)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        dim(&format!("{secs:.1}s"))
    }
}

impl UploadProgressCallback for CliProgressCallback {
    fn on_run_start(&self, references: usize) {
        self.activate_bar(references);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{references} local image reference(s)"))
        ));
    }

    fn on_cache_hit(&self, fingerprint: &Fingerprint, url: &str) {
        self.bar.println(format!(
            "  {} {}  {}",
            dim("="),
            dim(&fingerprint.short(12)),
            dim(url)
        ));
        self.bar.inc(1);
    }

    fn on_task_start(&self, fingerprint: &Fingerprint, name: &str) {
        self.start_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(*fingerprint, Instant::now());
        self.bar.set_message(name.to_string());
    }

    fn on_task_retry(&self, fingerprint: &Fingerprint, attempt: u32, delay: Duration, error: &str) {
        self.bar.println(format!(
            "  {} {}  attempt {} failed ({}), retrying in {:.1}s",
            cyan("↻"),
            fingerprint.short(12),
            attempt,
            error,
            delay.as_secs_f64()
        ));
    }

    fn on_task_complete(&self, fingerprint: &Fingerprint, url: &str) {
        let took = self.elapsed(fingerprint);
        self.bar
            .println(format!("  {} {}  {}", green("✓"), url, took));
        self.bar.inc(1);
    }

    fn on_task_error(&self, fingerprint: &Fingerprint, error: &str) {
        let took = self.elapsed(fingerprint);
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} {}  {}  {}",
            red("✗"),
            fingerprint.short(12),
            red(&msg),
            took
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, summary: &RunSummary) {
        self.bar.finish_and_clear();
        let mark = if summary.failed == 0 {
            green("✔")
        } else if summary.uploaded == 0 && summary.skipped_duplicate == 0 {
            red("✘")
        } else {
            cyan("⚠")
        };
        eprintln!(
            "{} {} uploaded, {} reused, {} failed",
            mark,
            bold(&summary.uploaded.to_string()),
            summary.skipped_duplicate,
            if summary.failed == 0 {
                "0".to_string()
            } else {
                red(&summary.failed.to_string())
            },
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Upload to ./uploads and print the rewritten document
  mdik notes.md

  # Rewrite in place, storing images in a GitHub repository
  mdik --in-place --backend github \
       --options '{"backend":{"repo":"me/assets","token":"ghp_..."}}' notes.md

  # See which images are already uploaded, without uploading anything
  mdik --dry-run notes.md

  # Move images hosted on an old CDN to the configured backend
  mdik --in-place --migrate-from old-cdn.example.com notes.md

  # Link each image to its full-size upload
  mdik --label-style common notes.md

  # Machine-readable report
  mdik --json -o out.md notes.md > report.json

BACKENDS:
  local    directory on disk          backend.root, backend.base_url
  github   repository contents API    backend.repo, backend.token, backend.branch
  http     S3-style object endpoint   backend.endpoint, backend.bucket, backend.token
  custom   multipart upload endpoint  backend.url, backend.file_field, backend.url_path

LABEL STYLES:
  original  keep the reference as written, only the URL changes (default)
  common    wrap the image in a link to itself
  large     show the thumbnail, link to the original
  custom    --label-template with {alt} {url} {thumb} {title} placeholders

CACHE:
  Uploaded images are remembered by content fingerprint in a JSON manifest,
  by default `.mdik-cache.json` next to the document. Identical bytes are
  never uploaded twice, even across documents sharing the cache.

ENVIRONMENT VARIABLES:
  Every flag can also be set as MDIK_<FLAG>, e.g. MDIK_BACKEND=github.
  RUST_LOG overrides the log filter chosen by --verbose / --quiet.
"#;

/// Upload the images of a Markdown document and rewrite their references.
#[derive(Parser, Debug)]
#[command(
    name = "mdik",
    version,
    about = "Upload the local images of a Markdown document and rewrite the references",
    long_about = "Scan a Markdown document for local images, upload each distinct image once \
(with a thumbnail) to the configured storage backend, and rewrite the references to the \
uploaded URLs. Images that fail to upload keep their original reference.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Markdown document to process.
    input: PathBuf,

    /// Write the rewritten document here instead of stdout.
    #[arg(short, long, env = "MDIK_OUTPUT", conflicts_with = "in_place")]
    output: Option<PathBuf>,

    /// Rewrite the input document in place.
    #[arg(short = 'i', long, env = "MDIK_IN_PLACE")]
    in_place: bool,

    /// Storage backend: local, github, http, custom.
    #[arg(short, long, env = "MDIK_BACKEND")]
    backend: Option<String>,

    /// Pipeline options as a JSON object (same keys as the library options map).
    #[arg(long, env = "MDIK_OPTIONS")]
    options: Option<String>,

    /// Upload cache manifest. Default: .mdik-cache.json beside the document.
    #[arg(long, env = "MDIK_CACHE")]
    cache: Option<PathBuf>,

    /// Concurrent uploads.
    #[arg(short, long, env = "MDIK_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Retries per image on transient failures.
    #[arg(long, env = "MDIK_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Maximum thumbnail width in pixels.
    #[arg(long, env = "MDIK_THUMB_WIDTH")]
    thumb_width: Option<u32>,

    /// Maximum thumbnail height in pixels.
    #[arg(long, env = "MDIK_THUMB_HEIGHT")]
    thumb_height: Option<u32>,

    /// Upload originals only.
    #[arg(long, env = "MDIK_NO_THUMBNAILS")]
    no_thumbnails: bool,

    /// Remote naming: file-name, date-file-name, random, content-hash.
    #[arg(long, env = "MDIK_NAMING")]
    naming: Option<NamingStrategy>,

    /// Directory prefix for every remote key.
    #[arg(long, env = "MDIK_KEY_PREFIX")]
    key_prefix: Option<String>,

    /// How rewritten image references are rendered: original, common, large, custom.
    #[arg(long, env = "MDIK_LABEL_STYLE")]
    label_style: Option<String>,

    /// Template for the custom label style.
    #[arg(long, env = "MDIK_LABEL_TEMPLATE")]
    label_template: Option<String>,

    /// Re-upload remote images whose URL contains this domain instead of
    /// uploading local images.
    #[arg(long, env = "MDIK_MIGRATE_FROM", conflicts_with = "dry_run")]
    migrate_from: Option<String>,

    /// Overall run timeout in seconds.
    #[arg(long, env = "MDIK_TIMEOUT")]
    timeout: Option<u64>,

    /// Print a JSON report instead of the document or summary.
    #[arg(long, env = "MDIK_JSON")]
    json: bool,

    /// Scan and fingerprint only; report which images are already cached.
    #[arg(long)]
    dry_run: bool,

    /// Disable progress bar.
    #[arg(long, env = "MDIK_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "MDIK_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "MDIK_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level library logs unless asked for.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.dry_run;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn UploadProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    let cache_path = cli
        .cache
        .clone()
        .unwrap_or_else(|| default_cache_path(&cli.input));
    let store = JsonFileStore::new(&cache_path);
    let cache = Arc::new(UploadCache::open(&store));
    let pipeline =
        Pipeline::from_config(config, Arc::clone(&cache)).context("Invalid backend settings")?;
    let migrate = cli
        .migrate_from
        .as_deref()
        .map(MigrationFilter::new)
        .transpose()
        .context("Invalid --migrate-from")?;

    // ── Dry run ──────────────────────────────────────────────────────────
    if cli.dry_run {
        let snapshot = read_markdown(&cli.input).await?;
        let reports = pipeline.probe(&snapshot).await;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&reports).context("Failed to serialise report")?
            );
        } else {
            for r in &reports {
                let status = match (&r.cached_url, &r.error) {
                    (Some(url), _) => format!("{}  {}", green("cached"), url),
                    (None, Some(e)) => red(&e.to_string()),
                    (None, None) => cyan("new"),
                };
                println!("{:<40}  {}", r.reference.target, status);
            }
        }
        return Ok(());
    }

    // ── Cancellation ─────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{} interrupted; finishing uploads in flight", cyan("⚠"));
                cancel.cancel();
            }
        });
    }

    // ── Run ──────────────────────────────────────────────────────────────
    let started = Instant::now();
    let destination = if cli.in_place {
        Some(cli.input.clone())
    } else {
        cli.output.clone()
    };
    let output = run_and_record(
        &pipeline,
        &cache,
        &store,
        &cli.input,
        destination.as_deref(),
        migrate.as_ref(),
        cancel,
    )
    .await?;

    if cli.json {
        let report = serde_json::json!({
            "summary": output.summary,
            "results": output.results,
            "cancelled": output.cancelled,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        );
    } else if destination.is_none() {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(output.text.as_bytes())
            .context("Failed to write to stdout")?;
    }

    if !cli.quiet && !cli.json {
        if !show_progress {
            eprintln!(
                "{} uploaded, {} reused, {} failed",
                output.summary.uploaded, output.summary.skipped_duplicate, output.summary.failed
            );
            for r in &output.results {
                if let UploadOutcome::Failed { error } = &r.outcome {
                    eprintln!("  {} {}: {}", red("✗"), r.reference.target, error);
                }
            }
        }
        if let Some(path) = &destination {
            eprintln!(
                "   {} edit(s)  {}ms  →  {}",
                output.plan.len(),
                started.elapsed().as_millis(),
                bold(&path.display().to_string())
            );
        }
        if output.cancelled {
            eprintln!("   {}", dim("run was cancelled; remaining images were left local"));
        }
    }

    Ok(())
}

/// Run the pipeline (or a migration) over `input`, writing the result to
/// `destination` when given, and save the cache whether or not the run or
/// the write succeeded.
async fn run_and_record(
    pipeline: &Pipeline,
    cache: &UploadCache,
    store: &JsonFileStore,
    input: &Path,
    destination: Option<&Path>,
    migrate: Option<&MigrationFilter>,
    cancel: CancellationToken,
) -> Result<PipelineOutput> {
    let outcome = match (destination, migrate) {
        (Some(path), None) => pipeline.rewrite_file(input, path, cancel).await,
        (Some(path), Some(filter)) => pipeline.migrate_file(input, path, filter, cancel).await,
        (None, None) => match read_markdown(input).await {
            Ok(snapshot) => pipeline.run(&snapshot, cancel).await,
            Err(e) => Err(e),
        },
        (None, Some(filter)) => match tokio::fs::read_to_string(input).await {
            Ok(text) => pipeline.migrate(&text, filter, cancel).await,
            Err(e) => Err(KitError::DocumentReadFailed {
                path: input.to_path_buf(),
                source: e,
            }),
        },
    };
    // Successful uploads are recorded even when the document was not.
    let saved = cache
        .save_to(store)
        .with_context(|| format!("Failed to save cache to {}", store.path().display()));
    let output = outcome.context("Upload run failed")?;
    saved?;
    Ok(output)
}

fn default_cache_path(input: &Path) -> PathBuf {
    match input.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(".mdik-cache.json"),
        _ => PathBuf::from(".mdik-cache.json"),
    }
}

/// Map CLI args to `PipelineConfig`. Explicit flags override `--options`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut options: Map<String, Value> = match &cli.options {
        Some(raw) => serde_json::from_str(raw).context("--options must be a JSON object")?,
        None => Map::new(),
    };
    if let Some(id) = &cli.backend {
        options.insert("backendIdentifier".into(), Value::String(id.clone()));
    }
    if let Some(style) = &cli.label_style {
        options.insert("labelStyle".into(), Value::String(style.clone()));
    }
    if let Some(template) = &cli.label_template {
        options.insert("labelTemplate".into(), Value::String(template.clone()));
    }

    let mut builder = PipelineConfig::builder()
        .options(&options)
        .context("Invalid --options")?;

    if let Some(n) = cli.concurrency {
        builder = builder.max_concurrent_uploads(n);
    }
    if let Some(n) = cli.max_retries {
        builder = builder.max_retry_attempts(n);
    }
    if cli.thumb_width.is_some() || cli.thumb_height.is_some() {
        let defaults = PipelineConfig::default().thumbnail;
        builder = builder.thumbnail_size(
            cli.thumb_width.unwrap_or(defaults.max_width),
            cli.thumb_height.unwrap_or(defaults.max_height),
        );
    }
    if cli.no_thumbnails {
        builder = builder.generate_thumbnails(false);
    }
    if let Some(strategy) = cli.naming {
        builder = builder.naming(strategy);
    }
    if let Some(prefix) = &cli.key_prefix {
        builder = builder.key_prefix(prefix.clone());
    }
    if let Some(secs) = cli.timeout {
        builder = builder.run_timeout_secs(secs);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_defaults_to_document_directory() {
        assert_eq!(
            default_cache_path(Path::new("notes/index.md")),
            PathBuf::from("notes/.mdik-cache.json")
        );
        assert_eq!(
            default_cache_path(Path::new("index.md")),
            PathBuf::from(".mdik-cache.json")
        );
    }

    #[test]
    fn flags_override_options_json() {
        let cli = Cli::parse_from([
            "mdik",
            "--options",
            r#"{"maxConcurrentUploads": 2, "keyPrefix": "img"}"#,
            "--concurrency",
            "7",
            "--no-thumbnails",
            "doc.md",
        ]);
        let config = build_config(&cli, None).unwrap();
        assert_eq!(config.max_concurrent_uploads, 7);
        assert_eq!(config.key_prefix, "img");
        assert!(!config.generate_thumbnails);
    }

    #[test]
    fn backend_flag_selects_backend() {
        let cli = Cli::parse_from(["mdik", "--backend", "local", "doc.md"]);
        let config = build_config(&cli, None).unwrap();
        assert_eq!(config.backend.identifier(), "local");
    }

    #[test]
    fn label_flags_override_options_json() {
        use mdimage_kit::LabelStyle;

        let cli = Cli::parse_from([
            "mdik",
            "--options",
            r#"{"labelStyle": "large"}"#,
            "--label-style",
            "common",
            "doc.md",
        ]);
        assert_eq!(build_config(&cli, None).unwrap().label_style, LabelStyle::Common);

        let cli = Cli::parse_from(["mdik", "--label-template", "[{alt}]({url})", "doc.md"]);
        assert_eq!(
            build_config(&cli, None).unwrap().label_style,
            LabelStyle::Custom("[{alt}]({url})".into())
        );

        let cli = Cli::parse_from(["mdik", "--label-style", "custom", "doc.md"]);
        assert!(build_config(&cli, None).is_err());
    }

    #[test]
    fn migrate_flag_conflicts_with_dry_run() {
        assert!(Cli::try_parse_from(["mdik", "--migrate-from", "old.example", "--dry-run", "doc.md"])
            .is_err());
        let cli = Cli::parse_from(["mdik", "--migrate-from", "old.example", "doc.md"]);
        assert_eq!(cli.migrate_from.as_deref(), Some("old.example"));
    }

    #[test]
    fn options_must_be_an_object() {
        let cli = Cli::parse_from(["mdik", "--options", "[1,2]", "doc.md"]);
        assert!(build_config(&cli, None).is_err());
    }

    #[tokio::test]
    async fn cache_is_saved_when_the_document_write_fails() {
        use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
        use mdimage_kit::{BackendConfig, CachePersistence};

        let tmp = tempfile::TempDir::new().unwrap();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([1, 2, 3])))
            .save_with_format(tmp.path().join("a.png"), ImageFormat::Png)
            .unwrap();
        let input = tmp.path().join("doc.md");
        std::fs::write(&input, "![a](a.png)").unwrap();

        let config = PipelineConfig::builder()
            .backend(BackendConfig::Local {
                root: tmp.path().join("store"),
                base_url: "https://s".into(),
            })
            .generate_thumbnails(false)
            .build()
            .unwrap();
        let store = JsonFileStore::new(tmp.path().join("cache.json"));
        let cache = Arc::new(UploadCache::open(&store));
        let pipeline = Pipeline::from_config(config, Arc::clone(&cache)).unwrap();

        // The parent of the destination is a regular file, so the write fails.
        let destination = input.join("out.md");
        let result = run_and_record(
            &pipeline,
            &cache,
            &store,
            &input,
            Some(&destination),
            None,
            CancellationToken::new(),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(store.load().unwrap().len(), 1);
    }
}
