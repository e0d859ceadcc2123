//! Shared fixtures for the integration tests: a scripted in-memory storage
//! backend and tiny generated images.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use mdimage_kit::{PipelineConfig, RemoteLocation, StorageBackend, StorageError};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const MOCK_BASE: &str = "https://mock.test";

/// What every `put` does.
pub enum Behaviour {
    Succeed,
    /// Every put fails with this error.
    Fail(StorageError),
    /// Originals succeed, thumbnails fail with this error.
    FailThumbnails(StorageError),
    /// The first `n` puts fail with a network error, then succeed.
    FlakyFor(usize),
    /// Trip the token during the first put, then succeed.
    CancelOnFirstPut(CancellationToken),
    /// Never return.
    Hang,
}

/// In-memory backend that counts calls and tracks peak parallelism.
pub struct MockBackend {
    behaviour: Behaviour,
    delay: Duration,
    puts: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    keys: Mutex<Vec<String>>,
    deletes: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new(behaviour: Behaviour) -> Arc<Self> {
        Self::with_delay(behaviour, Duration::ZERO)
    }

    pub fn with_delay(behaviour: Behaviour, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            delay,
            puts: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            keys: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
        })
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Keys of successful puts, in completion order.
    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    fn stored(&self, key: &str) -> Result<RemoteLocation, StorageError> {
        self.keys.lock().unwrap().push(key.to_string());
        Ok(RemoteLocation {
            url: format!("{MOCK_BASE}/{key}"),
            key: key.to_string(),
        })
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn identifier(&self) -> &str {
        "mock"
    }

    async fn put(
        &self,
        key: &str,
        _bytes: Bytes,
        _content_type: &str,
    ) -> Result<RemoteLocation, StorageError> {
        let n = self.puts.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = match &self.behaviour {
            Behaviour::Succeed => self.stored(key),
            Behaviour::Fail(e) => Err(e.clone()),
            Behaviour::FailThumbnails(e) if key.contains("thumbs/") => Err(e.clone()),
            Behaviour::FailThumbnails(_) => self.stored(key),
            Behaviour::FlakyFor(failures) if n <= *failures => {
                Err(StorageError::NetworkError("connection reset".into()))
            }
            Behaviour::FlakyFor(_) => self.stored(key),
            Behaviour::CancelOnFirstPut(token) => {
                if n == 1 {
                    token.cancel();
                }
                self.stored(key)
            }
            Behaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                self.stored(key)
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.keys.lock().unwrap().iter().any(|k| k == key))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.keys.lock().unwrap().retain(|k| k != key);
        self.deletes.lock().unwrap().push(key.to_string());
        Ok(())
    }
}

/// A small PNG whose bytes differ per `seed`.
pub fn png_bytes(width: u32, height: u32, seed: u8) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([seed, 255 - seed, seed / 2]));
    encode(DynamicImage::ImageRgb8(img), ImageFormat::Png)
}

/// A PNG with a translucent alpha channel.
pub fn rgba_png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, Rgba([10, 20, 30, 128]));
    encode(DynamicImage::ImageRgba8(img), ImageFormat::Png)
}

pub fn jpeg_bytes(width: u32, height: u32, seed: u8) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([seed, seed, 200]));
    encode(DynamicImage::ImageRgb8(img), ImageFormat::Jpeg)
}

fn encode(img: DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), format).unwrap();
    buf
}

/// Write `bytes` to `dir/name`, creating parent directories.
pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, bytes).unwrap();
}

/// Fast retries, no thumbnails unless a test turns them back on.
pub fn test_config() -> mdimage_kit::PipelineConfigBuilder {
    PipelineConfig::builder()
        .retry_backoff_ms(1)
        .max_backoff_ms(2)
        .generate_thumbnails(false)
}
