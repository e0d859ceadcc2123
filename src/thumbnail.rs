//! Thumbnail generation: decoded image → bounded, re-encoded derivative.
//!
//! The output encoding is a pure function of the input, so the same source
//! bytes always produce the same thumbnail bytes:
//!
//! | Source | Output |
//! |--------|--------|
//! | has an alpha channel, or is PNG / GIF | PNG |
//! | anything else (JPEG, opaque WebP, …) | JPEG at `quality` |
//!
//! Resampling uses Lanczos3. Images already within bounds are re-encoded at
//! their own size and never upscaled.

use crate::error::ThumbnailError;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageError, ImageFormat};
use std::io::Cursor;
use tracing::debug;

/// Size and quality bounds for a thumbnail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThumbnailConstraints {
    pub max_width: u32,
    pub max_height: u32,
    /// JPEG quality, 1–100. Ignored for PNG output.
    pub quality: u8,
}

impl Default for ThumbnailConstraints {
    fn default() -> Self {
        Self {
            max_width: 1024,
            max_height: 1024,
            quality: 80,
        }
    }
}

/// An encoded thumbnail ready for upload.
#[derive(Debug, Clone)]
pub struct ThumbnailAsset {
    pub bytes: Bytes,
    pub width: u32,
    pub height: u32,
    pub content_type: &'static str,
    /// File extension matching `content_type`, without the dot.
    pub extension: &'static str,
}

/// Largest `(w, h)` that fits inside `(max_w, max_h)` with the source aspect
/// ratio. Returns the source size unchanged when it already fits.
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width <= max_width && height <= max_height {
        return (width, height);
    }
    let scale = f64::min(
        max_width as f64 / width as f64,
        max_height as f64 / height as f64,
    );
    let w = ((width as f64 * scale).round() as u32).clamp(1, max_width);
    let h = ((height as f64 * scale).round() as u32).clamp(1, max_height);
    (w, h)
}

/// Decode `bytes`, bound them by `constraints`, and re-encode.
///
/// Non-image input is [`ThumbnailError::UnsupportedFormat`]; recognised but
/// corrupt input is [`ThumbnailError::ProcessingError`]. Neither ever yields
/// partial output.
pub fn generate(
    bytes: &[u8],
    constraints: &ThumbnailConstraints,
) -> Result<ThumbnailAsset, ThumbnailError> {
    if constraints.max_width == 0 || constraints.max_height == 0 {
        return Err(ThumbnailError::ProcessingError(
            "thumbnail bounds must be at least 1x1".into(),
        ));
    }

    let format = image::guess_format(bytes)
        .map_err(|e| ThumbnailError::UnsupportedFormat(e.to_string()))?;
    let img = image::load_from_memory_with_format(bytes, format).map_err(|e| match e {
        ImageError::Unsupported(u) => ThumbnailError::UnsupportedFormat(u.to_string()),
        other => ThumbnailError::ProcessingError(other.to_string()),
    })?;

    let (src_w, src_h) = (img.width(), img.height());
    if src_w == 0 || src_h == 0 {
        return Err(ThumbnailError::ProcessingError("image has no pixels".into()));
    }
    let (w, h) = fit_within(src_w, src_h, constraints.max_width, constraints.max_height);
    let resized = if (w, h) == (src_w, src_h) {
        img
    } else {
        img.resize_exact(w, h, FilterType::Lanczos3)
    };

    let as_png = resized.color().has_alpha()
        || matches!(format, ImageFormat::Png | ImageFormat::Gif);
    let mut buf = Vec::new();
    let (content_type, extension) = if as_png {
        let normalised = if resized.color().has_alpha() {
            DynamicImage::ImageRgba8(resized.to_rgba8())
        } else {
            DynamicImage::ImageRgb8(resized.to_rgb8())
        };
        normalised
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .map_err(|e| ThumbnailError::ProcessingError(e.to_string()))?;
        ("image/png", "png")
    } else {
        let quality = constraints.quality.clamp(1, 100);
        let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());
        rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality))
            .map_err(|e| ThumbnailError::ProcessingError(e.to_string()))?;
        ("image/jpeg", "jpg")
    };

    debug!(
        "Thumbnail {}x{} → {}x{} {} ({} bytes)",
        src_w,
        src_h,
        w,
        h,
        content_type,
        buf.len()
    );

    Ok(ThumbnailAsset {
        bytes: Bytes::from(buf),
        width: w,
        height: h,
        content_type,
        extension,
    })
}
