//! Image assets discovered in a document.
//!
//! An [`ImageAsset`] lives for exactly one pipeline run: it is created when a
//! reference is discovered and dropped when the run completes. Its
//! fingerprint is computed lazily on first use and never changes afterwards.

use crate::fingerprint::{self, Fingerprint};
use bytes::Bytes;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

/// Where an asset's bytes come from.
#[derive(Debug, Clone)]
pub enum AssetSource {
    /// A file on the local filesystem, read on demand.
    Path(PathBuf),
    /// Bytes already in memory (pasted image, generated content).
    Bytes(Bytes),
}

/// Declared image kind, from the file extension or the payload's magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Png,
    Jpeg,
    Gif,
    Webp,
    Bmp,
    Svg,
    Unknown,
}

impl ImageKind {
    /// Guess from a file extension (case-insensitive).
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "png" => ImageKind::Png,
            "jpg" | "jpeg" => ImageKind::Jpeg,
            "gif" => ImageKind::Gif,
            "webp" => ImageKind::Webp,
            "bmp" => ImageKind::Bmp,
            "svg" => ImageKind::Svg,
            _ => ImageKind::Unknown,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map(Self::from_extension)
            .unwrap_or(ImageKind::Unknown)
    }

    /// Sniff the payload's magic bytes.
    pub fn sniff(bytes: &[u8]) -> Self {
        match image::guess_format(bytes) {
            Ok(image::ImageFormat::Png) => ImageKind::Png,
            Ok(image::ImageFormat::Jpeg) => ImageKind::Jpeg,
            Ok(image::ImageFormat::Gif) => ImageKind::Gif,
            Ok(image::ImageFormat::WebP) => ImageKind::Webp,
            Ok(image::ImageFormat::Bmp) => ImageKind::Bmp,
            _ => ImageKind::Unknown,
        }
    }

    /// MIME type sent to the storage backend.
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageKind::Png => "image/png",
            ImageKind::Jpeg => "image/jpeg",
            ImageKind::Gif => "image/gif",
            ImageKind::Webp => "image/webp",
            ImageKind::Bmp => "image/bmp",
            ImageKind::Svg => "image/svg+xml",
            ImageKind::Unknown => "application/octet-stream",
        }
    }

    /// Canonical file extension, without the dot.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            ImageKind::Png => Some("png"),
            ImageKind::Jpeg => Some("jpg"),
            ImageKind::Gif => Some("gif"),
            ImageKind::Webp => Some("webp"),
            ImageKind::Bmp => Some("bmp"),
            ImageKind::Svg => Some("svg"),
            ImageKind::Unknown => None,
        }
    }
}

/// One image to be fingerprinted, thumbnailed and uploaded.
#[derive(Debug)]
pub struct ImageAsset {
    source: AssetSource,
    /// File name used for naming the remote object.
    name: String,
    kind: ImageKind,
    fingerprint: OnceCell<Fingerprint>,
}

impl ImageAsset {
    /// Asset backed by a file on disk. The file is not touched until the
    /// bytes or fingerprint are requested.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        let kind = ImageKind::from_path(&path);
        Self {
            source: AssetSource::Path(path),
            name,
            kind,
            fingerprint: OnceCell::new(),
        }
    }

    /// Asset backed by an in-memory buffer.
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        let name = name.into();
        let bytes = bytes.into();
        let mut kind = ImageKind::from_path(Path::new(&name));
        if kind == ImageKind::Unknown {
            kind = ImageKind::sniff(&bytes);
        }
        Self {
            source: AssetSource::Bytes(bytes),
            name,
            kind,
            fingerprint: OnceCell::new(),
        }
    }

    pub fn source(&self) -> &AssetSource {
        &self.source
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind declared by the name (or sniffed for nameless buffers).
    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    /// Human-readable origin for reports: the path, or the name for buffers.
    pub fn display_origin(&self) -> String {
        match &self.source {
            AssetSource::Path(p) => p.display().to_string(),
            AssetSource::Bytes(_) => self.name.clone(),
        }
    }

    /// Byte length without reading the whole payload.
    pub fn byte_len(&self) -> io::Result<u64> {
        match &self.source {
            AssetSource::Path(p) => Ok(std::fs::metadata(p)?.len()),
            AssetSource::Bytes(b) => Ok(b.len() as u64),
        }
    }

    /// Load the full payload. Blocking for path-backed assets.
    pub fn load(&self) -> io::Result<Bytes> {
        match &self.source {
            AssetSource::Path(p) => std::fs::read(p).map(Bytes::from),
            AssetSource::Bytes(b) => Ok(b.clone()),
        }
    }

    /// The fingerprint, computed on first call and cached for the asset's
    /// lifetime.
    pub fn fingerprint(&self) -> io::Result<Fingerprint> {
        self.fingerprint
            .get_or_try_init(|| match &self.source {
                AssetSource::Path(p) => fingerprint::fingerprint_file(p),
                AssetSource::Bytes(b) => Ok(fingerprint::fingerprint(b)),
            })
            .copied()
    }

    /// Fill the lazy fingerprint from one the caller computed while loading
    /// the bytes, so the file is not hashed twice. An already-set value wins
    /// and is returned.
    pub(crate) fn adopt_fingerprint(&self, fingerprint: Fingerprint) -> Fingerprint {
        *self.fingerprint.get_or_init(|| fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn kind_from_extension_is_case_insensitive() {
        assert_eq!(ImageKind::from_extension("PNG"), ImageKind::Png);
        assert_eq!(ImageKind::from_extension("jpeg"), ImageKind::Jpeg);
        assert_eq!(ImageKind::from_extension("Jpg"), ImageKind::Jpeg);
        assert_eq!(ImageKind::from_extension("txt"), ImageKind::Unknown);
    }

    #[test]
    fn bytes_asset_sniffs_kind_when_name_has_no_extension() {
        let png_magic = b"\x89PNG\r\n\x1a\n0000000000000000".to_vec();
        let asset = ImageAsset::from_bytes("pasted", png_magic);
        assert_eq!(asset.kind(), ImageKind::Png);
        assert_eq!(asset.kind().mime_type(), "image/png");
    }

    #[test]
    fn fingerprint_is_lazy_and_stable() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.png");
        fs::write(&path, b"first").unwrap();

        let asset = ImageAsset::from_path(&path);
        let first = asset.fingerprint().unwrap();

        // Once set, the identity does not follow later edits to the file.
        fs::write(&path, b"second").unwrap();
        assert_eq!(asset.fingerprint().unwrap(), first);
    }

    #[test]
    fn unreadable_path_surfaces_error() {
        let asset = ImageAsset::from_path("/definitely/not/here.png");
        assert!(asset.fingerprint().is_err());
        assert!(asset.load().is_err());
        assert!(asset.byte_len().is_err());
    }

    #[test]
    fn loaded_fingerprint_matches_streamed_one() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("b.jpg");
        fs::write(&path, b"jpeg-ish bytes").unwrap();

        let streamed = ImageAsset::from_path(&path).fingerprint().unwrap();
        let asset = ImageAsset::from_path(&path);
        let bytes = asset.load().unwrap();
        assert_eq!(asset.adopt_fingerprint(fingerprint::fingerprint(&bytes)), streamed);
        assert_eq!(asset.fingerprint().unwrap(), streamed);
        assert_eq!(asset.name(), "b.jpg");
        assert_eq!(asset.byte_len().unwrap(), 14);
    }
}
