//! Content-addressed identity for image blobs.
//!
//! A [`Fingerprint`] is the SHA-256 digest of an asset's bytes. It is the
//! sole key of the upload cache, so two files with identical content share
//! one upload no matter what they are called or where they live. The digest
//! is content-based rather than path- or mtime-based so it survives renames
//! and `git checkout`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

/// Length of the digest in bytes.
pub const FINGERPRINT_LEN: usize = 32;

/// Read buffer used when hashing files.
const READ_CHUNK: usize = 64 * 1024;

/// Fixed-length, opaque identity derived from asset bytes.
///
/// Identical bytes always produce identical fingerprints. Serialised as a
/// lowercase hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// Lowercase hex form (64 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First `n` hex characters, used for short object names and log lines.
    pub fn short(&self, n: usize) -> String {
        let mut hex = self.to_hex();
        hex.truncate(n.min(FINGERPRINT_LEN * 2));
        hex
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short(12))
    }
}

/// Error returned when parsing a fingerprint from hex.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid fingerprint '{0}': expected 64 hex characters")]
pub struct ParseFingerprintError(String);

impl FromStr for Fingerprint {
    type Err = ParseFingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; FINGERPRINT_LEN];
        hex::decode_to_slice(s, &mut out).map_err(|_| ParseFingerprintError(s.to_string()))?;
        Ok(Fingerprint(out))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Fingerprint an in-memory buffer. Pure and deterministic.
pub fn fingerprint(bytes: &[u8]) -> Fingerprint {
    Fingerprint(Sha256::digest(bytes).into())
}

/// Fingerprint everything a reader yields, streaming in fixed chunks.
///
/// I/O errors are surfaced unchanged; nothing is retried here.
pub fn fingerprint_reader<R: Read>(mut reader: R) -> io::Result<Fingerprint> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(Fingerprint(hasher.finalize().into()))
}

/// Fingerprint a file's contents without loading it all at once.
pub fn fingerprint_file(path: &Path) -> io::Result<Fingerprint> {
    let file = std::fs::File::open(path)?;
    fingerprint_reader(io::BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn identical_bytes_identical_fingerprint() {
        assert_eq!(fingerprint(b"pixels"), fingerprint(b"pixels"));
    }

    #[test]
    fn different_bytes_different_fingerprint() {
        assert_ne!(fingerprint(b"version 1"), fingerprint(b"version 2"));
    }

    #[test]
    fn known_digest_of_empty_input() {
        assert_eq!(
            fingerprint(b"").to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn file_and_buffer_agree_even_with_different_names() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("screenshot.png");
        let b = tmp.path().join("copy of screenshot.png");
        let data = vec![7u8; READ_CHUNK * 2 + 13];
        fs::write(&a, &data).unwrap();
        fs::write(&b, &data).unwrap();

        let fa = fingerprint_file(&a).unwrap();
        assert_eq!(fa, fingerprint_file(&b).unwrap());
        assert_eq!(fa, fingerprint(&data));
    }

    #[test]
    fn missing_file_surfaces_io_error() {
        let tmp = TempDir::new().unwrap();
        let err = fingerprint_file(&tmp.path().join("nope.png")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn hex_parse_and_serde() {
        let fp = fingerprint(b"abc");
        let parsed: Fingerprint = fp.to_hex().parse().unwrap();
        assert_eq!(parsed, fp);

        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{}\"", fp.to_hex()));
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!("abc".parse::<Fingerprint>().is_err());
        assert!("zz".repeat(32).parse::<Fingerprint>().is_err());
        assert!("ab".repeat(33).parse::<Fingerprint>().is_err());
        let upper = fingerprint(b"abc").to_hex().to_uppercase();
        assert_eq!(upper.parse::<Fingerprint>().unwrap(), fingerprint(b"abc"));
    }

    #[test]
    fn short_form_is_prefix() {
        let fp = fingerprint(b"abc");
        assert_eq!(fp.short(16), fp.to_hex()[..16]);
        assert_eq!(fp.short(500).len(), 64);
    }
}
