//! Remote object key naming.

use crate::fingerprint::Fingerprint;
use chrono::NaiveDate;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Directory, relative to the original's key, that holds thumbnails.
pub const THUMBNAIL_DIR: &str = "thumbs";

/// Number of fingerprint hex characters used by [`NamingStrategy::ContentHash`].
const HASH_NAME_LEN: usize = 16;

/// How an asset's remote object key is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NamingStrategy {
    /// The original file name, unchanged.
    FileName,
    /// `YYYY-MM-DD-<file name>`.
    DateFileName,
    /// `MIK-` followed by six random alphanumerics and the original extension.
    Random,
    /// First 16 hex characters of the fingerprint plus the original extension.
    #[default]
    ContentHash,
}

impl fmt::Display for NamingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NamingStrategy::FileName => "file-name",
            NamingStrategy::DateFileName => "date-file-name",
            NamingStrategy::Random => "random",
            NamingStrategy::ContentHash => "content-hash",
        })
    }
}

impl FromStr for NamingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file-name" => Ok(NamingStrategy::FileName),
            "date-file-name" => Ok(NamingStrategy::DateFileName),
            "random" => Ok(NamingStrategy::Random),
            "content-hash" => Ok(NamingStrategy::ContentHash),
            other => Err(format!(
                "unknown naming strategy '{other}' (expected file-name, date-file-name, random or content-hash)"
            )),
        }
    }
}

/// Split `name` into `(stem, ".ext")`; the extension part may be empty.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    }
}

/// Replace characters that are unsafe in an object key with `-`.
fn sanitise(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Join a prefix directory and a file name into a key with single slashes.
fn join_prefix(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Derive the remote key for an original image.
///
/// `extension` overrides the one in `file_name` when the payload's real kind
/// is known (e.g. a `.jpeg` file normalised to `.jpg`).
pub fn object_key(
    strategy: NamingStrategy,
    prefix: &str,
    file_name: &str,
    extension: Option<&str>,
    fingerprint: &Fingerprint,
    date: NaiveDate,
) -> String {
    let clean = sanitise(file_name);
    let (stem, own_ext) = split_extension(&clean);
    let ext = match extension {
        Some(e) => format!(".{e}"),
        None => own_ext.to_ascii_lowercase(),
    };
    let name = match strategy {
        NamingStrategy::FileName => format!("{stem}{ext}"),
        NamingStrategy::DateFileName => format!("{}-{stem}{ext}", date.format("%Y-%m-%d")),
        NamingStrategy::Random => {
            let tag: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(6)
                .map(char::from)
                .collect();
            format!("MIK-{tag}{ext}")
        }
        NamingStrategy::ContentHash => format!("{}{ext}", fingerprint.short(HASH_NAME_LEN)),
    };
    join_prefix(prefix, &name)
}

/// Key of the thumbnail for an original stored at `original_key`.
///
/// The thumbnail sits in a `thumbs/` directory beside the original and uses
/// its own extension, since its encoding may differ.
pub fn thumbnail_key(original_key: &str, thumb_extension: &str) -> String {
    let (dir, file) = match original_key.rfind('/') {
        Some(i) => (&original_key[..i], &original_key[i + 1..]),
        None => ("", original_key),
    };
    let (stem, _) = split_extension(file);
    join_prefix(dir, &format!("{THUMBNAIL_DIR}/{stem}.{thumb_extension}"))
}

/// Hex characters appended by [`disambiguate`].
const SUFFIX_LEN: usize = 8;

/// Make `key` specific to `fingerprint` by appending its short hex to the
/// file stem: `img/x.png` becomes `img/x-1a2b3c4d.png`. Applying it twice
/// changes nothing.
pub fn disambiguate(key: &str, fingerprint: &Fingerprint) -> String {
    let (dir, file) = match key.rfind('/') {
        Some(i) => (&key[..i], &key[i + 1..]),
        None => ("", key),
    };
    let (stem, ext) = split_extension(file);
    let suffix = format!("-{}", fingerprint.short(SUFFIX_LEN));
    if stem.ends_with(&suffix) {
        return key.to_string();
    }
    join_prefix(dir, &format!("{stem}{suffix}{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 9).unwrap()
    }

    #[test]
    fn content_hash_ignores_file_name() {
        let fp = fingerprint(b"pixels");
        let a = object_key(NamingStrategy::ContentHash, "", "a.png", None, &fp, date());
        let b = object_key(NamingStrategy::ContentHash, "", "b.PNG", None, &fp, date());
        assert_eq!(a, b);
        assert_eq!(a, format!("{}.png", fp.short(16)));
    }

    #[test]
    fn file_name_and_date_strategies() {
        let fp = fingerprint(b"x");
        assert_eq!(
            object_key(NamingStrategy::FileName, "img/", "shot 1.png", None, &fp, date()),
            "img/shot-1.png"
        );
        assert_eq!(
            object_key(NamingStrategy::DateFileName, "/blog/", "cat.jpg", None, &fp, date()),
            "blog/2026-03-09-cat.jpg"
        );
    }

    #[test]
    fn random_strategy_shape() {
        let fp = fingerprint(b"x");
        let key = object_key(NamingStrategy::Random, "", "cat.gif", None, &fp, date());
        assert!(key.starts_with("MIK-"), "{key}");
        assert!(key.ends_with(".gif"), "{key}");
        assert_eq!(key.len(), "MIK-".len() + 6 + ".gif".len());
    }

    #[test]
    fn explicit_extension_wins() {
        let fp = fingerprint(b"x");
        let key = object_key(NamingStrategy::FileName, "", "photo.jpeg", Some("jpg"), &fp, date());
        assert_eq!(key, "photo.jpg");
    }

    #[test]
    fn thumbnail_sits_beside_original() {
        assert_eq!(thumbnail_key("img/abc.png", "jpg"), "img/thumbs/abc.jpg");
        assert_eq!(thumbnail_key("abc.png", "png"), "thumbs/abc.png");
        assert_eq!(thumbnail_key("noext", "png"), "thumbs/noext.png");
    }

    #[test]
    fn disambiguated_keys_carry_the_fingerprint() {
        let fp = fingerprint(b"x");
        let short = fp.short(8);
        assert_eq!(disambiguate("img/x.png", &fp), format!("img/x-{short}.png"));
        assert_eq!(disambiguate("noext", &fp), format!("noext-{short}"));
        let once = disambiguate("img/thumbs/x.jpg", &fp);
        assert_eq!(disambiguate(&once, &fp), once);
        assert_ne!(disambiguate("x.png", &fingerprint(b"y")), disambiguate("x.png", &fp));
    }

    #[test]
    fn strategy_parses_and_displays() {
        for s in ["file-name", "date-file-name", "random", "content-hash"] {
            let parsed: NamingStrategy = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
        assert!("uuid".parse::<NamingStrategy>().is_err());
        assert_eq!(NamingStrategy::default(), NamingStrategy::ContentHash);
    }
}
