//! Markdown scanning: find local image references and their byte spans.
//!
//! Recognised forms:
//!
//! | Syntax | Span covers |
//! |--------|-------------|
//! | `![alt](path)`, `![alt](path "title")` | `path` |
//! | `![alt](<path with spaces>)` | the text inside `<…>` |
//! | `<img src="path">`, `<img src='path'>` | `path` |
//!
//! Remote targets (`http://`, `https://`, `data:`, protocol-relative `//`)
//! and references inside fenced code blocks are skipped by
//! [`scan_markdown`]; [`find_remote_targets`] lists the `http(s)` ones for
//! migration between backends.

use crate::asset::ImageAsset;
use crate::document::{DocumentSnapshot, ImageMarkup, ImageReference};
use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::debug;

static MD_IMAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"!\[(?P<alt>[^\]]*)\]\(\s*(?:<(?P<angled>[^>\n]+)>|(?P<bare>[^\s)]+))(?:\s+(?:"(?P<tdq>[^"]*)"|'(?P<tsq>[^']*)'))?\s*\)"#)
        .unwrap()
});

static HTML_IMG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<img\b[^>]*?\ssrc\s*=\s*(?:"(?P<dq>[^"]+)"|'(?P<sq>[^']+)')"#).unwrap()
});

static FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[ ]{0,3}(```|~~~)").unwrap());

/// Whether a link target points somewhere other than the local filesystem.
pub fn is_remote(target: &str) -> bool {
    let lower = target.trim().to_ascii_lowercase();
    lower.starts_with("http://")
        || lower.starts_with("https://")
        || lower.starts_with("data:")
        || lower.starts_with("//")
        || lower.contains("://")
}

/// Resolve a link target against the document directory, percent-decoding
/// it first. Targets that do not decode to UTF-8 are used as written.
pub fn resolve_target(target: &str, base_dir: &Path) -> PathBuf {
    let decoded = urlencoding::decode(target)
        .map(Cow::into_owned)
        .unwrap_or_else(|_| target.to_string());
    let path = Path::new(&decoded);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Byte ranges of fenced code blocks. An unclosed fence runs to the end.
fn fenced_ranges(text: &str) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut open: Option<(usize, &str)> = None;
    for m in FENCE.captures_iter(text) {
        let (Some(whole), Some(marker)) = (m.get(0), m.get(1)) else {
            continue;
        };
        match open {
            None => open = Some((whole.start(), marker.as_str())),
            Some((start, kind)) if kind == marker.as_str() => {
                ranges.push(start..whole.end());
                open = None;
            }
            Some(_) => {}
        }
    }
    if let Some((start, _)) = open {
        ranges.push(start..text.len());
    }
    ranges
}

/// An image target found in Markdown text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundTarget {
    /// Byte span of the target alone.
    pub span: Range<usize>,
    pub target: String,
    /// Present for `![alt](target)` syntax, absent for `<img>` tags.
    pub markup: Option<ImageMarkup>,
}

fn find_targets(text: &str, keep: impl Fn(&str) -> bool) -> Vec<FoundTarget> {
    let fences = fenced_ranges(text);
    let in_fence = |pos: usize| fences.iter().any(|r| r.contains(&pos));

    let md = MD_IMAGE.captures_iter(text).filter_map(|c| {
        let m = c.name("angled").or_else(|| c.name("bare"))?;
        let whole = c.get(0)?;
        let markup = ImageMarkup {
            span: whole.range(),
            text: whole.as_str().to_string(),
            alt: c.name("alt").map_or("", |a| a.as_str()).to_string(),
            title: c
                .name("tdq")
                .or_else(|| c.name("tsq"))
                .map(|t| t.as_str().to_string()),
        };
        Some((m, Some(markup)))
    });
    let html = HTML_IMG
        .captures_iter(text)
        .filter_map(|c| c.name("dq").or_else(|| c.name("sq")).map(|m| (m, None)));

    let mut found: Vec<FoundTarget> = md
        .chain(html)
        .filter(|(m, _)| !in_fence(m.start()) && keep(m.as_str()))
        .map(|(m, markup)| FoundTarget {
            span: m.range(),
            target: m.as_str().to_string(),
            markup,
        })
        .collect();
    found.sort_by_key(|f| f.span.start);
    found.dedup_by_key(|f| f.span.start);
    found
}

/// Local image targets in `text`, in document order.
pub fn find_local_targets(text: &str) -> Vec<FoundTarget> {
    find_targets(text, |t| !is_remote(t))
}

/// `http(s)` image targets in `text`, in document order.
pub fn find_remote_targets(text: &str) -> Vec<FoundTarget> {
    find_targets(text, |t| {
        let lower = t.trim().to_ascii_lowercase();
        lower.starts_with("http://") || lower.starts_with("https://")
    })
}

/// Build a snapshot of a Markdown document with every local image reference
/// resolved relative to `base_dir`.
///
/// Files are not opened here; an unreadable target surfaces later as that
/// reference's own `ReadError`.
pub fn scan_markdown(text: &str, base_dir: &Path) -> DocumentSnapshot {
    let references: Vec<ImageReference> = find_local_targets(text)
        .into_iter()
        .map(|found| {
            let asset = ImageAsset::from_path(resolve_target(&found.target, base_dir));
            ImageReference::new(found.span, found.target, asset).with_markup(found.markup)
        })
        .collect();
    debug!("Scanned document: {} local image reference(s)", references.len());
    DocumentSnapshot::new(text, references)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(text: &str) -> Vec<String> {
        find_local_targets(text).into_iter().map(|f| f.target).collect()
    }

    #[test]
    fn markdown_images_with_and_without_titles() {
        let text = "![a](img/a.png) and ![b](b.jpg \"Title\") and ![](<my pic.png>)";
        assert_eq!(targets(text), vec!["img/a.png", "b.jpg", "my pic.png"]);
    }

    #[test]
    fn spans_cover_exactly_the_target() {
        let text = "x ![alt](pics/cat.png 'c') y";
        let found = find_local_targets(text);
        assert_eq!(found.len(), 1);
        assert_eq!(&text[found[0].span.clone()], "pics/cat.png");

        let markup = found[0].markup.as_ref().unwrap();
        assert_eq!(&text[markup.span.clone()], "![alt](pics/cat.png 'c')");
        assert_eq!(markup.alt, "alt");
        assert_eq!(markup.title.as_deref(), Some("c"));
    }

    #[test]
    fn html_targets_have_no_markup() {
        let found = find_local_targets(r#"<img src="a.png">"#);
        assert_eq!(found.len(), 1);
        assert!(found[0].markup.is_none());
    }

    #[test]
    fn remote_targets_for_migration() {
        let text = "![a](https://old.cdn/a.png) ![b](b.png) <img src=\"http://x/y.gif\">\n\
                    ```\n![c](https://old.cdn/c.png)\n```\n![d](data:image/png;base64,AA)";
        let found: Vec<String> = find_remote_targets(text).into_iter().map(|f| f.target).collect();
        assert_eq!(found, vec!["https://old.cdn/a.png", "http://x/y.gif"]);
    }

    #[test]
    fn html_img_tags() {
        let text = r#"<p><IMG class="x" src="a.png"></p><img src='b.gif' />"#;
        assert_eq!(targets(text), vec!["a.png", "b.gif"]);
    }

    #[test]
    fn data_src_is_not_src() {
        let text = r#"<img data-src="lazy.png" src="real.png"><img class="a" data-src="only-lazy.png">"#;
        assert_eq!(targets(text), vec!["real.png"]);
    }

    #[test]
    fn remote_targets_are_skipped() {
        let text = "![r](https://cdn/x.png) ![d](data:image/png;base64,AAA) ![p](//cdn/x.png) ![l](local.png)";
        assert_eq!(targets(text), vec!["local.png"]);
    }

    #[test]
    fn fenced_code_is_skipped() {
        let text = "![in](a.png)\n```md\n![code](b.png)\n```\n![after](c.png)\n~~~\n![open](d.png)";
        assert_eq!(targets(text), vec!["a.png", "c.png"]);
    }

    #[test]
    fn plain_links_are_not_images() {
        assert!(targets("[doc](file.png)").is_empty());
    }

    #[test]
    fn snapshot_resolves_relative_to_base_dir() {
        let snap = scan_markdown("![a](img/a.png) ![b](/abs/b.png)", Path::new("/notes"));
        let refs = snap.references();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].asset.display_origin(), "/notes/img/a.png");
        assert_eq!(refs[1].asset.display_origin(), "/abs/b.png");
        assert_eq!(refs[0].target, "img/a.png");
    }

    #[test]
    fn percent_encoded_spaces_resolve() {
        assert_eq!(
            resolve_target("my%20pic.png", Path::new("/d")),
            PathBuf::from("/d/my pic.png")
        );
        assert_eq!(
            resolve_target("%E5%9B%BE.png", Path::new("/d")),
            PathBuf::from("/d/图.png")
        );
        // Not UTF-8 once decoded: keep the target as written.
        assert_eq!(
            resolve_target("bad%FF.png", Path::new("/d")),
            PathBuf::from("/d/bad%FF.png")
        );
    }
}
