//! Reference rewriting: upload results → new document text.
//!
//! A [`RewritePlan`] is a set of span replacements. Applying it is
//! all-or-nothing: every edit is validated against the text first (bounds,
//! UTF-8 boundaries, overlap, unchanged target text) and only then is the
//! output built in one pass. The input is never modified, so a rejected
//! plan leaves the caller holding the original text.
//!
//! Failed uploads contribute no edit at all, which keeps their local
//! reference exactly as written.
//!
//! ## Label styles
//!
//! | Style | Emitted for `![alt](path)` |
//! |-------|----------------------------|
//! | `original` | `![alt](url)`, title and brackets kept as written |
//! | `common` | `<a title='alt' href='url' >![alt](url)</a>` |
//! | `large` | `<a data-fancybox title='alt' href='url' >![alt](thumb)</a>` |
//! | custom | the template with `{alt}` `{url}` `{thumb}` `{title}` filled in |
//!
//! `thumb` falls back to `url` when no thumbnail was stored. HTML `<img>`
//! references only ever have their `src` swapped.

use crate::document::ImageMarkup;
use crate::error::RewriteError;
use crate::pipeline::{UploadOutcome, UploadResult};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use tracing::debug;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(alt|url|thumb|title)\}").unwrap());

/// What the rewriter emits around an uploaded image's URL.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LabelStyle {
    /// Swap the target for the URL and leave the rest as written.
    #[default]
    Original,
    /// Wrap the image in a link to itself.
    Common,
    /// Click-to-enlarge: show the thumbnail, link to the full image.
    Large,
    /// Free-form template.
    Custom(String),
}

impl fmt::Display for LabelStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LabelStyle::Original => "original",
            LabelStyle::Common => "common",
            LabelStyle::Large => "large",
            LabelStyle::Custom(_) => "custom",
        })
    }
}

impl FromStr for LabelStyle {
    type Err = String;

    /// Named styles only; a custom style is built from its template.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "original" => Ok(LabelStyle::Original),
            "common" => Ok(LabelStyle::Common),
            "large" => Ok(LabelStyle::Large),
            other => Err(format!(
                "unknown label style '{other}' (expected original, common or large; use a template for custom markup)"
            )),
        }
    }
}

/// Escape text for a single-quoted HTML attribute.
fn attr(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('\'', "&#39;")
        .replace('<', "&lt;")
}

impl LabelStyle {
    /// Replacement for the whole `markup` once the image lives at `url`.
    /// `None` means only the target is swapped.
    pub fn render(
        &self,
        markup: &ImageMarkup,
        url: &str,
        thumbnail_url: Option<&str>,
    ) -> Option<String> {
        let thumb = thumbnail_url.unwrap_or(url);
        let alt = &markup.alt;
        let image = |src: &str| match &markup.title {
            Some(title) => format!("![{alt}]({src} \"{title}\")"),
            None => format!("![{alt}]({src})"),
        };
        match self {
            LabelStyle::Original => None,
            LabelStyle::Common => Some(format!(
                "<a title='{}' href='{url}' >{}</a>",
                attr(alt),
                image(url)
            )),
            LabelStyle::Large => Some(format!(
                "<a data-fancybox title='{}' href='{url}' >{}</a>",
                attr(alt),
                image(thumb)
            )),
            LabelStyle::Custom(template) => Some(
                PLACEHOLDER
                    .replace_all(template, |c: &Captures| match &c[1] {
                        "alt" => alt.clone(),
                        "url" => url.to_string(),
                        "thumb" => thumb.to_string(),
                        _ => markup.title.clone().unwrap_or_default(),
                    })
                    .into_owned(),
            ),
        }
    }
}

/// Replace `span` (which must still read `expected`) with `replacement`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub span: Range<usize>,
    pub expected: String,
    pub replacement: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewritePlan {
    edits: Vec<Edit>,
}

impl RewritePlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// One edit per succeeded result, shaped by `style`; failed results are
    /// skipped.
    pub fn from_results<'a>(
        results: impl IntoIterator<Item = &'a UploadResult>,
        style: &LabelStyle,
    ) -> Self {
        let mut plan = Self::new();
        for result in results {
            let UploadOutcome::Succeeded { url } = &result.outcome else {
                continue;
            };
            let reference = &result.reference;
            let labelled = reference.markup.as_ref().and_then(|m| {
                style
                    .render(m, url, result.thumbnail_url.as_deref())
                    .map(|replacement| (m, replacement))
            });
            plan.push(match labelled {
                Some((markup, replacement)) => Edit {
                    span: markup.span.clone(),
                    expected: markup.text.clone(),
                    replacement,
                },
                None => Edit {
                    span: reference.span.clone(),
                    expected: reference.target.clone(),
                    replacement: url.clone(),
                },
            });
        }
        plan
    }

    pub fn push(&mut self, edit: Edit) {
        self.edits.push(edit);
    }

    pub fn edits(&self) -> &[Edit] {
        &self.edits
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Edits sorted by position, after checking they all fit `text`.
    fn validated<'p>(&'p self, text: &str) -> Result<Vec<&'p Edit>, RewriteError> {
        let mut ordered: Vec<&Edit> = self.edits.iter().collect();
        ordered.sort_by_key(|e| (e.span.start, e.span.end));

        let mut prev: Option<&Edit> = None;
        for edit in &ordered {
            let Range { start, end } = edit.span;
            if start > end || end > text.len() {
                return Err(RewriteError::OutOfBounds {
                    start,
                    end,
                    len: text.len(),
                });
            }
            if !text.is_char_boundary(start) || !text.is_char_boundary(end) {
                return Err(RewriteError::NotCharBoundary { start, end });
            }
            if let Some(p) = prev {
                if start < p.span.end {
                    return Err(RewriteError::Overlap {
                        first_start: p.span.start,
                        first_end: p.span.end,
                        second_start: start,
                        second_end: end,
                    });
                }
            }
            let found = &text[start..end];
            if found != edit.expected {
                return Err(RewriteError::StaleSpan {
                    start,
                    end,
                    expected: edit.expected.clone(),
                    found: found.to_string(),
                });
            }
            prev = Some(edit);
        }
        Ok(ordered)
    }

    /// Produce the rewritten text, or reject the whole plan.
    pub fn apply(&self, text: &str) -> Result<String, RewriteError> {
        let ordered = self.validated(text)?;
        let grow: usize = ordered.iter().map(|e| e.replacement.len()).sum();
        let mut out = String::with_capacity(text.len() + grow);
        let mut cursor = 0;
        for edit in ordered {
            out.push_str(&text[cursor..edit.span.start]);
            out.push_str(&edit.replacement);
            cursor = edit.span.end;
        }
        out.push_str(&text[cursor..]);
        debug!("Applied rewrite plan: {} edit(s)", self.edits.len());
        Ok(out)
    }
}
