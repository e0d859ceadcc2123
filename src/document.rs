//! Immutable document input for a pipeline run.

use crate::asset::ImageAsset;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// The whole `![alt](target "title")` construct around a Markdown image.
///
/// Label styles other than the original one replace this span instead of
/// just the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMarkup {
    pub span: Range<usize>,
    /// Text found at `span` when the snapshot was taken.
    pub text: String,
    pub alt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// One image reference inside the document text.
#[derive(Debug)]
pub struct ImageReference {
    /// Byte span of the link target (the path, not the whole `![..](..)`).
    pub span: Range<usize>,
    /// Text found at `span` when the snapshot was taken.
    pub target: String,
    /// The image the target points at.
    pub asset: ImageAsset,
    /// Surrounding Markdown syntax; `None` for HTML `<img>` tags.
    pub markup: Option<ImageMarkup>,
}

impl ImageReference {
    pub fn new(span: Range<usize>, target: impl Into<String>, asset: ImageAsset) -> Self {
        Self {
            span,
            target: target.into(),
            asset,
            markup: None,
        }
    }

    pub fn with_markup(mut self, markup: Option<ImageMarkup>) -> Self {
        self.markup = markup;
        self
    }
}

/// Document text plus the references discovered in it.
///
/// The pipeline never looks for references itself; it only consumes what
/// the snapshot lists. See [`crate::scan::scan_markdown`] for Markdown.
#[derive(Debug)]
pub struct DocumentSnapshot {
    text: String,
    references: Vec<ImageReference>,
}

impl DocumentSnapshot {
    pub fn new(text: impl Into<String>, mut references: Vec<ImageReference>) -> Self {
        references.sort_by_key(|r| r.span.start);
        Self {
            text: text.into(),
            references,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// References in document order.
    pub fn references(&self) -> &[ImageReference] {
        &self.references
    }
}
