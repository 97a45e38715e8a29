//! Source citation collection.
//!
//! Structured annotations from the provider always win. Only when a
//! generation produced none is the final text scanned for inline Markdown
//! links. That scan is a heuristic over free text: a title containing a
//! literal `]` will be cut short.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::normalized::SourceCitation;

static MARKDOWN_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([^\]]+)\]\((https?://[^\s)]+)\)").expect("citation regex is valid")
});

/// Ordered, uri-deduplicated citations for one generation.
#[derive(Debug, Default, Clone)]
pub struct CitationSet {
    seen: HashSet<String>,
    items: Vec<SourceCitation>,
}

impl CitationSet {
    /// Add a citation unless its uri was already recorded.
    pub fn add(&mut self, citation: SourceCitation) {
        let uri = citation.uri.trim();
        if uri.is_empty() || !self.seen.insert(uri.to_string()) {
            return;
        }
        let title = if citation.title.trim().is_empty() {
            uri.to_string()
        } else {
            citation.title
        };
        self.items.push(SourceCitation::new(uri, title));
    }

    pub fn extend(&mut self, citations: impl IntoIterator<Item = SourceCitation>) {
        for c in citations {
            self.add(c);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<SourceCitation> {
        self.items
    }

    /// Structured citations if any were collected, else links parsed from `text`.
    #[must_use]
    pub fn or_markdown_fallback(self, text: &str) -> Vec<SourceCitation> {
        if self.is_empty() {
            extract_markdown_links(text)
        } else {
            self.items
        }
    }
}

/// Extract `[title](url)` links from Markdown text, deduplicated by url.
#[must_use]
pub fn extract_markdown_links(text: &str) -> Vec<SourceCitation> {
    let mut set = CitationSet::default();
    for caps in MARKDOWN_LINK.captures_iter(text) {
        set.add(SourceCitation::new(&caps[2], caps[1].trim()));
    }
    set.into_vec()
}
