use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::markdown::render_fragment;
use crate::models::RenderSegment;
use crate::sanitize::{HtmlSanitizer, Sanitizer};
use crate::sources::SourceIndex;

static MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\^(\d+)\]").unwrap_or_else(|_| Regex::new("^$").unwrap()));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CitationSpan {
    pub start: usize,
    pub end: usize,
    pub raw: usize,
    pub index: usize,
}

// Unresolved markers are left out so they stay part of the surrounding text.
pub fn locate_citations(text: &str, sources: &SourceIndex) -> Vec<CitationSpan> {
    MARKER_RE
        .captures_iter(text)
        .filter_map(|captures| {
            let marker = captures.get(0)?;
            let raw = captures.get(1)?.as_str().parse::<usize>().ok()?;
            let (index, _) = sources.resolve(raw)?;
            Some(CitationSpan {
                start: marker.start(),
                end: marker.end(),
                raw,
                index,
            })
        })
        .collect()
}

#[derive(Clone)]
pub struct CitationRenderer {
    sanitizer: Arc<dyn Sanitizer>,
}

impl Default for CitationRenderer {
    fn default() -> Self {
        Self::new(Arc::new(HtmlSanitizer))
    }
}

impl CitationRenderer {
    pub fn new(sanitizer: Arc<dyn Sanitizer>) -> Self {
        Self { sanitizer }
    }

    pub fn render(&self, text: &str, sources: &SourceIndex) -> Vec<RenderSegment> {
        let spans = locate_citations(text, sources);
        let mut segments = Vec::with_capacity(spans.len() * 2 + 1);

        let cursor = spans.iter().fold(0usize, |cursor, span| {
            segments.push(self.text_segment(&text[cursor..span.start]));
            if let Some(source) = sources.deduplicated.get(span.index) {
                segments.push(RenderSegment::Citation {
                    index: span.index,
                    source: source.clone(),
                });
            }
            span.end
        });
        segments.push(self.text_segment(&text[cursor..]));

        segments
    }

    fn text_segment(&self, markdown: &str) -> RenderSegment {
        RenderSegment::text(self.sanitizer.sanitize(&render_fragment(markdown)))
    }
}
