use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::models::RawSource;
use crate::patch::{escape_token, StreamedDocument};
use crate::sanitize::strip_tags;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceIndex {
    pub deduplicated: Vec<RawSource>,
    pub index_map: Vec<usize>,
}

impl SourceIndex {
    pub fn resolve(&self, raw_position: usize) -> Option<(usize, &RawSource)> {
        let index = *self.index_map.get(raw_position)?;
        self.deduplicated.get(index).map(|source| (index, source))
    }

    pub fn len(&self) -> usize {
        self.deduplicated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deduplicated.is_empty()
    }
}

pub fn resolve(raw: &[RawSource]) -> SourceIndex {
    let mut first_seen: HashMap<&str, usize> = HashMap::with_capacity(raw.len());
    let mut deduplicated = Vec::new();
    let mut index_map = Vec::with_capacity(raw.len());

    for (position, source) in raw.iter().enumerate() {
        match first_seen.get(source.url.as_str()) {
            Some(&first) => {
                let resolved = index_map[first];
                index_map.push(resolved);
            }
            None => {
                first_seen.insert(source.url.as_str(), position);
                deduplicated.push(source.clone());
                index_map.push(deduplicated.len() - 1);
            }
        }
    }

    SourceIndex {
        deduplicated,
        index_map,
    }
}

pub fn extract_raw_sources(document: &StreamedDocument, step_name: &str) -> Option<Vec<RawSource>> {
    let pointer = format!("/logs/{}/final_output/output", escape_token(step_name));
    let records = document.pointer(&pointer)?.as_array()?;
    Some(records.iter().map(raw_source_from_record).collect())
}

fn raw_source_from_record(record: &Value) -> RawSource {
    let metadata = record.get("metadata");
    let field = |meta_key: &str, top_key: &str| {
        metadata
            .and_then(|m| m.get(meta_key))
            .or_else(|| record.get(top_key))
            .and_then(Value::as_str)
            .unwrap_or_default()
    };

    RawSource {
        url: field("source", "url").to_string(),
        title: strip_tags(field("title", "title")),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HighlightState(Vec<bool>);

impl HighlightState {
    pub fn cleared(len: usize) -> Self {
        Self(vec![false; len])
    }

    pub fn select(&mut self, index: usize) {
        let len = self.0.len();
        self.0 = (0..len).map(|i| i == index).collect();
    }

    pub fn clear(&mut self) {
        *self = Self::cleared(self.0.len());
    }

    pub fn is_highlighted(&self, index: usize) -> bool {
        self.0.get(index).copied().unwrap_or(false)
    }

    pub fn highlighted(&self) -> Option<usize> {
        self.0.iter().position(|&on| on)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolvedSources {
    raw: Vec<RawSource>,
    index: SourceIndex,
    highlight: HighlightState,
}

impl ResolvedSources {
    pub fn update(&mut self, raw: Vec<RawSource>) -> bool {
        if raw == self.raw {
            return false;
        }
        let index = resolve(&raw);
        self.highlight = HighlightState::cleared(index.len());
        self.index = index;
        self.raw = raw;
        true
    }

    pub fn index(&self) -> &SourceIndex {
        &self.index
    }

    pub fn deduplicated(&self) -> &[RawSource] {
        &self.index.deduplicated
    }

    pub fn highlight(&self) -> &HighlightState {
        &self.highlight
    }

    pub fn hover(&mut self, index: usize) {
        self.highlight.select(index);
    }

    pub fn unhover(&mut self) {
        self.highlight.clear();
    }
}
