//! Source attribution
//!
//! Retrieval tools return `{content, source, metadata}` observations. The
//! final answer names the urls it actually relied on after a fixed marker;
//! only those sources are surfaced.

use crate::models::{RetrievedSource, ToolOutput};
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

pub const USED_SOURCES_MARKER: &str = "USED_SOURCES";

/// Characters allowed between the marker and its JSON array
fn is_marker_decoration(c: char) -> bool {
    c == ':' || c == '*' || c == '_' || c.is_whitespace()
}

fn collect_sources(value: &Value, out: &mut Vec<RetrievedSource>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_sources(item, out);
            }
        }
        Value::Object(map) => {
            let source = map.get("source").and_then(Value::as_str);
            match source {
                Some(url) if map.contains_key("content") && !url.trim().is_empty() => {
                    out.push(RetrievedSource {
                        url: url.trim().to_string(),
                        metadata: map.get("metadata").cloned().unwrap_or(Value::Null),
                    });
                }
                _ => {
                    for nested in map.values() {
                        if nested.is_array() {
                            collect_sources(nested, out);
                        }
                    }
                }
            }
        }
        _ => {}
    }
}

/// Retrieved sources found in one tool observation
pub fn extract_retrieved_sources(data: &Value) -> Vec<RetrievedSource> {
    let mut sources = Vec::new();
    collect_sources(data, &mut sources);
    sources
}

/// Sources retrieved over one specialist invocation, in observation order
#[derive(Debug, Clone, Default)]
pub struct SourceAccumulator {
    sources: Vec<RetrievedSource>,
}

impl SourceAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, output: &ToolOutput) {
        if output.success {
            self.sources.extend(extract_retrieved_sources(&output.data));
        }
    }

    pub fn sources(&self) -> &[RetrievedSource] {
        &self.sources
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Split an answer into its visible text and the used-source urls.
/// A missing marker or malformed list yields no urls.
pub fn split_used_sources(text: &str) -> (String, Vec<String>) {
    let Some(marker_at) = text.rfind(USED_SOURCES_MARKER) else {
        return (text.to_string(), Vec::new());
    };

    let visible_end = text[..marker_at]
        .trim_end_matches(|c: char| c == '*' || c == '_' || c.is_whitespace())
        .len();
    let visible_head = &text[..visible_end];

    let after_marker = &text[marker_at + USED_SOURCES_MARKER.len()..];
    let rest = after_marker.trim_start_matches(is_marker_decoration);

    if rest.starts_with('[') {
        let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<Vec<String>>();
        if let Some(Ok(urls)) = stream.next() {
            let trailing = rest[stream.byte_offset()..]
                .trim_start_matches(|c: char| c == '*' || c == '_')
                .trim();
            let mut visible = visible_head.to_string();
            if !trailing.is_empty() {
                visible.push_str("\n\n");
                visible.push_str(trailing);
            }
            return (visible, urls);
        }
    }

    debug!("Used-source marker present but list did not parse");
    let line_end = after_marker.find('\n').map(|i| i + 1).unwrap_or(after_marker.len());
    let mut visible = visible_head.to_string();
    let remainder = after_marker[line_end..].trim();
    if !remainder.is_empty() {
        visible.push_str("\n\n");
        visible.push_str(remainder);
    }
    (visible, Vec::new())
}

pub fn parse_used_sources(text: &str) -> Vec<String> {
    split_used_sources(text).1
}

/// Retrieved sources whose url was used, first occurrence kept
pub fn filter_used_sources(retrieved: &[RetrievedSource], used: &[String]) -> Vec<RetrievedSource> {
    let used: HashSet<&str> = used.iter().map(|u| u.trim()).collect();
    let mut seen: HashSet<&str> = HashSet::new();

    retrieved
        .iter()
        .filter(|s| used.contains(s.url.as_str()) && seen.insert(s.url.as_str()))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribution {
    pub visible_text: String,
    pub used_urls: Vec<String>,
    pub sources: Vec<RetrievedSource>,
}

/// Reconcile a final answer against what was retrieved
pub fn reconcile(answer: &str, retrieved: &[RetrievedSource]) -> Attribution {
    let (visible_text, used_urls) = split_used_sources(answer);
    let sources = filter_used_sources(retrieved, &used_urls);

    debug!(
        retrieved = retrieved.len(),
        used = used_urls.len(),
        surfaced = sources.len(),
        "Reconciled source attribution"
    );

    Attribution {
        visible_text,
        used_urls,
        sources,
    }
}
