//! Context entries produced by providers and ranked per request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::fnv1a;

/// What kind of material an entry carries. Compression keeps at least one
/// entry of every kind present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    /// A past conversation turn.
    Message,
    /// A condensed summary of earlier turns.
    Summary,
    /// Reference material (FAQ, knowledge base article).
    Document,
    /// A stated user preference.
    Preference,
    /// Output of a previous tool run.
    ToolOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub content: String,
    pub source_id: String,
    /// How well the entry matches the query, in `[0, 1]`.
    pub relevance: f64,
    /// Moving average of observed usefulness, in `[0, 1]`.
    pub effectiveness: f64,
    pub kind: ContextKind,
    pub timestamp: DateTime<Utc>,
    /// FNV-1a of `content`. Identity for deduplication and usage tracking.
    pub content_hash: u64,
}

impl ContextEntry {
    /// A fresh entry timestamped now, with neutral relevance and
    /// effectiveness.
    pub fn new(content: impl Into<String>, source_id: impl Into<String>, kind: ContextKind) -> Self {
        let content = content.into();
        Self {
            content_hash: fnv1a(content.as_bytes()),
            content,
            source_id: source_id.into(),
            relevance: 0.5,
            effectiveness: 0.5,
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn with_relevance(mut self, relevance: f64) -> Self {
        self.relevance = relevance.clamp(0.0, 1.0);
        self
    }

    pub fn with_effectiveness(mut self, effectiveness: f64) -> Self {
        self.effectiveness = effectiveness.clamp(0.0, 1.0);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Length of the entry's JSON form, the unit of context budgets.
    pub fn serialized_len(&self) -> usize {
        serde_json::to_string(self).map_or(self.content.len(), |s| s.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_depends_only_on_content() {
        let a = ContextEntry::new("reset your password", "faq", ContextKind::Document);
        let b = ContextEntry::new("reset your password", "history", ContextKind::Message)
            .with_relevance(0.9);
        let c = ContextEntry::new("change your email", "faq", ContextKind::Document);
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.content_hash, c.content_hash);
    }

    #[test]
    fn scores_are_clamped() {
        let e = ContextEntry::new("x", "s", ContextKind::Summary)
            .with_relevance(3.0)
            .with_effectiveness(-1.0);
        assert_eq!(e.relevance, 1.0);
        assert_eq!(e.effectiveness, 0.0);
    }

    #[test]
    fn serialized_len_grows_with_content() {
        let short = ContextEntry::new("a", "s", ContextKind::Message);
        let mut long = ContextEntry::new("a".repeat(100), "s", ContextKind::Message)
            .with_timestamp(short.timestamp);
        long.content_hash = short.content_hash;
        assert_eq!(long.serialized_len() - short.serialized_len(), 99);
    }
}
