//! Context providers.
//!
//! A [`ContextProvider`] supplies candidate entries for a query. Providers
//! are optional collaborators: an unavailable or failing provider
//! contributes nothing and never fails the request.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use super::entry::ContextEntry;
use crate::error::ContextRetrievalError;
use crate::tools::selector::{extract_keywords, keywords_match};

/// Boxed future returned by provider methods.
pub type ProviderFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<ContextEntry>, ContextRetrievalError>> + Send + 'a>>;

pub trait ContextProvider: Send + Sync {
    /// Identifier used in logs and events.
    fn source_id(&self) -> &str;

    /// Whether the provider can currently serve requests. Unavailable
    /// providers are not called.
    fn is_available(&self) -> bool {
        true
    }

    /// Entries relevant to `query` for `user_id`, best first, at most `limit`.
    fn get_relevant_context<'a>(
        &'a self,
        query: &'a str,
        user_id: &'a str,
        limit: usize,
    ) -> ProviderFuture<'a>;

    /// The most recent entries, newest first, at most `limit`.
    fn get_recent_context<'a>(&'a self, query: &'a str, limit: usize) -> ProviderFuture<'a> {
        let _ = (query, limit);
        Box::pin(async { Ok(Vec::new()) })
    }
}

/// An in-memory provider over a fixed set of entries.
///
/// Relevance is the fraction of query keywords found in the entry.
///
/// ```ignore
/// let faq = StaticContextProvider::new("faq")
///     .with_entry("alice", ContextEntry::new("Refunds take 5 days", "faq", ContextKind::Document))
///     .with_recent(ContextEntry::new("Checkout is degraded", "status", ContextKind::Document));
/// ```
#[derive(Debug)]
pub struct StaticContextProvider {
    source_id: String,
    by_user: HashMap<String, Vec<ContextEntry>>,
    recent: Vec<ContextEntry>,
    available: AtomicBool,
}

impl StaticContextProvider {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            by_user: HashMap::new(),
            recent: Vec::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Add an entry visible to `user_id`.
    pub fn with_entry(mut self, user_id: impl Into<String>, entry: ContextEntry) -> Self {
        self.by_user.entry(user_id.into()).or_default().push(entry);
        self
    }

    /// Add an entry to the shared recent feed.
    pub fn with_recent(mut self, entry: ContextEntry) -> Self {
        self.recent.push(entry);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn relevance(query_keywords: &[String], content: &str) -> f64 {
        if query_keywords.is_empty() {
            return 0.0;
        }
        let content_keywords = extract_keywords(content);
        let matched = query_keywords
            .iter()
            .filter(|qk| content_keywords.iter().any(|ck| keywords_match(qk, ck)))
            .count();
        matched as f64 / query_keywords.len() as f64
    }
}

impl ContextProvider for StaticContextProvider {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn get_relevant_context<'a>(
        &'a self,
        query: &'a str,
        user_id: &'a str,
        limit: usize,
    ) -> ProviderFuture<'a> {
        Box::pin(async move {
            let query_keywords = extract_keywords(query);
            let mut matches: Vec<ContextEntry> = self
                .by_user
                .get(user_id)
                .into_iter()
                .flatten()
                .filter_map(|entry| {
                    let relevance = Self::relevance(&query_keywords, &entry.content);
                    (relevance > 0.0).then(|| entry.clone().with_relevance(relevance))
                })
                .collect();
            matches.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
            matches.truncate(limit);
            Ok(matches)
        })
    }

    fn get_recent_context<'a>(&'a self, query: &'a str, limit: usize) -> ProviderFuture<'a> {
        Box::pin(async move {
            let query_keywords = extract_keywords(query);
            let mut recent: Vec<ContextEntry> = self
                .recent
                .iter()
                .map(|entry| {
                    let relevance = Self::relevance(&query_keywords, &entry.content);
                    entry.clone().with_relevance(relevance)
                })
                .collect();
            recent.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            recent.truncate(limit);
            Ok(recent)
        })
    }
}
