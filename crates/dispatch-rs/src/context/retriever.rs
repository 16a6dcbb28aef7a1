//! Context retrieval, ranking, and usage feedback.
//!
//! [`ContextRetriever::get_relevant_context`] fans out to every available
//! provider concurrently, merges their entries in provider order,
//! deduplicates by content hash (first occurrence wins), ranks, and caches
//! the top entries in the shared [`PerformanceCache`].
//!
//! Rank: `w_r * relevance + w_e * effectiveness + w_t * recency`, with
//! `recency = 0.5 ^ (age / half_life)`.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, warn};

use super::compress::compress_context_window;
use super::entry::ContextEntry;
use super::provider::ContextProvider;
use crate::cache::{PerformanceCache, fnv1a};
use crate::config::RetrieverConfig;
use crate::error::ContextRetrievalError;
use crate::events::{DispatchEvent, EventHandler, NoopHandler};

/// Cache category for ranked context lists.
pub const CONTEXT_CACHE_CATEGORY: &str = "context";

/// Weight of the previous effectiveness in the usage moving average.
const EFFECTIVENESS_DECAY: f64 = 0.7;

pub struct ContextRetriever {
    providers: Vec<Arc<dyn ContextProvider>>,
    cache: Arc<PerformanceCache>,
    config: RetrieverConfig,
    /// Effectiveness learned from usage feedback, by content hash.
    effectiveness: Mutex<HashMap<u64, f64>>,
    events: Arc<dyn EventHandler>,
}

impl std::fmt::Debug for ContextRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let providers: Vec<&str> = self.providers.iter().map(|p| p.source_id()).collect();
        f.debug_struct("ContextRetriever")
            .field("providers", &providers)
            .field("config", &self.config)
            .finish()
    }
}

impl ContextRetriever {
    pub fn new(cache: Arc<PerformanceCache>, config: RetrieverConfig) -> Self {
        Self {
            providers: Vec::new(),
            cache,
            config,
            effectiveness: Mutex::new(HashMap::new()),
            events: Arc::new(NoopHandler),
        }
    }

    /// Add a provider. Providers are merged in the order they were added.
    pub fn with_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_event_handler(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &RetrieverConfig {
        &self.config
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Deterministic cache key for a retrieval.
    pub fn cache_key(query: &str, user_id: &str, limit: usize) -> String {
        let raw = format!("{query}\u{1f}{user_id}\u{1f}{limit}");
        format!("{:016x}", fnv1a(raw.as_bytes()))
    }

    /// Ranked context for `query`, at most `limit` entries.
    pub async fn get_relevant_context(
        &self,
        query: &str,
        user_id: &str,
        limit: usize,
    ) -> Vec<ContextEntry> {
        if limit == 0 {
            return Vec::new();
        }
        let key = Self::cache_key(query, user_id, limit);
        if let Some(mut cached) = self
            .cache
            .get::<Vec<ContextEntry>>(&key, CONTEXT_CACHE_CATEGORY)
        {
            self.apply_learned_effectiveness(&mut cached);
            let cached = self.rank(cached, Utc::now());
            self.events.on_event(&DispatchEvent::ContextRetrieved {
                entries: cached.len(),
                cache_hit: true,
            });
            return cached;
        }

        let contributions = join_all(
            self.providers
                .iter()
                .map(|p| self.fetch_from(p.as_ref(), query, user_id, limit)),
        )
        .await;

        let mut seen = HashSet::new();
        let mut merged: Vec<ContextEntry> = contributions
            .into_iter()
            .flatten()
            .filter(|e| seen.insert(e.content_hash))
            .collect();
        self.apply_learned_effectiveness(&mut merged);

        let ranked = self.rank(merged, Utc::now());
        let top: Vec<ContextEntry> = ranked.into_iter().take(limit).collect();

        if let Err(e) = self
            .cache
            .set(&key, &top, CONTEXT_CACHE_CATEGORY, self.config.cache_ttl)
        {
            warn!("[context] {e}; result not cached");
        }
        self.events.on_event(&DispatchEvent::ContextRetrieved {
            entries: top.len(),
            cache_hit: false,
        });
        top
    }

    /// One provider's contribution: relevant plus (optionally) recent
    /// entries. Errors and timeouts contribute nothing.
    async fn fetch_from(
        &self,
        provider: &dyn ContextProvider,
        query: &str,
        user_id: &str,
        limit: usize,
    ) -> Vec<ContextEntry> {
        let source_id = provider.source_id();
        if !provider.is_available() {
            self.report_failure(&ContextRetrievalError::Unavailable(source_id.to_string()));
            return Vec::new();
        }

        let timeout = self.config.provider_timeout;
        let relevant = Self::bounded(
            source_id,
            timeout,
            provider.get_relevant_context(query, user_id, limit),
        );
        let (relevant, recent) = if self.config.include_recent {
            let recent =
                Self::bounded(source_id, timeout, provider.get_recent_context(query, limit));
            tokio::join!(relevant, recent)
        } else {
            (relevant.await, Ok(Vec::new()))
        };

        let mut entries = Vec::new();
        for result in [relevant, recent] {
            match result {
                Ok(found) => entries.extend(found),
                Err(e) => self.report_failure(&e),
            }
        }
        debug!("[context] {source_id} contributed {} entries", entries.len());
        entries
    }

    async fn bounded<F>(
        source_id: &str,
        timeout: Duration,
        fut: F,
    ) -> Result<Vec<ContextEntry>, ContextRetrievalError>
    where
        F: Future<Output = Result<Vec<ContextEntry>, ContextRetrievalError>>,
    {
        tokio::time::timeout(timeout, fut)
            .await
            .unwrap_or_else(|_| {
                Err(ContextRetrievalError::TimedOut {
                    source_id: source_id.to_string(),
                    elapsed: timeout,
                })
            })
    }

    fn report_failure(&self, error: &ContextRetrievalError) {
        warn!("[context] {error}");
        let (source_id, message) = match error {
            ContextRetrievalError::Unavailable(id) => (id.as_str(), "unavailable".to_string()),
            ContextRetrievalError::Failed { source_id, message } => {
                (source_id.as_str(), message.clone())
            }
            ContextRetrievalError::TimedOut { source_id, .. } => {
                (source_id.as_str(), error.to_string())
            }
        };
        self.events.on_event(&DispatchEvent::ProviderFailed {
            source_id,
            error: &message,
        });
    }

    /// Rank score of `entry` at `now`.
    pub fn rank_score(&self, entry: &ContextEntry, now: DateTime<Utc>) -> f64 {
        let age = (now - entry.timestamp).to_std().unwrap_or(Duration::ZERO);
        let half_life = self.config.recency_half_life.as_secs_f64().max(f64::EPSILON);
        let recency = 0.5f64.powf(age.as_secs_f64() / half_life);
        self.config.relevance_weight * entry.relevance
            + self.config.effectiveness_weight * entry.effectiveness
            + self.config.recency_weight * recency
    }

    /// Sort best first. Ties keep merge order.
    pub fn rank(&self, entries: Vec<ContextEntry>, now: DateTime<Utc>) -> Vec<ContextEntry> {
        let mut scored: Vec<(f64, ContextEntry)> = entries
            .into_iter()
            .map(|e| (self.rank_score(&e, now), e))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.into_iter().map(|(_, e)| e).collect()
    }

    /// Compress ranked `entries` into `target_size` serialized bytes.
    pub fn compress_context_window(
        &self,
        entries: &[ContextEntry],
        target_size: usize,
    ) -> Vec<ContextEntry> {
        compress_context_window(entries, target_size)
    }

    /// Fold an observed usefulness score into each entry's effectiveness:
    /// `new = old * 0.7 + observed * 0.3`. The result is remembered and
    /// applied to future retrievals of the same content.
    pub fn track_context_usage(&self, entries: &mut [ContextEntry], observed: f64) {
        let observed = observed.clamp(0.0, 1.0);
        let mut table = self.effectiveness.lock().unwrap_or_else(|e| e.into_inner());
        for entry in entries {
            let old = table
                .get(&entry.content_hash)
                .copied()
                .unwrap_or(entry.effectiveness);
            let new = old * EFFECTIVENESS_DECAY + observed * (1.0 - EFFECTIVENESS_DECAY);
            table.insert(entry.content_hash, new);
            entry.effectiveness = new;
            debug!(
                "[context] effectiveness of {:016x}: {old:.3} -> {new:.3}",
                entry.content_hash
            );
        }
    }

    /// Learned effectiveness for `content_hash`, if any feedback was given.
    pub fn learned_effectiveness(&self, content_hash: u64) -> Option<f64> {
        self.effectiveness
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&content_hash)
            .copied()
    }

    fn apply_learned_effectiveness(&self, entries: &mut [ContextEntry]) {
        let table = self.effectiveness.lock().unwrap_or_else(|e| e.into_inner());
        if table.is_empty() {
            return;
        }
        for entry in entries {
            if let Some(&learned) = table.get(&entry.content_hash) {
                entry.effectiveness = learned;
            }
        }
    }
}
