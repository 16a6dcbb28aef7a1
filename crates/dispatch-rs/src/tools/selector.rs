//! Query-driven tool scoring.
//!
//! A tool's score blends keyword overlap between the query and the tool's
//! capability keywords with its historical success rate, then receives a
//! boost when highly effective context entries mention the tool by name.
//! Recommendations are ordered by score, then success rate, then name, so
//! identical inputs always produce identical output.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace};

use super::core::ToolRegistry;
use super::history::PerformanceHistory;
use crate::config::SelectorConfig;
use crate::context::ContextEntry;
use crate::error::SelectionError;
use crate::monitor::ResourceMonitor;

/// Words carrying no capability signal.
const STOP_WORDS: &[&str] = &[
    "about", "after", "again", "all", "also", "and", "any", "are", "been", "before", "but",
    "can", "could", "did", "does", "for", "from", "get", "had", "has", "have", "her", "his",
    "how", "into", "its", "just", "like", "may", "more", "most", "not", "now", "our", "out",
    "please", "should", "some", "than", "that", "the", "their", "them", "then", "there",
    "these", "they", "this", "want", "was", "were", "what", "when", "where", "which", "who",
    "why", "will", "with", "would", "you", "your",
];

const MIN_KEYWORD_LEN: usize = 3;
/// Minimum shared prefix for two keywords to count as a match ("refund" ~ "refunds").
const MIN_SHARED_PREFIX: usize = 4;

/// Lowercased, deduplicated content words of `text`, in first-seen order.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
    {
        if token.chars().count() < MIN_KEYWORD_LEN || STOP_WORDS.contains(&token.as_str()) {
            continue;
        }
        if !keywords.contains(&token) {
            keywords.push(token);
        }
    }
    keywords
}

/// Whether two keywords are equal or share a long enough prefix.
pub fn keywords_match(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let shared = a
        .chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .count();
    shared >= MIN_SHARED_PREFIX
}

/// Fraction of `tool_keywords` matched by some query keyword.
pub fn keyword_overlap(query_keywords: &[String], tool_keywords: &[String]) -> f64 {
    if tool_keywords.is_empty() || query_keywords.is_empty() {
        return 0.0;
    }
    let matched = tool_keywords
        .iter()
        .filter(|tk| query_keywords.iter().any(|qk| keywords_match(qk, tk)))
        .count();
    matched as f64 / tool_keywords.len() as f64
}

/// Lowercase words of `text`, split on anything not alphanumeric. Reads
/// `order_lookup` and "Order Lookup" as the same two words.
fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Whether `name` appears in `text` as a whole run of words.
fn mentions(text: &[String], name: &[String]) -> bool {
    !name.is_empty() && text.windows(name.len()).any(|run| run == name)
}

/// Contributions to a tool's score.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ScoreFactors {
    pub keyword_overlap: f64,
    /// Historical success rate used in the blend.
    pub historical_weight: f64,
    pub context_boost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolRecommendation {
    pub tool: String,
    /// Final score in `[0, 1]`.
    pub score: f64,
    pub factors: ScoreFactors,
}

impl ToolRecommendation {
    /// Ranking order: score desc, success rate desc, name asc.
    fn rank_cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| {
                other
                    .factors
                    .historical_weight
                    .total_cmp(&self.factors.historical_weight)
            })
            .then_with(|| self.tool.cmp(&other.tool))
    }
}

fn sort_recommendations(recs: &mut [ToolRecommendation]) {
    recs.sort_by(ToolRecommendation::rank_cmp);
}

pub struct ToolSelector {
    registry: Arc<ToolRegistry>,
    history: Arc<PerformanceHistory>,
    monitor: Arc<ResourceMonitor>,
    config: SelectorConfig,
}

impl std::fmt::Debug for ToolSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSelector")
            .field("tools", &self.registry.names())
            .field("threshold", &self.config.threshold)
            .finish()
    }
}

impl ToolSelector {
    pub fn new(
        registry: Arc<ToolRegistry>,
        history: Arc<PerformanceHistory>,
        monitor: Arc<ResourceMonitor>,
        config: SelectorConfig,
    ) -> Self {
        Self {
            registry,
            history,
            monitor,
            config,
        }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Score `available_tools` (registry names; unknown names are skipped)
    /// against `query`, including the context boost.
    ///
    /// Tools whose circuit is open are left out entirely. Fails only when
    /// the registry itself is empty.
    pub fn score_tools(
        &self,
        query: &str,
        available_tools: &[String],
        context: &[ContextEntry],
    ) -> Result<Vec<ToolRecommendation>, SelectionError> {
        if self.registry.is_empty() {
            return Err(SelectionError::NoRegistry);
        }

        let query_keywords = extract_keywords(query);
        trace!("[selector] query keywords: {query_keywords:?}");

        let mut scores = Vec::with_capacity(available_tools.len());
        for name in available_tools {
            let Some(descriptor) = self.registry.descriptor(name) else {
                debug!("[selector] skipping unregistered tool {name}");
                continue;
            };
            if self.monitor.is_circuit_open(name) {
                debug!("[selector] {name} excluded: circuit open");
                continue;
            }
            let overlap = keyword_overlap(&query_keywords, &descriptor.keywords);
            let success_rate = self.history.success_rate(name).clamp(0.0, 1.0);
            let score = (self.config.keyword_weight * overlap
                + self.config.history_weight * success_rate)
                .clamp(0.0, 1.0);
            scores.push(ToolRecommendation {
                tool: name.clone(),
                score,
                factors: ScoreFactors {
                    keyword_overlap: overlap,
                    historical_weight: success_rate,
                    context_boost: 0.0,
                },
            });
        }

        let scores = self.apply_context_boost(scores, context);
        for rec in &scores {
            debug!(
                "[selector] {} scored {:.3} (overlap {:.2}, history {:.2}, boost {:.2})",
                rec.tool,
                rec.score,
                rec.factors.keyword_overlap,
                rec.factors.historical_weight,
                rec.factors.context_boost
            );
        }
        Ok(scores)
    }

    /// Add the configured boost, once per tool and capped at 1, to every
    /// tool named in a context entry whose effectiveness is at least the
    /// configured minimum. Returns the recommendations re-sorted.
    pub fn apply_context_boost(
        &self,
        mut scores: Vec<ToolRecommendation>,
        context: &[ContextEntry],
    ) -> Vec<ToolRecommendation> {
        let effective: Vec<Vec<String>> = context
            .iter()
            .filter(|e| e.effectiveness >= self.config.boost_min_effectiveness)
            .map(|e| words(&e.content))
            .collect();

        if !effective.is_empty() {
            for rec in &mut scores {
                let name = words(&rec.tool);
                if effective.iter().any(|content| mentions(content, &name)) {
                    let boosted = (rec.score + self.config.context_boost).min(1.0);
                    rec.factors.context_boost = boosted - rec.score;
                    rec.score = boosted;
                }
            }
        }
        sort_recommendations(&mut scores);
        scores
    }

    /// Score every registered tool, then keep those at or above the
    /// configured threshold.
    pub fn recommend(
        &self,
        query: &str,
        context: &[ContextEntry],
    ) -> Result<Vec<ToolRecommendation>, SelectionError> {
        let scores = self.score_tools(query, self.registry.names(), context)?;
        Ok(filter_by_threshold(scores, self.config.threshold))
    }
}

/// Keep recommendations scoring at least `threshold`. If none pass, keep the
/// single best one so the request still gets an answer.
pub fn filter_by_threshold(
    mut scores: Vec<ToolRecommendation>,
    threshold: f64,
) -> Vec<ToolRecommendation> {
    sort_recommendations(&mut scores);
    let Some(best) = scores.first().cloned() else {
        return scores;
    };
    scores.retain(|r| r.score >= threshold);
    if scores.is_empty() {
        debug!(
            "[selector] nothing reached {threshold:.2}; keeping {} ({:.3}) as last resort",
            best.tool, best.score
        );
        scores.push(best);
    }
    scores
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::context::ContextKind;
    use crate::tools::core::{FnTool, ToolDescriptor, ToolInput};
    use serde_json::Value;
    use std::time::Duration;

    fn tool(name: &str, keywords: &[&str], success: f64) -> FnTool {
        FnTool::new(
            ToolDescriptor::new(name)
                .with_keywords(keywords)
                .with_history(success, Duration::from_millis(50)),
            |_input: ToolInput| async move { Ok(Value::Null) },
        )
    }

    fn selector(registry: ToolRegistry) -> ToolSelector {
        let history = Arc::new(PerformanceHistory::default());
        for d in registry.descriptors() {
            history.seed(d);
        }
        ToolSelector::new(
            Arc::new(registry),
            history,
            Arc::new(ResourceMonitor::default()),
            SelectorConfig::default(),
        )
    }

    fn rec(tool: &str, score: f64) -> ToolRecommendation {
        ToolRecommendation {
            tool: tool.into(),
            score,
            factors: ScoreFactors::default(),
        }
    }

    #[test]
    fn keywords_drop_stop_words_and_short_tokens() {
        assert_eq!(
            extract_keywords("How do I get a REFUND for my order? refund!"),
            vec!["refund", "order"]
        );
        assert!(extract_keywords("").is_empty());
    }

    #[test]
    fn prefix_matching() {
        assert!(keywords_match("refunds", "refund"));
        assert!(keywords_match("shipping", "shipment"));
        assert!(!keywords_match("order", "ore"));
        assert!(!keywords_match("cat", "car"));
    }

    #[test]
    fn overlap_is_fraction_of_tool_keywords() {
        let q = extract_keywords("refund my order");
        let tk = vec!["refund".to_string(), "payment".to_string()];
        assert_eq!(keyword_overlap(&q, &tk), 0.5);
        assert_eq!(keyword_overlap(&q, &[]), 0.0);
    }

    #[test]
    fn scores_are_bounded_and_sorted() {
        let s = selector(
            ToolRegistry::new()
                .with(tool("refunds", &["refund", "money"], 0.9))
                .with(tool("shipping", &["ship", "track", "package"], 1.0))
                .with(tool("weather", &["weather"], 0.0)),
        );
        let scores = s
            .score_tools("track my refund package", s.registry().names(), &[])
            .unwrap();
        assert_eq!(scores.len(), 3);
        for r in &scores {
            assert!((0.0..=1.0).contains(&r.score));
        }
        for pair in scores.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        // shipping: 0.6 * 2/3 + 0.4 * 1.0 = 0.8
        assert_eq!(scores[0].tool, "shipping");
        assert!((scores[0].score - 0.8).abs() < 1e-9);
        assert_eq!(scores[2].tool, "weather");
        assert_eq!(scores[2].score, 0.0);
    }

    #[test]
    fn ties_break_by_success_rate_then_name() {
        let mut recs = vec![
            ToolRecommendation {
                tool: "b".into(),
                score: 0.5,
                factors: ScoreFactors {
                    historical_weight: 0.9,
                    ..Default::default()
                },
            },
            ToolRecommendation {
                tool: "a".into(),
                score: 0.5,
                factors: ScoreFactors {
                    historical_weight: 0.9,
                    ..Default::default()
                },
            },
            ToolRecommendation {
                tool: "c".into(),
                score: 0.5,
                factors: ScoreFactors {
                    historical_weight: 0.95,
                    ..Default::default()
                },
            },
        ];
        sort_recommendations(&mut recs);
        let order: Vec<_> = recs.iter().map(|r| r.tool.as_str()).collect();
        assert_eq!(order, ["c", "a", "b"]);
    }

    #[test]
    fn empty_registry_is_an_error() {
        let s = selector(ToolRegistry::new());
        assert_eq!(
            s.score_tools("anything", &[], &[]),
            Err(SelectionError::NoRegistry)
        );
        assert_eq!(s.recommend("anything", &[]), Err(SelectionError::NoRegistry));
    }

    #[test]
    fn threshold_keeps_only_passing_tools() {
        let filtered = filter_by_threshold(vec![rec("low", 0.3), rec("high", 0.9)], 0.5);
        assert_eq!(filtered, vec![rec("high", 0.9)]);
    }

    #[test]
    fn threshold_keeps_best_as_last_resort() {
        let filtered = filter_by_threshold(vec![rec("a", 0.2), rec("b", 0.4)], 0.5);
        assert_eq!(filtered, vec![rec("b", 0.4)]);
        assert!(filter_by_threshold(vec![], 0.5).is_empty());
    }

    #[test]
    fn context_boost_applies_once_and_caps() {
        let s = selector(ToolRegistry::new().with(tool("order_lookup", &["order"], 0.5)));
        let context = vec![
            ContextEntry::new("Used Order Lookup last time", "h", ContextKind::Message)
                .with_effectiveness(0.9),
            ContextEntry::new("order_lookup worked well", "h", ContextKind::Message)
                .with_effectiveness(0.8),
            ContextEntry::new("order_lookup was useless", "h", ContextKind::Message)
                .with_effectiveness(0.2),
        ];
        let boosted = s.apply_context_boost(vec![rec("order_lookup", 0.5)], &context);
        assert!((boosted[0].score - 0.6).abs() < 1e-9);
        assert!((boosted[0].factors.context_boost - 0.1).abs() < 1e-9);

        let capped = s.apply_context_boost(vec![rec("order_lookup", 0.95)], &context);
        assert_eq!(capped[0].score, 1.0);
    }

    #[test]
    fn low_effectiveness_context_does_not_boost() {
        let s = selector(ToolRegistry::new().with(tool("order_lookup", &["order"], 0.5)));
        let context = vec![
            ContextEntry::new("order_lookup", "h", ContextKind::Message).with_effectiveness(0.69),
        ];
        let out = s.apply_context_boost(vec![rec("order_lookup", 0.5)], &context);
        assert_eq!(out[0].score, 0.5);
    }

    #[test]
    fn boost_matches_whole_words_only() {
        let s = selector(ToolRegistry::new().with(tool("order", &["order"], 0.5)));
        let mention = |text: &str| {
            vec![ContextEntry::new(text, "h", ContextKind::Message).with_effectiveness(0.9)]
        };

        let out = s.apply_context_boost(vec![rec("order", 0.5)], &mention("asked to reorder"));
        assert_eq!(out[0].score, 0.5);
        let out = s.apply_context_boost(vec![rec("order", 0.5)], &mention("ordering twice"));
        assert_eq!(out[0].score, 0.5);

        let out = s.apply_context_boost(vec![rec("order", 0.5)], &mention("the order tool, again"));
        assert!((out[0].score - 0.6).abs() < 1e-9);
        let out = s.apply_context_boost(vec![rec("order", 0.5)], &mention("(order)"));
        assert!((out[0].score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn multi_word_name_must_appear_in_sequence() {
        let s = selector(ToolRegistry::new().with(tool("order_lookup", &["order"], 0.5)));
        let context = vec![
            ContextEntry::new("lookup the order", "h", ContextKind::Message)
                .with_effectiveness(0.9),
            ContextEntry::new("reorder lookups", "h", ContextKind::Message)
                .with_effectiveness(0.9),
        ];
        let out = s.apply_context_boost(vec![rec("order_lookup", 0.5)], &context);
        assert_eq!(out[0].score, 0.5);
    }

    #[test]
    fn boost_can_lift_tool_over_threshold() {
        // 0.6 * 0 + 0.4 * 1.0 = 0.4, boosted to 0.5.
        let s = selector(
            ToolRegistry::new()
                .with(tool("escalate", &["manager"], 1.0))
                .with(tool("faq", &["question"], 0.0)),
        );
        let context =
            vec![ContextEntry::new("escalate resolved it", "h", ContextKind::Summary)
                .with_effectiveness(0.9)];
        let recs = s.recommend("billing issue", &context).unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].tool, "escalate");
        assert!((recs[0].score - 0.5).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_open_tools_are_excluded() {
        let registry = Arc::new(
            ToolRegistry::new()
                .with(tool("flaky", &["refund"], 1.0))
                .with(tool("steady", &["refund"], 0.5)),
        );
        let monitor = Arc::new(ResourceMonitor::new(MonitorConfig::default()));
        for _ in 0..3 {
            monitor.breaker().record_failure("flaky");
        }
        let s = ToolSelector::new(
            Arc::clone(&registry),
            Arc::new(PerformanceHistory::default()),
            Arc::clone(&monitor),
            SelectorConfig::default(),
        );
        let recs = s.recommend("refund", &[]).unwrap();
        let names: Vec<_> = recs.iter().map(|r| r.tool.as_str()).collect();
        assert_eq!(names, ["steady"]);

        tokio::time::advance(monitor.config().cooldown).await;
        let recs = s.recommend("refund", &[]).unwrap();
        assert_eq!(recs[0].tool, "flaky");
    }
}
