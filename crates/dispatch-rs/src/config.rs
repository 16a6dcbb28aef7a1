//! Configuration types for the dispatch core.
//!
//! Every component has its own config struct with sensible defaults. Override
//! specific settings through struct fields or the `with_*` builder methods,
//! or load a JSON file where any subset of fields may be given (missing
//! fields keep their defaults). Durations are expressed in milliseconds in
//! files.
//!
//! # Examples
//!
//! Defaults everywhere:
//!
//! ```ignore
//! let config = DispatchConfig::default();
//! ```
//!
//! Builder overrides:
//!
//! ```ignore
//! let config = DispatchConfig::default()
//!     .with_threshold(0.4)
//!     .with_max_concurrent_operations(8)
//!     .with_default_timeout(Duration::from_secs(10));
//! ```
//!
//! From a file:
//!
//! ```json
//! { "orchestrator": { "max_concurrent_operations": 8, "default_timeout": 10000 } }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Serde adapter: `Duration` <-> integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ── Cache ─────────────────────────────────────────────────────────

/// Configuration for the [`PerformanceCache`](crate::cache::PerformanceCache).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum entries per category unless overridden. Default: 256.
    pub default_max_entries: usize,
    /// Per-category maximum entry counts.
    pub category_limits: HashMap<String, usize>,
    /// TTL used by callers that don't pass one explicitly. Default: 5 minutes.
    #[serde(with = "duration_ms")]
    pub default_ttl: Duration,
    /// Interval of the background expiry sweep. Default: 60 seconds.
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_max_entries: 256,
            category_limits: HashMap::new(),
            default_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Maximum entry count for a category, never below 1.
    pub fn max_entries_for(&self, category: &str) -> usize {
        self.category_limits
            .get(category)
            .copied()
            .unwrap_or(self.default_max_entries)
            .max(1)
    }

    /// Override the maximum entry count for one category.
    pub fn with_category_limit(mut self, category: impl Into<String>, max: usize) -> Self {
        self.category_limits.insert(category.into(), max);
        self
    }
}

// ── Monitor ───────────────────────────────────────────────────────

/// Configuration for the [`ResourceMonitor`](crate::monitor::ResourceMonitor)
/// and its circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// System-wide cap on simultaneously monitored executions. Default: 64.
    pub max_in_flight: usize,
    /// Fraction of the hard timeout after which a soft-limit warning fires.
    /// Default: 0.8.
    pub soft_limit_ratio: f64,
    /// Consecutive failures/timeouts that open a tool's circuit. Default: 3.
    pub failure_threshold: u32,
    /// Rolling window in which the failures must occur. Default: 60 seconds.
    #[serde(with = "duration_ms")]
    pub failure_window: Duration,
    /// How long an open circuit stays open. Default: 30 seconds.
    #[serde(with = "duration_ms")]
    pub cooldown: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            soft_limit_ratio: 0.8,
            failure_threshold: 3,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

// ── Selector ──────────────────────────────────────────────────────

/// Configuration for the [`ToolSelector`](crate::tools::ToolSelector).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Weight of keyword overlap in the base score. Default: 0.6.
    pub keyword_weight: f64,
    /// Weight of the historical success rate in the base score. Default: 0.4.
    pub history_weight: f64,
    /// Recommendations below this score are dropped. Default: 0.5.
    pub threshold: f64,
    /// Increment applied to tools referenced by effective context. Default: 0.1.
    pub context_boost: f64,
    /// Minimum effectiveness for a context entry to boost. Default: 0.7.
    pub boost_min_effectiveness: f64,
    /// Success rate assumed for tools with no history. Default: 0.5.
    pub default_success_rate: f64,
    /// Smoothing factor of the historical moving averages. Default: 0.2.
    pub history_alpha: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            keyword_weight: 0.6,
            history_weight: 0.4,
            threshold: 0.5,
            context_boost: 0.1,
            boost_min_effectiveness: 0.7,
            default_success_rate: 0.5,
            history_alpha: 0.2,
        }
    }
}

// ── Retriever ─────────────────────────────────────────────────────

/// Configuration for the [`ContextRetriever`](crate::context::ContextRetriever).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieverConfig {
    pub relevance_weight: f64,
    pub effectiveness_weight: f64,
    pub recency_weight: f64,
    /// Age at which the recency factor has halved. Default: 24 hours.
    #[serde(with = "duration_ms")]
    pub recency_half_life: Duration,
    /// TTL of cached ranked lists. Default: 5 minutes.
    #[serde(with = "duration_ms")]
    pub cache_ttl: Duration,
    /// Entries returned when the caller doesn't specify a limit. Default: 10.
    pub default_limit: usize,
    /// Also ask providers for recent context. Default: true.
    pub include_recent: bool,
    /// Per-provider call timeout. Default: 5 seconds.
    #[serde(with = "duration_ms")]
    pub provider_timeout: Duration,
    /// Serialized size budget for the context window. Default: 8000.
    pub window_size: usize,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            relevance_weight: 0.5,
            effectiveness_weight: 0.3,
            recency_weight: 0.2,
            recency_half_life: Duration::from_secs(24 * 3600),
            cache_ttl: Duration::from_secs(300),
            default_limit: 10,
            include_recent: true,
            provider_timeout: Duration::from_secs(5),
            window_size: 8000,
        }
    }
}

// ── Orchestrator ──────────────────────────────────────────────────

/// Configuration for the [`ToolOrchestrator`](crate::tools::ToolOrchestrator).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Upper bound on simultaneously running tool invocations. Default: 4.
    pub max_concurrent_operations: usize,
    /// Hard timeout for tools without their own. Default: 30 seconds.
    #[serde(with = "duration_ms")]
    pub default_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: 4,
            default_timeout: Duration::from_secs(30),
        }
    }
}

// ── Top level ─────────────────────────────────────────────────────

/// Full configuration of a [`Dispatcher`](crate::dispatcher::Dispatcher).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub cache: CacheConfig,
    pub monitor: MonitorConfig,
    pub selector: SelectorConfig,
    pub retriever: RetrieverConfig,
    pub orchestrator: OrchestratorConfig,
}

impl DispatchConfig {
    /// Load a configuration from a JSON file and validate it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde can't express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{name} must be in [0, 1], got {v}")))
            }
        };
        unit("selector.keyword_weight", self.selector.keyword_weight)?;
        unit("selector.history_weight", self.selector.history_weight)?;
        unit("selector.threshold", self.selector.threshold)?;
        unit("selector.context_boost", self.selector.context_boost)?;
        unit("selector.history_alpha", self.selector.history_alpha)?;
        unit("retriever.relevance_weight", self.retriever.relevance_weight)?;
        unit("retriever.effectiveness_weight", self.retriever.effectiveness_weight)?;
        unit("retriever.recency_weight", self.retriever.recency_weight)?;

        if self.selector.keyword_weight + self.selector.history_weight > 1.0 + f64::EPSILON {
            return Err(ConfigError::Invalid(
                "selector keyword_weight + history_weight must not exceed 1".into(),
            ));
        }
        if self.monitor.soft_limit_ratio <= 0.0 || self.monitor.soft_limit_ratio > 1.0 {
            return Err(ConfigError::Invalid(format!(
                "monitor.soft_limit_ratio must be in (0, 1], got {}",
                self.monitor.soft_limit_ratio
            )));
        }
        if self.orchestrator.max_concurrent_operations == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.max_concurrent_operations must be at least 1".into(),
            ));
        }
        if self.monitor.max_in_flight == 0 || self.monitor.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "monitor.max_in_flight and monitor.failure_threshold must be at least 1".into(),
            ));
        }
        if self.cache.default_max_entries == 0 {
            return Err(ConfigError::Invalid(
                "cache.default_max_entries must be at least 1".into(),
            ));
        }
        let mut zero_limits: Vec<&str> = self
            .cache
            .category_limits
            .iter()
            .filter(|(_, max)| **max == 0)
            .map(|(category, _)| category.as_str())
            .collect();
        if !zero_limits.is_empty() {
            zero_limits.sort_unstable();
            return Err(ConfigError::Invalid(format!(
                "cache.category_limits must be at least 1 (got 0 for {})",
                zero_limits.join(", ")
            )));
        }

        let non_zero = |name: &str, d: Duration| {
            if d.is_zero() {
                Err(ConfigError::Invalid(format!("{name} must be greater than 0")))
            } else {
                Ok(())
            }
        };
        non_zero("cache.sweep_interval", self.cache.sweep_interval)?;
        non_zero("retriever.provider_timeout", self.retriever.provider_timeout)?;
        non_zero("retriever.recency_half_life", self.retriever.recency_half_life)?;
        non_zero("orchestrator.default_timeout", self.orchestrator.default_timeout)?;
        Ok(())
    }

    /// Set the recommendation threshold.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.selector.threshold = threshold;
        self
    }

    /// Set the bound on concurrent tool invocations.
    pub fn with_max_concurrent_operations(mut self, max: usize) -> Self {
        self.orchestrator.max_concurrent_operations = max;
        self
    }

    /// Set the default per-tool hard timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.orchestrator.default_timeout = timeout;
        self
    }

    /// Set the circuit breaker parameters.
    pub fn with_circuit_breaker(mut self, threshold: u32, window: Duration, cooldown: Duration) -> Self {
        self.monitor.failure_threshold = threshold;
        self.monitor.failure_window = window;
        self.monitor.cooldown = cooldown;
        self
    }
}
