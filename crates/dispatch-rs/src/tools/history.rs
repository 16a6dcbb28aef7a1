//! Historical tool performance.
//!
//! [`PerformanceHistory`] is an owned table of per-tool success rate and
//! mean latency, updated as exponential moving averages from recorded
//! outcomes. It seeds from tool descriptors and, optionally, from an
//! external [`UsageSink`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use super::core::ToolDescriptor;
use crate::config::SelectorConfig;

/// Aggregated performance of one tool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ToolStats {
    pub success_rate: f64,
    #[serde(with = "crate::config::duration_ms", rename = "mean_latency_ms")]
    pub mean_latency: Duration,
    /// Outcomes folded in since seeding.
    pub samples: u64,
}

/// One recorded tool attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageRecord {
    pub tool: String,
    #[serde(with = "crate::config::duration_ms", rename = "duration_ms")]
    pub duration: Duration,
    pub success: bool,
    pub recorded_at: DateTime<Utc>,
}

/// External persistence for tool usage.
///
/// Consulted only to seed and refresh the selector's history; calls are
/// synchronous, so implementations should buffer and return quickly.
pub trait UsageSink: Send + Sync {
    fn record_usage(&self, tool: &str, duration: Duration, success: bool);

    /// Past attempts of `tool`, oldest first.
    fn fetch_history(&self, tool: &str) -> Vec<UsageRecord>;
}

/// A [`UsageSink`] that keeps every record in memory.
#[derive(Debug, Default)]
pub struct InMemoryUsageSink {
    records: Mutex<Vec<UsageRecord>>,
}

impl InMemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl UsageSink for InMemoryUsageSink {
    fn record_usage(&self, tool: &str, duration: Duration, success: bool) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(UsageRecord {
                tool: tool.to_string(),
                duration,
                success,
                recorded_at: Utc::now(),
            });
    }

    fn fetch_history(&self, tool: &str) -> Vec<UsageRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.tool == tool)
            .cloned()
            .collect()
    }
}

#[derive(Debug)]
pub struct PerformanceHistory {
    alpha: f64,
    default_success_rate: f64,
    stats: Mutex<HashMap<String, ToolStats>>,
}

impl PerformanceHistory {
    /// `alpha` is the weight of each new observation.
    pub fn new(alpha: f64, default_success_rate: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            default_success_rate: default_success_rate.clamp(0.0, 1.0),
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &SelectorConfig) -> Self {
        Self::new(config.history_alpha, config.default_success_rate)
    }

    /// Seed a tool's record from its descriptor unless one already exists.
    pub fn seed(&self, descriptor: &ToolDescriptor) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats
            .entry(descriptor.name.clone())
            .or_insert_with(|| ToolStats {
                success_rate: descriptor.success_rate,
                mean_latency: descriptor.mean_latency,
                samples: 0,
            });
    }

    pub fn get(&self, tool: &str) -> Option<ToolStats> {
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(tool)
            .copied()
    }

    /// Success rate of `tool`, or the configured default if unknown.
    pub fn success_rate(&self, tool: &str) -> f64 {
        self.get(tool)
            .map_or(self.default_success_rate, |s| s.success_rate)
    }

    /// Fold one outcome into the moving averages.
    pub fn record(&self, tool: &str, duration: Duration, success: bool) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        let entry = stats.entry(tool.to_string()).or_insert(ToolStats {
            success_rate: self.default_success_rate,
            mean_latency: duration,
            samples: 0,
        });
        let observed = if success { 1.0 } else { 0.0 };
        entry.success_rate = entry.success_rate * (1.0 - self.alpha) + observed * self.alpha;
        entry.mean_latency = Duration::from_secs_f64(
            entry.mean_latency.as_secs_f64() * (1.0 - self.alpha)
                + duration.as_secs_f64() * self.alpha,
        );
        entry.samples += 1;
        debug!(
            "[history] {tool}: success rate {:.3}, mean latency {:.0}ms",
            entry.success_rate,
            entry.mean_latency.as_secs_f64() * 1000.0
        );
    }

    /// Replay the sink's records for `names` into the table.
    pub fn refresh_from<S: AsRef<str>>(&self, sink: &dyn UsageSink, names: &[S]) {
        for name in names {
            let name = name.as_ref();
            let records = sink.fetch_history(name);
            if records.is_empty() {
                continue;
            }
            debug!("[history] refreshing {name} from {} record(s)", records.len());
            for record in records {
                self.record(name, record.duration, record.success);
            }
        }
    }

    /// Copy of the whole table.
    pub fn snapshot(&self) -> HashMap<String, ToolStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for PerformanceHistory {
    fn default() -> Self {
        Self::from_config(&SelectorConfig::default())
    }
}
