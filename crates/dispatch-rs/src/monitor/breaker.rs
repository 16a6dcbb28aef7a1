//! Per-tool circuit breaker.
//!
//! A tool that fails (or times out) `threshold` times in a row, with every
//! failure inside the rolling `window`, has its circuit opened for
//! `cooldown`. While open, the selector scores the tool 0 and the
//! orchestrator skips it. Once the cool-down elapses the circuit closes with
//! a fresh streak.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::MonitorConfig;

/// Observable state of one tool's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { remaining: Duration },
}

#[derive(Debug, Default)]
struct BreakerState {
    /// Timestamps of the current streak of consecutive failures.
    failures: VecDeque<Instant>,
    open_until: Option<Instant>,
    trips: u32,
}

impl BreakerState {
    /// Close an open circuit whose cool-down has elapsed.
    fn refresh(&mut self, now: Instant) {
        if let Some(until) = self.open_until
            && now >= until
        {
            self.open_until = None;
            self.failures.clear();
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    window: Duration,
    cooldown: Duration,
    states: Mutex<HashMap<String, BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, window: Duration, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            cooldown,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &MonitorConfig) -> Self {
        Self::new(
            config.failure_threshold,
            config.failure_window,
            config.cooldown,
        )
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Whether the tool's circuit is currently open.
    pub fn is_open(&self, tool: &str) -> bool {
        matches!(self.state(tool), CircuitState::Open { .. })
    }

    pub fn state(&self, tool: &str) -> CircuitState {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let Some(state) = states.get_mut(tool) else {
            return CircuitState::Closed;
        };
        let now = Instant::now();
        state.refresh(now);
        match state.open_until {
            Some(until) => CircuitState::Open {
                remaining: until - now,
            },
            None => CircuitState::Closed,
        }
    }

    /// A success breaks the failure streak.
    pub fn record_success(&self, tool: &str) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = states.get_mut(tool) {
            state.refresh(Instant::now());
            state.failures.clear();
        }
    }

    /// Record a failure or timeout. Returns `true` when this failure opened
    /// the circuit.
    pub fn record_failure(&self, tool: &str) -> bool {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let state = states.entry(tool.to_string()).or_default();
        let now = Instant::now();
        state.refresh(now);
        if state.open_until.is_some() {
            return false;
        }

        while let Some(&oldest) = state.failures.front() {
            if now.duration_since(oldest) > self.window {
                state.failures.pop_front();
            } else {
                break;
            }
        }
        state.failures.push_back(now);
        debug!(
            "[breaker] {tool}: {} consecutive failure(s) in window",
            state.failures.len()
        );

        if state.failures.len() >= self.threshold as usize {
            state.open_until = Some(now + self.cooldown);
            state.failures.clear();
            state.trips += 1;
            warn!(
                "[breaker] opening circuit for {tool} for {:.0}s (trip #{})",
                self.cooldown.as_secs_f64(),
                state.trips
            );
            return true;
        }
        false
    }

    /// Force a tool's circuit closed and forget its streak.
    pub fn reset(&self, tool: &str) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.remove(tool);
    }

    /// Names of tools whose circuit is currently open, sorted.
    pub fn open_circuits(&self) -> Vec<String> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let mut open: Vec<String> = states
            .iter_mut()
            .filter_map(|(name, state)| {
                state.refresh(now);
                state.open_until.map(|_| name.clone())
            })
            .collect();
        open.sort();
        open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_secs(60), Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_consecutive_failures() {
        let b = breaker();
        assert!(!b.record_failure("search"));
        assert!(!b.record_failure("search"));
        assert!(b.record_failure("search"));
        assert!(b.is_open("search"));
        assert!(!b.is_open("other"));
        assert_eq!(b.open_circuits(), vec!["search".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn closes_after_cooldown() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure("search");
        }
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(matches!(
            b.state("search"),
            CircuitState::Open { remaining } if remaining == Duration::from_secs(1)
        ));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(b.state("search"), CircuitState::Closed);
        // Fresh streak after closing.
        assert!(!b.record_failure("search"));
        assert!(!b.is_open("search"));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_streak() {
        let b = breaker();
        b.record_failure("search");
        b.record_failure("search");
        b.record_success("search");
        assert!(!b.record_failure("search"));
        assert!(!b.record_failure("search"));
        assert!(!b.is_open("search"));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_outside_window_do_not_count() {
        let b = breaker();
        b.record_failure("search");
        b.record_failure("search");
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!b.record_failure("search"));
        assert!(!b.is_open("search"));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_closes_circuit() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure("search");
        }
        b.reset("search");
        assert!(!b.is_open("search"));
    }
}
