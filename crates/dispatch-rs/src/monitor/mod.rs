//! Resource monitoring: scoped executions, timeouts, and circuit breaking.
//!
//! [`ResourceMonitor::monitor_tool_execution`] admits an execution (subject
//! to the system-wide in-flight cap) and returns an [`ExecutionHandle`]. The
//! handle's [`run`](ExecutionHandle::run) drives the wrapped future under a
//! soft limit (warning event), a hard limit (the future is dropped and the
//! outcome is `TimedOut`), and external cancellation. Each handle records
//! exactly one terminal outcome; a handle dropped without running counts as
//! cancelled.
//!
//! Outcomes feed the per-tool [`CircuitBreaker`].

pub mod breaker;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use breaker::{CircuitBreaker, CircuitState};

use crate::config::MonitorConfig;
use crate::error::ResourceExhausted;
use crate::events::{DispatchEvent, EventHandler, NoopHandler};
use crate::tools::ToolStatus;

/// Cumulative counters at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceSnapshot {
    pub in_flight: usize,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
}

/// What a monitored execution knew when it was admitted.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub tool_name: String,
    pub started_at: Instant,
    pub deadline: Instant,
    pub timeout: Duration,
    /// Counters at entry (before this execution was counted as in flight).
    pub snapshot: ResourceSnapshot,
}

/// Terminal outcome of a monitored execution.
#[derive(Debug)]
pub enum ExecutionOutcome<T, E> {
    /// The future finished with `Ok`.
    Completed(T),
    /// The future finished with `Err`.
    Failed(E),
    /// The hard limit elapsed; the future was dropped.
    TimedOut(Duration),
    /// The execution was cancelled externally.
    Cancelled,
}

impl<T, E> ExecutionOutcome<T, E> {
    pub fn status(&self) -> ToolStatus {
        match self {
            ExecutionOutcome::Completed(_) => ToolStatus::Success,
            ExecutionOutcome::Failed(_) => ToolStatus::Failed,
            ExecutionOutcome::TimedOut(_) => ToolStatus::Timeout,
            ExecutionOutcome::Cancelled => ToolStatus::Cancelled,
        }
    }
}

pub struct ResourceMonitor {
    config: MonitorConfig,
    in_flight: AtomicUsize,
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    breaker: CircuitBreaker,
    events: Arc<dyn EventHandler>,
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("snapshot", &self.snapshot())
            .field("open_circuits", &self.breaker.open_circuits())
            .finish()
    }
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            breaker: CircuitBreaker::from_config(&config),
            config,
            in_flight: AtomicUsize::new(0),
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            events: Arc::new(NoopHandler),
        }
    }

    /// Report soft-limit warnings and circuit openings to `events`.
    pub fn with_event_handler(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Whether `tool` is currently disabled by its circuit breaker.
    pub fn is_circuit_open(&self, tool: &str) -> bool {
        self.breaker.is_open(tool)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Admit a monitored execution of `name` with a hard `timeout`.
    ///
    /// Fails with [`ResourceExhausted`] when `max_in_flight` executions are
    /// already running.
    pub fn monitor_tool_execution(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<ExecutionHandle<'_>, ResourceExhausted> {
        let limit = self.config.max_in_flight;
        let snapshot = self.snapshot();
        loop {
            let current = self.in_flight.load(Ordering::SeqCst);
            if current >= limit {
                return Err(ResourceExhausted {
                    in_flight: current,
                    limit,
                });
            }
            if self
                .in_flight
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
        self.started.fetch_add(1, Ordering::Relaxed);

        let started_at = Instant::now();
        debug!(
            "[monitor] {name} admitted ({} in flight, timeout {:.1}s)",
            snapshot.in_flight + 1,
            timeout.as_secs_f64()
        );
        Ok(ExecutionHandle {
            monitor: self,
            context: ExecutionContext {
                tool_name: name.to_string(),
                started_at,
                deadline: started_at + timeout,
                timeout,
                snapshot,
            },
            cancel: CancellationToken::new(),
            finished: false,
        })
    }

    fn record_terminal(&self, name: &str, status: ToolStatus) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let counter = match status {
            ToolStatus::Success => &self.completed,
            ToolStatus::Failed => &self.failed,
            ToolStatus::Timeout => &self.timed_out,
            ToolStatus::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        match status {
            ToolStatus::Success => self.breaker.record_success(name),
            ToolStatus::Failed | ToolStatus::Timeout => {
                if self.breaker.record_failure(name) {
                    self.events.on_event(&DispatchEvent::CircuitOpened {
                        name,
                        cooldown: self.breaker.cooldown(),
                    });
                }
            }
            ToolStatus::Cancelled => {}
        }
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

/// A scoped, admitted execution. See the module docs.
pub struct ExecutionHandle<'m> {
    monitor: &'m ResourceMonitor,
    context: ExecutionContext,
    cancel: CancellationToken,
    finished: bool,
}

impl ExecutionHandle<'_> {
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Token that cancels this execution (and only this one) when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive `fut` to a terminal outcome under the soft and hard limits.
    pub async fn run<T, E, F>(mut self, fut: F) -> ExecutionOutcome<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let timeout = self.context.timeout;
        let soft_at = self.context.started_at
            + timeout.mul_f64(self.monitor.config.soft_limit_ratio.clamp(0.0, 1.0));
        let soft = tokio::time::sleep_until(soft_at);
        let hard = tokio::time::sleep_until(self.context.deadline);
        tokio::pin!(fut, soft, hard);

        let mut warned = false;
        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break ExecutionOutcome::Cancelled,
                result = &mut fut => break match result {
                    Ok(v) => ExecutionOutcome::Completed(v),
                    Err(e) => ExecutionOutcome::Failed(e),
                },
                _ = &mut hard => break ExecutionOutcome::TimedOut(timeout),
                _ = &mut soft, if !warned => {
                    warned = true;
                    self.monitor.events.on_event(&DispatchEvent::SoftLimitExceeded {
                        name: &self.context.tool_name,
                        elapsed: self.context.started_at.elapsed(),
                        hard_limit: timeout,
                    });
                }
            }
        };

        if let ExecutionOutcome::TimedOut(limit) = &outcome {
            info!(
                "[monitor] {} timed out after {:.1}s",
                self.context.tool_name,
                limit.as_secs_f64()
            );
        }
        self.finished = true;
        self.monitor
            .record_terminal(&self.context.tool_name, outcome.status());
        outcome
    }
}

impl Drop for ExecutionHandle<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                "[monitor] {} dropped before completion; recording as cancelled",
                self.context.tool_name
            );
            self.monitor
                .record_terminal(&self.context.tool_name, ToolStatus::Cancelled);
        }
    }
}
