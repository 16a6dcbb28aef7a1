//! Dependency-aware, bounded, fault-isolated tool execution.
//!
//! The orchestrator turns recommendations into an [`ExecutionPlan`] of
//! dependency layers and runs it:
//!
//! 1. Layers run in order; tools within a layer run concurrently, bounded
//!    by a semaphore of `max_concurrent_operations` permits. Each layer is
//!    a `join_all` barrier.
//! 2. Every invocation runs inside a [`ResourceMonitor`] execution with the
//!    tool's hard timeout. Panics are caught and recorded as `FAILED`.
//! 3. A `FAILED` tool with a declared fallback gets exactly one fallback
//!    attempt. Timeouts are never retried.
//! 4. Tools whose prerequisites did not succeed, and tools whose circuit is
//!    open, are `CANCELLED` without being invoked.
//! 5. When the monitor refuses an execution (in-flight limit), the rest of
//!    the request is cancelled and the report is marked degraded. Siblings
//!    in the same layer that have not been admitted yet are cancelled too.
//!
//! Per-tool state machine: `PENDING -> RUNNING -> {SUCCESS | FAILED |
//! TIMEOUT | CANCELLED}`, or `PENDING -> CANCELLED` for skipped tools.
//! Results come back in plan order regardless of completion order, and
//! every real attempt is fed back into the performance history.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::core::{Tool, ToolInput, ToolRegistry, ToolResult, ToolStatus};
use super::dag::{self, PlanNode};
use super::history::{PerformanceHistory, UsageSink};
use super::selector::{ToolRecommendation, ToolSelector};
use crate::config::OrchestratorConfig;
use crate::context::ContextEntry;
use crate::error::{ResourceExhausted, SelectionError, ToolExecutionError};
use crate::events::{DispatchEvent, EventHandler, NoopHandler};
use crate::monitor::{ExecutionOutcome, ResourceMonitor};

/// Which tools to run and in what order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionPlan {
    /// Recommendations that passed selection, best first.
    pub recommendations: Vec<ToolRecommendation>,
    /// Unrecommended prerequisites added so dependents can run.
    pub prerequisites: Vec<String>,
    /// Dependency layers; each runs after the previous one completes.
    pub layers: Vec<Vec<String>>,
    /// Whether a dependency cycle forced sequential execution.
    pub sequential_fallback: bool,
}

impl ExecutionPlan {
    /// Tool names in plan order: recommendations, then pulled-in prerequisites.
    pub fn tool_names(&self) -> Vec<String> {
        self.recommendations
            .iter()
            .map(|r| r.tool.clone())
            .chain(self.prerequisites.iter().cloned())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// Aggregated outcome of executing a plan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    /// One result per planned tool, in plan order.
    pub results: Vec<ToolResult>,
    /// The request hit the in-flight limit and its remaining tools were
    /// cancelled.
    pub degraded: bool,
    #[serde(with = "crate::config::duration_ms", rename = "duration_ms")]
    pub duration: Duration,
}

impl ExecutionReport {
    /// Whether any planned tool did not succeed.
    pub fn partial_failure(&self) -> bool {
        self.results.iter().any(|r| !r.is_success())
    }

    /// Names of the tools that succeeded, in plan order.
    pub fn tools_used(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| r.is_success())
            .map(|r| r.tool.clone())
            .collect()
    }

    pub fn result(&self, tool: &str) -> Option<&ToolResult> {
        self.results.iter().find(|r| r.tool == tool)
    }
}

const DEGRADED_REASON: &str = "request degraded: resource exhausted";

/// Lifecycle of one planned tool within a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolState {
    Pending,
    Running,
    Done(ToolStatus),
}

impl ToolState {
    fn can_transition_to(self, next: ToolState) -> bool {
        matches!(
            (self, next),
            (ToolState::Pending, ToolState::Running)
                | (ToolState::Pending, ToolState::Done(ToolStatus::Cancelled))
                | (ToolState::Running, ToolState::Done(_))
        )
    }
}

#[derive(Debug, Default)]
struct StateTable(HashMap<String, ToolState>);

impl StateTable {
    fn new(names: &[String]) -> Self {
        Self(
            names
                .iter()
                .map(|n| (n.clone(), ToolState::Pending))
                .collect(),
        )
    }

    fn transition(&mut self, tool: &str, next: ToolState) {
        let current = self.0.get(tool).copied().unwrap_or(ToolState::Pending);
        if current.can_transition_to(next) {
            self.0.insert(tool.to_string(), next);
        } else {
            warn!("[plan] ignoring invalid transition for {tool}: {current:?} -> {next:?}");
        }
    }
}

/// One real invocation, fed back to the history afterwards.
#[derive(Debug, Clone)]
struct Attempt {
    tool: String,
    duration: Duration,
    success: bool,
}

/// Everything one planned tool produced, fallback included.
#[derive(Debug)]
struct ToolRun {
    result: ToolResult,
    attempts: Vec<Attempt>,
    exhausted: bool,
}

pub struct ToolOrchestrator {
    registry: Arc<ToolRegistry>,
    selector: Arc<ToolSelector>,
    monitor: Arc<ResourceMonitor>,
    history: Arc<PerformanceHistory>,
    usage_sink: Option<Arc<dyn UsageSink>>,
    events: Arc<dyn EventHandler>,
    semaphore: Arc<Semaphore>,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for ToolOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolOrchestrator")
            .field("tools", &self.registry.names())
            .field("config", &self.config)
            .field("available_permits", &self.semaphore.available_permits())
            .finish()
    }
}

impl ToolOrchestrator {
    pub fn new(
        registry: Arc<ToolRegistry>,
        selector: Arc<ToolSelector>,
        monitor: Arc<ResourceMonitor>,
        history: Arc<PerformanceHistory>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            selector,
            monitor,
            history,
            usage_sink: None,
            events: Arc::new(NoopHandler),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_operations.max(1))),
            config,
        }
    }

    /// Also report every attempt to an external sink.
    pub fn with_usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage_sink = Some(sink);
        self
    }

    pub fn with_event_handler(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // ── Planning ───────────────────────────────────────────────────

    /// Recommend tools for `query` and lay them out in dependency layers.
    pub fn select_tools(
        &self,
        query: &str,
        context: &[ContextEntry],
    ) -> Result<ExecutionPlan, SelectionError> {
        let recommendations = self.selector.recommend(query, context)?;
        let mut names: Vec<String> = recommendations.iter().map(|r| r.tool.clone()).collect();

        // Pull in registered prerequisites, transitively, in discovery order.
        let mut prerequisites = Vec::new();
        let mut seen: HashSet<String> = names.iter().cloned().collect();
        let mut cursor = 0;
        while cursor < names.len() {
            let Some(descriptor) = self.registry.descriptor(&names[cursor]) else {
                cursor += 1;
                continue;
            };
            for dep in &descriptor.dependencies {
                if seen.contains(dep) {
                    continue;
                }
                if self.registry.contains(dep) {
                    debug!(
                        "[plan] pulling in prerequisite {dep} for {}",
                        descriptor.name
                    );
                    seen.insert(dep.clone());
                    prerequisites.push(dep.clone());
                    names.push(dep.clone());
                } else {
                    warn!(
                        "[plan] {} depends on unregistered tool {dep}; ignoring",
                        descriptor.name
                    );
                    seen.insert(dep.clone());
                }
            }
            cursor += 1;
        }

        let (layers, sequential_fallback) = self.layers_for(&names);
        self.events
            .on_event(&DispatchEvent::PlanReady { layers: &layers });
        Ok(ExecutionPlan {
            recommendations,
            prerequisites,
            layers,
            sequential_fallback,
        })
    }

    /// Layer `names` by their declared dependencies. Unknown names get a
    /// layer slot like any other tool so they can be reported.
    fn layers_for(&self, names: &[String]) -> (Vec<Vec<String>>, bool) {
        let nodes: Vec<PlanNode> = names
            .iter()
            .map(|name| {
                let deps = self
                    .registry
                    .descriptor(name)
                    .map(|d| d.dependencies.clone())
                    .unwrap_or_default();
                PlanNode::new(name.clone(), deps)
            })
            .collect();
        match dag::build_layers(&nodes) {
            Ok(layers) => (layers, false),
            Err(cycle) => {
                warn!("[plan] {cycle}; executing sequentially");
                (dag::sequential_layers(&nodes), true)
            }
        }
    }

    // ── Execution ──────────────────────────────────────────────────

    /// Execute `tool_names` for `query`. Results are in `tool_names` order.
    pub async fn execute_tools(
        &self,
        tool_names: &[String],
        query: &str,
        context: &[ContextEntry],
    ) -> ExecutionReport {
        let mut names: Vec<String> = Vec::with_capacity(tool_names.len());
        for name in tool_names {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        let (layers, _) = self.layers_for(&names);
        self.run_layers(&names, &layers, query, context).await
    }

    /// Execute a plan produced by [`select_tools`](Self::select_tools).
    pub async fn execute_plan(
        &self,
        plan: &ExecutionPlan,
        query: &str,
        context: &[ContextEntry],
    ) -> ExecutionReport {
        self.run_layers(&plan.tool_names(), &plan.layers, query, context)
            .await
    }

    async fn run_layers(
        &self,
        order: &[String],
        layers: &[Vec<String>],
        query: &str,
        context: &[ContextEntry],
    ) -> ExecutionReport {
        let started = Instant::now();
        let context: Arc<[ContextEntry]> = Arc::from(context);
        let mut states = StateTable::new(order);
        let mut results: HashMap<String, ToolResult> = HashMap::new();
        let mut attempts: Vec<Attempt> = Vec::new();
        let mut degraded = false;
        let abort = AtomicBool::new(false);

        for (index, layer) in layers.iter().enumerate() {
            if degraded {
                for name in layer {
                    states.transition(name, ToolState::Done(ToolStatus::Cancelled));
                    results.insert(
                        name.clone(),
                        ToolResult::cancelled(name, DEGRADED_REASON),
                    );
                }
                continue;
            }
            self.events.on_event(&DispatchEvent::LayerStarted {
                index,
                tools: layer,
            });

            let mut runnable: Vec<(Arc<dyn Tool>, ToolInput)> = Vec::new();
            for name in layer {
                match self.prepare(name, query, &context, &results) {
                    Ok((tool, input)) => {
                        states.transition(name, ToolState::Running);
                        runnable.push((tool, input));
                    }
                    Err(skipped) => {
                        debug!(
                            "[tool] {name} skipped: {}",
                            skipped.error.as_deref().unwrap_or("cancelled")
                        );
                        states.transition(name, ToolState::Done(skipped.status));
                        self.events.on_event(&DispatchEvent::ToolFinished {
                            name,
                            status: skipped.status,
                            duration: Duration::ZERO,
                        });
                        results.insert(name.clone(), skipped);
                    }
                }
            }

            let runs = join_all(
                runnable
                    .into_iter()
                    .map(|(tool, input)| self.run_tool(tool, input, &abort)),
            )
            .await;

            for run in runs {
                if run.exhausted && !degraded {
                    degraded = true;
                    self.events.on_event(&DispatchEvent::RequestDegraded {
                        reason: "in-flight execution limit reached",
                    });
                }
                states.transition(&run.result.tool, ToolState::Done(run.result.status));
                attempts.extend(run.attempts);
                results.insert(run.result.tool.clone(), run.result);
            }
        }

        self.record_attempts(&attempts);

        let results = order
            .iter()
            .map(|name| {
                results
                    .remove(name)
                    .unwrap_or_else(|| ToolResult::cancelled(name, "not scheduled"))
            })
            .collect();
        let report = ExecutionReport {
            results,
            degraded,
            duration: started.elapsed(),
        };
        info!(
            "[plan] {} tool(s) finished in {:.0}ms: {} succeeded{}",
            report.results.len(),
            report.duration.as_secs_f64() * 1000.0,
            report.tools_used().len(),
            if report.degraded { " (degraded)" } else { "" }
        );
        report
    }

    /// Resolve a tool and build its input, or explain why it must be
    /// skipped.
    fn prepare(
        &self,
        name: &str,
        query: &str,
        context: &Arc<[ContextEntry]>,
        finished: &HashMap<String, ToolResult>,
    ) -> Result<(Arc<dyn Tool>, ToolInput), ToolResult> {
        let Some(tool) = self.registry.get(name) else {
            return Err(ToolResult::cancelled(name, format!("unknown tool '{name}'")));
        };

        let mut input = ToolInput::new(query, Arc::clone(context));
        for dep in &tool.descriptor().dependencies {
            // Prerequisites outside the plan (or later in a sequential
            // fallback) have no result yet and don't gate the tool.
            let Some(result) = finished.get(dep) else {
                continue;
            };
            if !result.is_success() {
                return Err(ToolResult::cancelled(
                    name,
                    format!("prerequisite {dep} did not succeed ({})", result.status),
                ));
            }
            if let Some(output) = &result.output {
                input.upstream.insert(dep.clone(), output.clone());
            }
        }

        if self.monitor.is_circuit_open(name) {
            return Err(ToolResult::cancelled(name, "circuit open"));
        }
        Ok((Arc::clone(tool), input))
    }

    /// Run one planned tool, plus its fallback if it fails.
    async fn run_tool(&self, tool: Arc<dyn Tool>, input: ToolInput, abort: &AtomicBool) -> ToolRun {
        let name = tool.name().to_string();
        let primary = match self.attempt(&tool, input.clone(), abort).await {
            Ok(result) => result,
            Err(exhausted) => {
                warn!("[tool] {name} not started: {exhausted}");
                return ToolRun {
                    result: ToolResult::cancelled(&name, exhausted.to_string()),
                    attempts: Vec::new(),
                    exhausted: true,
                };
            }
        };

        let mut attempts = Vec::new();
        if primary.status != ToolStatus::Cancelled {
            attempts.push(Attempt {
                tool: name.clone(),
                duration: primary.duration,
                success: primary.is_success(),
            });
        }

        if primary.status != ToolStatus::Failed || abort.load(Ordering::SeqCst) {
            return ToolRun {
                result: primary,
                attempts,
                exhausted: false,
            };
        }

        let Some(fallback_tool) = self.fallback_for(&tool) else {
            return ToolRun {
                result: primary,
                attempts,
                exhausted: false,
            };
        };
        let fallback_name = fallback_tool.name().to_string();
        self.events.on_event(&DispatchEvent::FallbackAttempt {
            tool: &name,
            fallback: &fallback_name,
        });

        // The fallback's own fallback is never consulted.
        match self.attempt(&fallback_tool, input, abort).await {
            Ok(secondary) => {
                if secondary.status != ToolStatus::Cancelled {
                    attempts.push(Attempt {
                        tool: fallback_name.clone(),
                        duration: secondary.duration,
                        success: secondary.is_success(),
                    });
                }
                let error = secondary.error.map(|e| {
                    format!(
                        "{}; fallback {fallback_name}: {e}",
                        primary.error.as_deref().unwrap_or("failed")
                    )
                });
                ToolRun {
                    result: ToolResult {
                        tool: name,
                        status: secondary.status,
                        output: secondary.output,
                        error,
                        duration: primary.duration + secondary.duration,
                        fallback: Some(fallback_name),
                    },
                    attempts,
                    exhausted: false,
                }
            }
            Err(exhausted) => {
                warn!("[tool] fallback {fallback_name} for {name} not started: {exhausted}");
                ToolRun {
                    result: primary,
                    attempts,
                    exhausted: true,
                }
            }
        }
    }

    fn fallback_for(&self, tool: &Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        let name = tool.name();
        let fallback = tool.descriptor().fallback.as_deref()?;
        if fallback == name {
            return None;
        }
        let Some(candidate) = self.registry.get(fallback) else {
            warn!("[tool] {name} declares unregistered fallback {fallback}");
            return None;
        };
        if self.monitor.is_circuit_open(fallback) {
            debug!("[tool] fallback {fallback} for {name} skipped: circuit open");
            return None;
        }
        Some(Arc::clone(candidate))
    }

    /// A single monitored invocation. A refusal from the monitor raises
    /// `abort`, and once raised no further attempt of the request is
    /// admitted.
    async fn attempt(
        &self,
        tool: &Arc<dyn Tool>,
        input: ToolInput,
        abort: &AtomicBool,
    ) -> Result<ToolResult, ResourceExhausted> {
        let name = tool.name();
        let timeout = tool
            .descriptor()
            .timeout
            .unwrap_or(self.config.default_timeout);

        let Ok(_permit) = self.semaphore.acquire().await else {
            return Ok(ToolResult::cancelled(name, "orchestrator shut down"));
        };
        if abort.load(Ordering::SeqCst) {
            return Ok(ToolResult::cancelled(name, DEGRADED_REASON));
        }
        let handle = match self.monitor.monitor_tool_execution(name, timeout) {
            Ok(handle) => handle,
            Err(exhausted) => {
                abort.store(true, Ordering::SeqCst);
                return Err(exhausted);
            }
        };

        self.events.on_event(&DispatchEvent::ToolStarted { name });
        let started = Instant::now();
        // Built lazily so a panic while creating the future is caught too.
        let invocation = AssertUnwindSafe(async move { tool.invoke(input).await }).catch_unwind();
        let outcome = handle
            .run(async move {
                match invocation.await {
                    Ok(result) => result.map_err(ToolExecutionError::Failed),
                    Err(panic) => Err(ToolExecutionError::Panicked(panic_message(panic))),
                }
            })
            .await;
        let duration = started.elapsed();

        let result = match outcome {
            ExecutionOutcome::Completed(output) => {
                trace!("[tool] {name} output preview: {}", preview(&output));
                ToolResult::success(name, output, duration)
            }
            ExecutionOutcome::Failed(error) => {
                warn!("[tool] {name} failed: {error}");
                ToolResult::failed(name, error.to_string(), duration)
            }
            ExecutionOutcome::TimedOut(limit) => ToolResult::timed_out(name, limit, duration),
            ExecutionOutcome::Cancelled => ToolResult::cancelled(name, "cancelled"),
        };
        self.events.on_event(&DispatchEvent::ToolFinished {
            name,
            status: result.status,
            duration,
        });
        Ok(result)
    }

    fn record_attempts(&self, attempts: &[Attempt]) {
        for attempt in attempts {
            self.history
                .record(&attempt.tool, attempt.duration, attempt.success);
            if let Some(sink) = &self.usage_sink {
                sink.record_usage(&attempt.tool, attempt.duration, attempt.success);
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn preview(value: &Value) -> String {
    const MAX_CHARS: usize = 300;
    let text = value.to_string();
    if text.chars().count() <= MAX_CHARS {
        return text;
    }
    let mut cut: String = text.chars().take(MAX_CHARS).collect();
    cut.push_str("...");
    cut
}
