//! Tool abstraction and registry.
//!
//! The [`Tool`] trait defines the interface every capability unit
//! implements: a static [`ToolDescriptor`] (name, keywords, dependencies,
//! fallback, initial history) and an async `invoke` method. Tools are
//! collected into a [`ToolRegistry`] at startup; descriptors never change
//! afterwards, and the mutable performance record lives in
//! [`PerformanceHistory`](super::history::PerformanceHistory).

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::ContextEntry;

/// Boxed future returned by [`Tool::invoke`].
///
/// `Err` carries a human-readable failure reason; the orchestrator records
/// it as `FAILED`.
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, String>> + Send + 'a>>;

// ── Descriptor ─────────────────────────────────────────────────────

/// Static metadata describing a tool.
///
/// # Example
///
/// ```ignore
/// let descriptor = ToolDescriptor::new("refund_lookup")
///     .with_keywords(["refund", "order", "payment"])
///     .depends_on("order_lookup")
///     .with_fallback("human_handoff")
///     .with_history(0.9, Duration::from_millis(120));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    /// Unique tool name.
    pub name: String,
    /// Capability keywords matched against query keywords.
    pub keywords: Vec<String>,
    /// Tools that must reach SUCCESS before this one runs.
    pub dependencies: Vec<String>,
    /// Tool tried once if this one fails.
    pub fallback: Option<String>,
    /// Initial historical success rate in `[0, 1]`.
    pub success_rate: f64,
    /// Initial historical mean latency.
    pub mean_latency: Duration,
    /// Per-tool hard timeout. `None` uses the orchestrator default.
    pub timeout: Option<Duration>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keywords: Vec::new(),
            dependencies: Vec::new(),
            fallback: None,
            success_rate: 0.5,
            mean_latency: Duration::ZERO,
            timeout: None,
        }
    }

    /// Set the capability keywords (lowercased).
    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.keywords = keywords
            .into_iter()
            .map(|k| k.as_ref().to_lowercase())
            .collect();
        self
    }

    /// Add a prerequisite tool.
    pub fn depends_on(mut self, tool: impl Into<String>) -> Self {
        self.dependencies.push(tool.into());
        self
    }

    pub fn with_fallback(mut self, tool: impl Into<String>) -> Self {
        self.fallback = Some(tool.into());
        self
    }

    /// Set the initial history used before any outcome is recorded.
    pub fn with_history(mut self, success_rate: f64, mean_latency: Duration) -> Self {
        self.success_rate = success_rate.clamp(0.0, 1.0);
        self.mean_latency = mean_latency;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ── Invocation input ───────────────────────────────────────────────

/// What a tool receives when invoked.
#[derive(Debug, Clone, Default)]
pub struct ToolInput {
    pub query: String,
    /// Ranked context for the request.
    pub context: Arc<[ContextEntry]>,
    /// Outputs of this tool's successful prerequisites, keyed by tool name.
    pub upstream: HashMap<String, Value>,
}

impl ToolInput {
    pub fn new(query: impl Into<String>, context: Arc<[ContextEntry]>) -> Self {
        Self {
            query: query.into(),
            context,
            upstream: HashMap::new(),
        }
    }
}

// ── Tool trait ─────────────────────────────────────────────────────

/// A capability unit the dispatcher can select and invoke.
///
/// # Example
///
/// ```ignore
/// struct OrderLookup { client: OrdersClient, descriptor: ToolDescriptor }
///
/// impl Tool for OrderLookup {
///     fn descriptor(&self) -> &ToolDescriptor { &self.descriptor }
///
///     fn invoke(&self, input: ToolInput) -> ToolFuture<'_> {
///         Box::pin(async move {
///             let order = self.client.find(&input.query).await.map_err(|e| e.to_string())?;
///             Ok(serde_json::to_value(order).map_err(|e| e.to_string())?)
///         })
///     }
/// }
/// ```
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    /// Run the tool. Uses a boxed future so the trait stays dyn-compatible.
    fn invoke(&self, input: ToolInput) -> ToolFuture<'_>;

    fn name(&self) -> &str {
        &self.descriptor().name
    }
}

// ── FnTool ─────────────────────────────────────────────────────────

/// Type-erased async handler for [`FnTool`].
type ErasedToolHandler = Box<
    dyn Fn(ToolInput) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>
        + Send
        + Sync,
>;

/// A closure-based tool.
///
/// Use it for stateless tools; for tools holding clients or other shared
/// state, implement [`Tool`] on a struct.
///
/// ```ignore
/// let tool = FnTool::new(
///     ToolDescriptor::new("weather").with_keywords(["weather", "forecast"]),
///     |input: ToolInput| async move { Ok(json!({ "query": input.query })) },
/// );
/// ```
pub struct FnTool {
    descriptor: ToolDescriptor,
    handler: ErasedToolHandler,
}

impl FnTool {
    pub fn new<F, Fut>(descriptor: ToolDescriptor, handler: F) -> Self
    where
        F: Fn(ToolInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let erased = move |input: ToolInput| -> Pin<
            Box<dyn Future<Output = Result<Value, String>> + Send>,
        > { Box::pin(handler(input)) };
        Self {
            descriptor,
            handler: Box::new(erased),
        }
    }
}

impl Tool for FnTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    fn invoke(&self, input: ToolInput) -> ToolFuture<'_> {
        (self.handler)(input)
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.descriptor.name)
            .finish()
    }
}

// ── Registry ───────────────────────────────────────────────────────

/// The set of tools known to the dispatcher, in registration order.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.order)
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A tool registered under an existing name replaces it.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            warn!("[registry] tool {name} registered twice; keeping the later one");
        } else {
            debug!("[registry] registered {name}");
            self.order.push(name);
        }
    }

    /// Register a tool (builder pattern).
    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name).map(|t| t.descriptor())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool names in registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name).map(|t| t.descriptor()))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ── Results ────────────────────────────────────────────────────────

/// Terminal status of a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolStatus {
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl ToolStatus {
    pub fn is_success(self) -> bool {
        self == ToolStatus::Success
    }
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ToolStatus::Success => "SUCCESS",
            ToolStatus::Failed => "FAILED",
            ToolStatus::Timeout => "TIMEOUT",
            ToolStatus::Cancelled => "CANCELLED",
        })
    }
}

/// Outcome of one tool in a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool: String,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "crate::config::duration_ms", rename = "duration_ms")]
    pub duration: Duration,
    /// Fallback tool whose attempt produced the final status, if one ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

impl ToolResult {
    pub fn success(tool: impl Into<String>, output: Value, duration: Duration) -> Self {
        Self {
            tool: tool.into(),
            status: ToolStatus::Success,
            output: Some(output),
            error: None,
            duration,
            fallback: None,
        }
    }

    pub fn failed(tool: impl Into<String>, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            tool: tool.into(),
            status: ToolStatus::Failed,
            output: None,
            error: Some(error.into()),
            duration,
            fallback: None,
        }
    }

    pub fn timed_out(tool: impl Into<String>, limit: Duration, duration: Duration) -> Self {
        Self {
            tool: tool.into(),
            status: ToolStatus::Timeout,
            output: None,
            error: Some(format!(
                "timed out after {:.1}s",
                limit.as_secs_f64()
            )),
            duration,
            fallback: None,
        }
    }

    /// A tool that was never invoked, or whose execution was abandoned.
    pub fn cancelled(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            status: ToolStatus::Cancelled,
            output: None,
            error: Some(reason.into()),
            duration: Duration::ZERO,
            fallback: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo(name: &str) -> FnTool {
        FnTool::new(ToolDescriptor::new(name), |input: ToolInput| async move {
            Ok(json!({ "echo": input.query }))
        })
    }

    #[tokio::test]
    async fn fn_tool_invokes_handler() {
        let tool = echo("echo");
        let out = tool
            .invoke(ToolInput::new("hello", Arc::from(Vec::new())))
            .await
            .unwrap();
        assert_eq!(out, json!({ "echo": "hello" }));
        assert_eq!(tool.name(), "echo");
    }

    #[test]
    fn registry_keeps_registration_order() {
        let registry = ToolRegistry::new()
            .with(echo("b"))
            .with(echo("a"))
            .with(echo("c"));
        assert_eq!(registry.names(), ["b", "a", "c"]);
        assert_eq!(registry.len(), 3);
        assert!(registry.contains("a"));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn duplicate_registration_replaces() {
        let mut registry = ToolRegistry::new();
        registry.register(echo("a"));
        registry.register(FnTool::new(
            ToolDescriptor::new("a").with_keywords(["Second"]),
            |_input: ToolInput| async move { Ok(Value::Null) },
        ));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.descriptor("a").unwrap().keywords, ["second"]);
    }

    #[test]
    fn descriptor_builder() {
        let d = ToolDescriptor::new("refund")
            .with_keywords(["Refund", "ORDER"])
            .depends_on("order")
            .with_fallback("handoff")
            .with_history(1.5, Duration::from_millis(40))
            .with_timeout(Duration::from_secs(2));
        assert_eq!(d.keywords, ["refund", "order"]);
        assert_eq!(d.dependencies, ["order"]);
        assert_eq!(d.fallback.as_deref(), Some("handoff"));
        assert_eq!(d.success_rate, 1.0);
        assert_eq!(d.timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn result_serializes_status_and_millis() {
        let result = ToolResult::success("a", json!(1), Duration::from_millis(1500));
        let v = serde_json::to_value(&result).unwrap();
        assert_eq!(v["status"], "SUCCESS");
        assert_eq!(v["duration_ms"], 1500);
        assert!(v.get("error").is_none());
        assert_eq!(ToolStatus::Timeout.to_string(), "TIMEOUT");
    }
}
