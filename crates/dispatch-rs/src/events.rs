//! Events and handlers for observing a dispatch.
//!
//! The orchestrator, retriever, and monitor report what they decided through
//! [`DispatchEvent`] variants. Callers implement [`EventHandler`] to observe
//! them for logging, metrics, or UI updates. Handlers are informational only;
//! they cannot change the outcome of a dispatch.
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget dispatches |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::tools::ToolStatus;

// ── Events ─────────────────────────────────────────────────────────

/// Events emitted during a dispatch.
#[derive(Debug)]
pub enum DispatchEvent<'a> {
    /// Context retrieval finished for a query.
    ContextRetrieved { entries: usize, cache_hit: bool },
    /// A context provider contributed nothing because of an error.
    ProviderFailed { source_id: &'a str, error: &'a str },
    /// The execution plan was computed.
    PlanReady { layers: &'a [Vec<String>] },
    /// A dependency layer is about to start.
    LayerStarted { index: usize, tools: &'a [String] },
    /// A tool invocation transitioned to RUNNING.
    ToolStarted { name: &'a str },
    /// A tool invocation reached a terminal state.
    ToolFinished {
        name: &'a str,
        status: ToolStatus,
        duration: Duration,
    },
    /// A failed tool is handing over to its declared fallback.
    FallbackAttempt { tool: &'a str, fallback: &'a str },
    /// A tool passed its soft limit and is still running.
    SoftLimitExceeded {
        name: &'a str,
        elapsed: Duration,
        hard_limit: Duration,
    },
    /// A tool's circuit opened after repeated failures.
    CircuitOpened { name: &'a str, cooldown: Duration },
    /// The remaining executions of a request were aborted.
    RequestDegraded { reason: &'a str },
}

/// Handler for dispatch events.
///
/// The default implementation ignores every event.
///
/// # Example
///
/// ```ignore
/// struct Metrics;
///
/// impl EventHandler for Metrics {
///     fn on_event(&self, event: &DispatchEvent<'_>) {
///         if let DispatchEvent::ToolFinished { name, duration, .. } = event {
///             record_histogram(name, *duration);
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &DispatchEvent<'_>) {
        let _ = event;
    }
}

/// A handler that ignores every event.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if let DispatchEvent::CircuitOpened { name, .. } = event {
///         alert(name);
///     }
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&DispatchEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&DispatchEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&DispatchEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &DispatchEvent<'_>) {
        (self.0)(event)
    }
}

/// An event handler that forwards every event to multiple inner handlers,
/// in registration order.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with(metrics_handler);
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add a handler to the chain.
    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &DispatchEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// Logs every event through `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &DispatchEvent<'_>) {
        match event {
            DispatchEvent::ContextRetrieved { entries, cache_hit } => {
                debug!("[context] {entries} entries (cache hit: {cache_hit})");
            }
            DispatchEvent::ProviderFailed { source_id, error } => {
                warn!("[context] provider {source_id} contributed nothing: {error}");
            }
            DispatchEvent::PlanReady { layers } => {
                info!("[plan] {} layer(s): {:?}", layers.len(), layers);
            }
            DispatchEvent::LayerStarted { index, tools } => {
                debug!("[plan] layer {index} starting: {}", tools.join(", "));
            }
            DispatchEvent::ToolStarted { name } => {
                debug!("[tool] {name} running");
            }
            DispatchEvent::ToolFinished {
                name,
                status,
                duration,
            } => {
                info!(
                    "[tool] {name} -> {status} in {:.0}ms",
                    duration.as_secs_f64() * 1000.0
                );
            }
            DispatchEvent::FallbackAttempt { tool, fallback } => {
                info!("[tool] {tool} failed, trying fallback {fallback}");
            }
            DispatchEvent::SoftLimitExceeded {
                name,
                elapsed,
                hard_limit,
            } => {
                warn!(
                    "[tool] {name} passed its soft limit ({:.1}s of {:.1}s)",
                    elapsed.as_secs_f64(),
                    hard_limit.as_secs_f64()
                );
            }
            DispatchEvent::CircuitOpened { name, cooldown } => {
                warn!(
                    "[breaker] circuit for {name} opened for {:.0}s",
                    cooldown.as_secs_f64()
                );
            }
            DispatchEvent::RequestDegraded { reason } => {
                warn!("[plan] request degraded: {reason}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fn_handler_receives_events() {
        let seen = Mutex::new(Vec::new());
        let handler = FnEventHandler::new(|event| {
            if let DispatchEvent::ToolStarted { name } = event {
                seen.lock().unwrap().push(name.to_string());
            }
        });
        handler.on_event(&DispatchEvent::ToolStarted { name: "billing" });
        handler.on_event(&DispatchEvent::ContextRetrieved {
            entries: 2,
            cache_hit: false,
        });
        assert_eq!(*seen.lock().unwrap(), vec!["billing".to_string()]);
    }

    #[test]
    fn composite_forwards_to_all() {
        static COUNT: AtomicUsize = AtomicUsize::new(0);
        let handler = CompositeEventHandler::new()
            .with(FnEventHandler::new(|_| {
                COUNT.fetch_add(1, Ordering::SeqCst);
            }))
            .with(FnEventHandler::new(|_| {
                COUNT.fetch_add(1, Ordering::SeqCst);
            }))
            .with(LoggingHandler);
        handler.on_event(&DispatchEvent::RequestDegraded { reason: "test" });
        assert_eq!(COUNT.load(Ordering::SeqCst), 2);
    }
}
