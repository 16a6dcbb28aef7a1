//! The composition root: one request in, one outcome out.
//!
//! [`Dispatcher`] owns the shared cache, monitor, and history, wires them
//! into the selector, retriever, and orchestrator, and runs the request
//! pipeline:
//!
//! ```text
//! query -> context retrieval -> compression -> selection -> execution -> outcome
//! ```
//!
//! ```ignore
//! let dispatcher = Dispatcher::builder(DispatchConfig::default())
//!     .tool(order_lookup)
//!     .tool(refund)
//!     .provider(Arc::new(history_provider))
//!     .event_handler(Arc::new(LoggingHandler))
//!     .build()?;
//!
//! let outcome = dispatcher.process("where is my refund?", "user-1", "session-9").await?;
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::PerformanceCache;
use crate::config::DispatchConfig;
use crate::context::{ContextEntry, ContextProvider, ContextRetriever};
use crate::error::{ConfigError, DispatchError};
use crate::events::{EventHandler, NoopHandler};
use crate::monitor::ResourceMonitor;
use crate::tools::{
    ExecutionPlan, ExecutionReport, PerformanceHistory, Tool, ToolOrchestrator, ToolRegistry,
    ToolResult, ToolSelector, UsageSink,
};

/// What the caller gets back for a query.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub query: String,
    pub session_id: String,
    /// One result per planned tool, in plan order.
    pub tool_results: Vec<ToolResult>,
    /// Tools that succeeded.
    pub tools_used: Vec<String>,
    /// Context used for the request, best first.
    pub context: Vec<ContextEntry>,
    /// Distinct context sources, in rank order.
    pub sources: Vec<String>,
    /// Share of the recommended score mass whose tools succeeded, in `[0, 1]`.
    pub confidence_score: f64,
    /// The in-flight limit cut the request short.
    pub degraded: bool,
    /// At least one planned tool did not succeed.
    pub partial_failure: bool,
}

impl DispatchOutcome {
    fn assemble(
        query: &str,
        session_id: &str,
        context: Vec<ContextEntry>,
        plan: &ExecutionPlan,
        report: ExecutionReport,
    ) -> Self {
        let total: f64 = plan.recommendations.iter().map(|r| r.score).sum();
        let succeeded: f64 = plan
            .recommendations
            .iter()
            .filter(|r| report.result(&r.tool).is_some_and(ToolResult::is_success))
            .map(|r| r.score)
            .sum();
        let confidence_score = if total > 0.0 {
            (succeeded / total).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let mut seen = HashSet::new();
        let sources = context
            .iter()
            .filter(|e| seen.insert(e.source_id.as_str()))
            .map(|e| e.source_id.clone())
            .collect();

        Self {
            query: query.to_string(),
            session_id: session_id.to_string(),
            tools_used: report.tools_used(),
            partial_failure: report.partial_failure(),
            degraded: report.degraded,
            tool_results: report.results,
            context,
            sources,
            confidence_score,
        }
    }
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    config: DispatchConfig,
    registry: ToolRegistry,
    providers: Vec<Arc<dyn ContextProvider>>,
    usage_sink: Option<Arc<dyn UsageSink>>,
    events: Arc<dyn EventHandler>,
}

impl DispatcherBuilder {
    /// Register a tool.
    pub fn tool(mut self, tool: impl Tool + 'static) -> Self {
        self.registry.register(tool);
        self
    }

    /// Use a prebuilt registry, replacing any tools added so far.
    pub fn registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Seed tool history from `sink` and report every attempt to it.
    pub fn usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage_sink = Some(sink);
        self
    }

    pub fn event_handler(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = events;
        self
    }

    /// Validate the configuration and wire the components.
    pub fn build(self) -> Result<Dispatcher, ConfigError> {
        self.config.validate()?;
        let config = self.config;

        let cache = Arc::new(PerformanceCache::new(config.cache.clone()));
        let monitor = Arc::new(
            ResourceMonitor::new(config.monitor.clone()).with_event_handler(Arc::clone(&self.events)),
        );
        let history = Arc::new(PerformanceHistory::from_config(&config.selector));
        for descriptor in self.registry.descriptors() {
            history.seed(descriptor);
        }
        if let Some(sink) = &self.usage_sink {
            history.refresh_from(sink.as_ref(), self.registry.names());
        }

        let registry = Arc::new(self.registry);
        let selector = Arc::new(ToolSelector::new(
            Arc::clone(&registry),
            Arc::clone(&history),
            Arc::clone(&monitor),
            config.selector.clone(),
        ));

        let mut orchestrator = ToolOrchestrator::new(
            Arc::clone(&registry),
            selector,
            Arc::clone(&monitor),
            Arc::clone(&history),
            config.orchestrator.clone(),
        )
        .with_event_handler(Arc::clone(&self.events));
        if let Some(sink) = self.usage_sink {
            orchestrator = orchestrator.with_usage_sink(sink);
        }

        let retriever = self.providers.into_iter().fold(
            ContextRetriever::new(Arc::clone(&cache), config.retriever.clone())
                .with_event_handler(Arc::clone(&self.events)),
            ContextRetriever::with_provider,
        );

        info!(
            "[dispatch] ready with {} tool(s), {} provider(s)",
            registry.len(),
            retriever.provider_count()
        );
        Ok(Dispatcher {
            config,
            cache,
            monitor,
            history,
            registry,
            retriever,
            orchestrator,
        })
    }
}

pub struct Dispatcher {
    config: DispatchConfig,
    cache: Arc<PerformanceCache>,
    monitor: Arc<ResourceMonitor>,
    history: Arc<PerformanceHistory>,
    registry: Arc<ToolRegistry>,
    retriever: ContextRetriever,
    orchestrator: ToolOrchestrator,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("retriever", &self.retriever)
            .field("monitor", &self.monitor)
            .finish()
    }
}

impl Dispatcher {
    pub fn builder(config: DispatchConfig) -> DispatcherBuilder {
        DispatcherBuilder {
            config,
            registry: ToolRegistry::new(),
            providers: Vec::new(),
            usage_sink: None,
            events: Arc::new(NoopHandler),
        }
    }

    /// Answer `query` for `user_id`: retrieve context, select tools, run
    /// them, and assemble the outcome.
    ///
    /// Tool and provider failures are absorbed into the outcome. Only a
    /// missing tool registry is an error.
    pub async fn process(
        &self,
        query: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        info!("[dispatch] session {session_id}: processing query for {user_id}");
        let retrieved = self
            .retriever
            .get_relevant_context(query, user_id, self.config.retriever.default_limit)
            .await;
        let context = self
            .retriever
            .compress_context_window(&retrieved, self.config.retriever.window_size);

        let plan = self.orchestrator.select_tools(query, &context)?;
        let report = self.orchestrator.execute_plan(&plan, query, &context).await;

        let outcome = DispatchOutcome::assemble(query, session_id, context, &plan, report);
        info!(
            "[dispatch] session {session_id}: {} tool(s) used, confidence {:.2}{}",
            outcome.tools_used.len(),
            outcome.confidence_score,
            if outcome.degraded { ", degraded" } else { "" }
        );
        Ok(outcome)
    }

    /// Report how useful the context of an answered query turned out to be.
    pub fn track_context_usage(&self, entries: &mut [ContextEntry], observed: f64) {
        self.retriever.track_context_usage(entries, observed);
    }

    /// Start the periodic cache sweep. Must be called inside a tokio runtime.
    pub fn spawn_cache_sweeper(&self) -> JoinHandle<()> {
        self.cache.spawn_sweeper()
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<PerformanceCache> {
        &self.cache
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn history(&self) -> &Arc<PerformanceHistory> {
        &self.history
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }
}
