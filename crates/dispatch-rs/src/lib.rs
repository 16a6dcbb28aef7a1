//! Capability dispatch core for conversational assistants.
//!
//! `dispatch-rs` answers one question per request: given a user query and
//! what is known about the conversation, which registered capabilities
//! ("tools") should run, in what order, and with what context? The core
//! abstraction is the [`Dispatcher`](dispatcher::Dispatcher), which retrieves
//! and compresses context, scores the registered tools, executes the chosen
//! ones under concurrency and time limits, and reports the outcome.
//!
//! Everything the dispatcher needs (the cache, the resource monitor, the
//! performance history) is created from one [`DispatchConfig`](config::DispatchConfig)
//! with sensible defaults.
//!
//! # Getting started
//!
//! ```ignore
//! use dispatch_rs::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let order_lookup = FnTool::new(
//!         ToolDescriptor::new("order_lookup").with_keywords(["order", "status"]),
//!         |input: ToolInput| async move { Ok(json!({ "order": "A-1", "query": input.query })) },
//!     );
//!
//!     let dispatcher = Dispatcher::builder(DispatchConfig::default())
//!         .tool(order_lookup)
//!         .event_handler(Arc::new(LoggingHandler))
//!         .build()?;
//!
//!     let outcome = dispatcher.process("what is my order status", "user-1", "s-1").await?;
//!     println!("{}", serde_json::to_string_pretty(&outcome)?);
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Define tools:** see the [`Tool`](tools::core::Tool) trait,
//!   [`FnTool`](tools::core::FnTool) for closure-based tools, and
//!   [`ToolDescriptor`](tools::core::ToolDescriptor) for keywords,
//!   dependencies, fallbacks, and per-tool timeouts.
//!
//! - **Understand tool choice:** [`ToolSelector`](tools::selector::ToolSelector)
//!   blends keyword overlap with historical success and boosts tools
//!   mentioned by effective context. Scores and their factors are exposed as
//!   [`ToolRecommendation`](tools::selector::ToolRecommendation).
//!
//! - **Understand execution:** [`ToolOrchestrator`](tools::orchestrator::ToolOrchestrator)
//!   layers the plan by dependency, runs each layer concurrently under a
//!   semaphore, and falls back once per failed tool.
//!
//! - **Observe behavior:** implement [`EventHandler`](events::EventHandler), or
//!   use [`LoggingHandler`](events::LoggingHandler) for tracing-based logging.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`dispatcher`] | [`Dispatcher`](dispatcher::Dispatcher) request pipeline and builder |
//! | [`tools`] | Tool trait and registry, selection, history, dependency layering, orchestration |
//! | [`context`] | Context entries, providers, retrieval with ranking and caching, compression |
//! | [`cache`] | [`PerformanceCache`](cache::PerformanceCache): TTL + LRU, sharded by category |
//! | [`monitor`] | [`ResourceMonitor`](monitor::ResourceMonitor): in-flight limits, deadlines, circuit breaker |
//! | [`events`] | Dispatch events and handlers |
//! | [`config`] | Per-component configuration with JSON loading |
//! | [`error`] | Error types |

pub mod cache;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod monitor;
pub mod prelude;
pub mod tools;

pub use config::DispatchConfig;
pub use dispatcher::{DispatchOutcome, Dispatcher, DispatcherBuilder};
pub use error::DispatchError;
