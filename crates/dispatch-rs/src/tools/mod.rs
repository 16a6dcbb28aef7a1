//! Tools: definition, scoring, and execution.
//!
//! # Implementing tools
//!
//! - **[`FnTool`]**: closure-based. Best for stateless tools.
//! - **Custom [`Tool`] impl**: for tools that own clients or other state.
//!
//! # Module overview
//!
//! - [`core`]: [`Tool`] trait, [`ToolDescriptor`], [`ToolRegistry`],
//!   [`FnTool`], [`ToolResult`]
//! - [`history`]: [`PerformanceHistory`] moving averages and the
//!   [`UsageSink`] seam
//! - [`selector`]: [`ToolSelector`] keyword/history scoring, context boost,
//!   threshold filtering
//! - [`dag`]: dependency layering
//! - [`orchestrator`]: [`ToolOrchestrator`] bounded layered execution with
//!   fallback

pub mod core;
pub mod dag;
pub mod history;
pub mod orchestrator;
pub mod selector;

pub use self::core::{
    FnTool, Tool, ToolDescriptor, ToolFuture, ToolInput, ToolRegistry, ToolResult, ToolStatus,
};
pub use history::{InMemoryUsageSink, PerformanceHistory, ToolStats, UsageRecord, UsageSink};
pub use orchestrator::{ExecutionPlan, ExecutionReport, ToolOrchestrator};
pub use selector::{ScoreFactors, ToolRecommendation, ToolSelector, filter_by_threshold};
