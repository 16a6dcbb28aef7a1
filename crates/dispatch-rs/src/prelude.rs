//! Convenience re-exports for common `dispatch-rs` types.
//!
//! ```ignore
//! use dispatch_rs::prelude::*;
//! ```
//!
//! Covers building a [`Dispatcher`], defining tools, supplying context, and
//! observing events. Lower-level pieces (the cache, the breaker, dependency
//! layering) are left in their modules.

pub use std::sync::Arc;

// ── Pipeline ────────────────────────────────────────────────────────
pub use crate::config::DispatchConfig;
pub use crate::dispatcher::{DispatchOutcome, Dispatcher, DispatcherBuilder};
pub use crate::error::{ConfigError, DispatchError, SelectionError};

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::{
    FnTool, InMemoryUsageSink, Tool, ToolDescriptor, ToolFuture, ToolInput, ToolRegistry,
    ToolResult, ToolStatus, UsageSink,
};

// ── Context ─────────────────────────────────────────────────────────
pub use crate::context::{
    ContextEntry, ContextKind, ContextProvider, ProviderFuture, StaticContextProvider,
};

// ── Events ──────────────────────────────────────────────────────────
pub use crate::events::{
    CompositeEventHandler, DispatchEvent, EventHandler, FnEventHandler, LoggingHandler,
    NoopHandler,
};
