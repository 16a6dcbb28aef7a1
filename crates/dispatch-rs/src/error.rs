//! Error taxonomy for the dispatch core.
//!
//! Every per-tool and per-provider failure is caught at its own boundary and
//! folded into a [`ToolResult`](crate::tools::ToolResult) or an empty context
//! contribution. Only [`SelectionError`] (no capability at all) escapes
//! [`Dispatcher::process`](crate::dispatcher::Dispatcher::process), and
//! [`ResourceExhausted`] degrades a single request without stopping the
//! process.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// A tool raised an error, panicked, or exceeded its hard timeout.
///
/// Recorded as `FAILED`/`TIMEOUT` on the tool's result. Never propagated
/// beyond the orchestrator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolExecutionError {
    #[error("tool failed: {0}")]
    Failed(String),

    #[error("tool timed out after {0:?}")]
    TimedOut(Duration),

    #[error("tool panicked: {0}")]
    Panicked(String),
}

/// A context provider could not contribute entries.
///
/// Logged and treated as an empty contribution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContextRetrievalError {
    #[error("provider '{0}' is unavailable")]
    Unavailable(String),

    #[error("provider '{source_id}' failed: {message}")]
    Failed { source_id: String, message: String },

    #[error("provider '{source_id}' timed out after {elapsed:?}")]
    TimedOut { source_id: String, elapsed: Duration },
}

/// A cached value could not be (de)serialized. Treated as a cache miss.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("failed to serialize value for {category}/{key}: {source}")]
    Serialize {
        category: String,
        key: String,
        source: serde_json::Error,
    },

    #[error("failed to deserialize value for {category}/{key}: {source}")]
    Deserialize {
        category: String,
        key: String,
        source: serde_json::Error,
    },
}

/// The system-wide in-flight execution limit was breached.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("resource exhausted: {in_flight} executions in flight (limit {limit})")]
pub struct ResourceExhausted {
    pub in_flight: usize,
    pub limit: usize,
}

/// No tool registry is available to answer the query.
///
/// Distinct from an empty-but-valid recommendation list (e.g. every tool
/// is circuit-open).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("no capability available: the tool registry is empty")]
    NoRegistry,
}

/// Configuration could not be loaded or is inconsistent.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level error returned by [`Dispatcher::process`](crate::dispatcher::Dispatcher::process).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Selection(#[from] SelectionError),
}
