//! Conversational context: entries, providers, retrieval, and compression.
//!
//! - [`entry`]: [`ContextEntry`] and [`ContextKind`]
//! - [`provider`]: the [`ContextProvider`] seam and [`StaticContextProvider`]
//! - [`retriever`]: [`ContextRetriever`] fan-out, dedup, ranking, caching,
//!   and usage feedback
//! - [`compress`]: fitting ranked context into a size budget

pub mod compress;
pub mod entry;
pub mod provider;
pub mod retriever;

pub use compress::{compress_context_window, window_size};
pub use entry::{ContextEntry, ContextKind};
pub use provider::{ContextProvider, ProviderFuture, StaticContextProvider};
pub use retriever::{CONTEXT_CACHE_CATEGORY, ContextRetriever};
