//! # Siphon Scripting Engine
//!
//! Script-driven request/response transformation for the Siphon proxy.
//! Operators attach a short script to a route; the script runs once per
//! in-flight exchange to inspect or rewrite headers, body, or status
//! before the exchange continues downstream or returns to the client.
//!
//! ## Architecture
//!
//! - [`ScriptEngineProvider`]: one implementation per scripting
//!   language, resolved through a process-wide [`ProviderRegistry`]
//! - [`ScriptCache`]: LRU cache of compiled artifacts keyed by a
//!   fingerprint of (language, text), with single-flight compilation
//! - [`ScriptExecutor`]: runs compiled scripts on a bounded worker
//!   pool with admission control and per-execution timeouts
//! - [`ExchangeContext`]: the capability view of the exchange bound
//!   into a script's scope
//! - [`ScriptFilterFactory`]: builds route filters wired into the
//!   proxy's filter chain
//!
//! ## Supported Languages
//!
//! - **Rhai**: fast, Rust-native scripting ([`RhaiProvider`])
//!
//! Additional languages plug in by implementing
//! [`ScriptEngineProvider`] and registering at startup; the cache,
//! executor, and filter never change.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod cache;
pub mod context;
pub mod error;
pub mod executor;
pub mod filter;
pub mod outcome;
pub mod provider;
pub mod registry;
pub mod rhai_provider;
pub mod source;

pub use cache::{CacheConfig, CacheStats, ScriptCache};
pub use context::{ExchangeContext, HeaderBag, RequestView, ResponseView};
pub use error::{Result, ScriptError};
pub use executor::{Execution, ExecutorConfig, ExecutorStats, ScriptExecutor};
pub use filter::{ScriptFilter, ScriptFilterConfig, ScriptFilterFactory};
pub use outcome::{ExecutionOutcome, ScriptResponse, ScriptVerdict};
pub use provider::{CancelFlag, CompiledArtifact, ScriptEngineProvider};
pub use registry::{ProviderRegistry, ProviderRegistryBuilder};
pub use rhai_provider::{RhaiProvider, LANGUAGE_RHAI};
pub use source::{Fingerprint, Phase, ScriptCode, ScriptSource};

/// Prelude with commonly used types
pub mod prelude {
    pub use crate::cache::{CacheConfig, ScriptCache};
    pub use crate::context::ExchangeContext;
    pub use crate::error::{Result, ScriptError};
    pub use crate::executor::{ExecutorConfig, ScriptExecutor};
    pub use crate::filter::{ScriptFilter, ScriptFilterConfig, ScriptFilterFactory};
    pub use crate::outcome::ExecutionOutcome;
    pub use crate::provider::ScriptEngineProvider;
    pub use crate::registry::ProviderRegistry;
    pub use crate::rhai_provider::RhaiProvider;
    pub use crate::source::{Phase, ScriptSource};
}
