//! Script engine provider abstraction
//!
//! Each supported scripting language implements [`ScriptEngineProvider`].
//! Adding a language means adding an implementation and registering it;
//! the cache and executor never branch on concrete languages.

use crate::context::ExchangeContext;
use crate::error::Result;
use crate::outcome::ScriptVerdict;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Opaque, language-specific compiled representation of a script
///
/// Never mutated after creation and never tied to a request; shared
/// across concurrent invocations behind an `Arc`. Only the provider
/// that produced an artifact knows its concrete type.
pub struct CompiledArtifact {
    language: String,
    inner: Box<dyn Any + Send + Sync>,
}

impl CompiledArtifact {
    /// Wrap a language-specific compiled value
    pub fn new(language: impl Into<String>, inner: impl Any + Send + Sync) -> Self {
        Self {
            language: language.into(),
            inner: Box::new(inner),
        }
    }

    /// Language that produced this artifact
    pub fn language(&self) -> &str {
        &self.language
    }

    /// Downcast to the provider's concrete compiled type
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for CompiledArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledArtifact")
            .field("language", &self.language)
            .finish()
    }
}

/// Best-effort cancellation signal for one invocation
///
/// Raised when the execution times out or the surrounding exchange is
/// cancelled. Providers whose runtime supports cooperative interruption
/// poll it; runtimes that cannot be interrupted simply run to completion
/// off to the side.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create an unraised flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// One scripting language's capability surface
///
/// Implementations must be safe to share: `compile` and `invoke` are
/// called concurrently from worker threads for many routes. `invoke`
/// runs on a dedicated worker thread and may block.
pub trait ScriptEngineProvider: Send + Sync + fmt::Debug {
    /// Identifier this provider serves, matched against
    /// [`ScriptSource::language`](crate::ScriptSource)
    fn language_id(&self) -> &str;

    /// Compile script text into a reusable artifact
    fn compile(&self, text: &str) -> Result<CompiledArtifact>;

    /// Run a compiled artifact with the context bound into its scope.
    ///
    /// Runtime failures come back as errors, never panics. `cancel` is
    /// the cooperative interruption signal; honoring it is best-effort.
    fn invoke(
        &self,
        artifact: &CompiledArtifact,
        ctx: &mut ExchangeContext,
        cancel: &CancelFlag,
    ) -> Result<ScriptVerdict>;
}
