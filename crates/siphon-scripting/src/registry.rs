//! Process-wide provider registry
//!
//! Built once at startup, before any route becomes active, then frozen:
//! lookups on the request path are plain reads of an immutable map.
//! Registering two providers under one language id is a configuration
//! error reported at startup, never at request time.

use crate::provider::ScriptEngineProvider;
use siphon_core::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Immutable registry of script engine providers, keyed by language id
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<HashMap<String, Arc<dyn ScriptEngineProvider>>>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("languages", &self.languages())
            .finish()
    }
}

impl ProviderRegistry {
    /// Start building a registry
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder {
            providers: HashMap::new(),
        }
    }

    /// Look up the provider for a language id
    pub fn get(&self, language: &str) -> Option<Arc<dyn ScriptEngineProvider>> {
        self.providers.get(language).cloned()
    }

    /// Whether a provider is registered for the language
    pub fn supports(&self, language: &str) -> bool {
        self.providers.contains_key(language)
    }

    /// Registered language ids
    pub fn languages(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}

/// Builder collecting providers during startup wiring
#[derive(Debug)]
pub struct ProviderRegistryBuilder {
    providers: HashMap<String, Arc<dyn ScriptEngineProvider>>,
}

impl ProviderRegistryBuilder {
    /// Register a provider under its language id
    pub fn register(mut self, provider: Arc<dyn ScriptEngineProvider>) -> Result<Self> {
        let language = provider.language_id().to_string();
        if self.providers.contains_key(&language) {
            return Err(Error::Config(format!(
                "script provider for language '{language}' already registered"
            )));
        }
        tracing::info!(language = %language, "Script provider registered");
        self.providers.insert(language, provider);
        Ok(self)
    }

    /// Freeze the registry
    pub fn build(self) -> ProviderRegistry {
        ProviderRegistry {
            providers: Arc::new(self.providers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExchangeContext;
    use crate::outcome::ScriptVerdict;
    use crate::provider::{CancelFlag, CompiledArtifact};

    #[derive(Debug)]
    struct Dummy(&'static str);

    impl ScriptEngineProvider for Dummy {
        fn language_id(&self) -> &str {
            self.0
        }

        fn compile(&self, text: &str) -> crate::error::Result<CompiledArtifact> {
            Ok(CompiledArtifact::new(self.0, text.to_string()))
        }

        fn invoke(
            &self,
            _artifact: &CompiledArtifact,
            _ctx: &mut ExchangeContext,
            _cancel: &CancelFlag,
        ) -> crate::error::Result<ScriptVerdict> {
            Ok(ScriptVerdict::Continue)
        }
    }

    #[test]
    fn test_lookup_by_language() {
        let registry = ProviderRegistry::builder()
            .register(Arc::new(Dummy("lua")))
            .unwrap()
            .register(Arc::new(Dummy("rhai")))
            .unwrap()
            .build();

        assert!(registry.supports("lua"));
        assert!(registry.get("rhai").is_some());
        assert!(registry.get("groovy").is_none());
    }

    #[test]
    fn test_duplicate_registration_is_config_error() {
        let result = ProviderRegistry::builder()
            .register(Arc::new(Dummy("rhai")))
            .unwrap()
            .register(Arc::new(Dummy("rhai")));

        assert!(matches!(result, Err(Error::Config(_))));
    }
}
