//! Compiled script cache
//!
//! Maps the fingerprint of (language, text) to a compiled artifact.
//! Concurrent first access to one fingerprint compiles at most once; all
//! callers observe the single resulting artifact or the single compile
//! error. Compile errors are cached as negative results, so a
//! persistently broken script is reported without re-compiling on every
//! request.
//!
//! Eviction is least-recently-used on `get_or_compile` hits and only
//! drops the cache's own reference: in-flight invocations keep the
//! artifact alive through their `Arc` until they finish.

use crate::error::{Result, ScriptError};
use crate::provider::{CompiledArtifact, ScriptEngineProvider};
use crate::source::Fingerprint;
use lru::LruCache;
use parking_lot::Mutex;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Single-flight slot: resolved at most once, then replayed to every
/// later caller (including the negative, compile-error case)
type Slot = tokio::sync::OnceCell<Result<Arc<CompiledArtifact>>>;

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of cached compilations (positive and negative)
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 256 }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Number of cached compilations
    pub cached_scripts: usize,
    /// Cache hits
    pub hits: u64,
    /// Cache misses
    pub misses: u64,
}

impl CacheStats {
    /// Cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Process-wide cache of compiled scripts
pub struct ScriptCache {
    entries: Mutex<LruCache<Fingerprint, Arc<Slot>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl fmt::Debug for ScriptCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptCache")
            .field("cached_scripts", &self.entries.lock().len())
            .finish()
    }
}

impl ScriptCache {
    /// Create a cache with the given configuration
    pub fn new(config: CacheConfig) -> Self {
        let cap = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the cached artifact for (language, text), compiling it
    /// through `provider` on first access.
    ///
    /// Compilation runs on a blocking worker thread, never on the
    /// caller's I/O thread.
    pub async fn get_or_compile(
        &self,
        provider: Arc<dyn ScriptEngineProvider>,
        text: &str,
    ) -> Result<Arc<CompiledArtifact>> {
        let fingerprint = Fingerprint::of(provider.language_id(), text);

        let slot = {
            let mut entries = self.entries.lock();
            if let Some(slot) = entries.get(&fingerprint) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(%fingerprint, "script cache hit");
                Arc::clone(slot)
            } else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(%fingerprint, "script cache miss");
                let slot = Arc::new(Slot::new());
                if let Some((evicted, _)) = entries.push(fingerprint, Arc::clone(&slot)) {
                    if evicted != fingerprint {
                        debug!(fingerprint = %evicted, "evicted least-recently-used script");
                    }
                }
                slot
            }
        };

        let result = slot
            .get_or_init(|| {
                let text = text.to_string();
                let language = provider.language_id().to_string();
                async move {
                    let compiled = tokio::task::spawn_blocking(move || provider.compile(&text))
                        .await
                        .unwrap_or_else(|e| {
                            Err(ScriptError::runtime(format!("compile task failed: {e}")))
                        });
                    match compiled {
                        Ok(artifact) => {
                            debug!(language = %language, "script compiled and cached");
                            Ok(Arc::new(artifact))
                        }
                        Err(e) => {
                            debug!(language = %language, error = %e, "script compilation failed");
                            Err(e)
                        }
                    }
                }
            })
            .await;

        result.clone()
    }

    /// Drop all cached compilations
    pub fn clear(&self) {
        self.entries.lock().clear();
        debug!("script cache cleared");
    }

    /// Current statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            cached_scripts: self.entries.lock().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Default for ScriptCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
