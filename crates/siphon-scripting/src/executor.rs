//! Script executor
//!
//! Runs compiled scripts off the proxy's I/O threads on a bounded
//! blocking worker pool, with admission control and a hard timeout.
//!
//! Backpressure: `workers` permits bound concurrent invocations; up to
//! `queue_depth` callers may wait for a permit; beyond that, executions
//! are rejected immediately with an `Overloaded` outcome instead of
//! queuing without limit.
//!
//! Timeouts stop the wait, not the script: a runaway invocation is
//! abandoned (never join-waited) and signalled through a cooperative
//! [`CancelFlag`]. An abandoned invocation keeps its worker permit until
//! the script runtime actually returns, so the pool bound stays honest.

use crate::cache::ScriptCache;
use crate::context::ExchangeContext;
use crate::error::ScriptError;
use crate::outcome::ExecutionOutcome;
use crate::provider::CancelFlag;
use crate::registry::ProviderRegistry;
use crate::source::ScriptSource;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of concurrent script invocations, independent of request
    /// concurrency
    pub workers: usize,
    /// Executions allowed to wait for a worker before admission control
    /// rejects new ones
    pub queue_depth: usize,
    /// Timeout applied when the route does not configure one
    pub default_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 64,
            default_timeout: Duration::from_millis(100),
        }
    }
}

/// Executor statistics
#[derive(Debug, Clone, Default)]
pub struct ExecutorStats {
    /// Completed executions (any outcome except rejection)
    pub executed: u64,
    /// Executions that hit their timeout
    pub timed_out: u64,
    /// Executions rejected by admission control
    pub rejected: u64,
}

/// Result of [`ScriptExecutor::execute`]
///
/// `context` carries the mutated exchange view back to the filter on
/// `Continue`; it is `None` when the invocation was abandoned past its
/// timeout (the context moved into the runaway invocation).
#[derive(Debug)]
pub struct Execution {
    /// What the chain should do
    pub outcome: ExecutionOutcome,
    /// The context after the script ran, when it is still available
    pub context: Option<ExchangeContext>,
}

impl Execution {
    fn failed(error: ScriptError, context: Option<ExchangeContext>) -> Self {
        Self {
            outcome: ExecutionOutcome::Failed(error),
            context,
        }
    }
}

/// Process-wide script executor shared by all routes and languages
#[derive(Debug)]
pub struct ScriptExecutor {
    registry: ProviderRegistry,
    cache: Arc<ScriptCache>,
    workers: Arc<Semaphore>,
    queued: AtomicUsize,
    config: ExecutorConfig,
    executed: AtomicU64,
    timed_out: AtomicU64,
    rejected: AtomicU64,
}

impl ScriptExecutor {
    /// Create an executor over a frozen registry and a shared cache
    pub fn new(registry: ProviderRegistry, cache: Arc<ScriptCache>, config: ExecutorConfig) -> Self {
        Self {
            registry,
            cache,
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            queued: AtomicUsize::new(0),
            config,
            executed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Provider registry this executor resolves languages against
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Compiled script cache backing this executor
    pub fn cache(&self) -> &Arc<ScriptCache> {
        &self.cache
    }

    /// Timeout used when the route does not configure one
    pub fn default_timeout(&self) -> Duration {
        self.config.default_timeout
    }

    /// Current statistics
    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            executed: self.executed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Execute `source` against `ctx`, producing exactly one outcome.
    ///
    /// A route that does not configure a timeout passes `None` and gets
    /// the executor's [`ExecutorConfig::default_timeout`]. Every
    /// script-originated failure is recovered here and converted into
    /// [`ExecutionOutcome::Failed`]; nothing propagates as a raw fault
    /// to the chain.
    pub async fn execute(
        &self,
        source: &ScriptSource,
        ctx: ExchangeContext,
        timeout: Option<Duration>,
    ) -> Execution {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let start = Instant::now();
        let name = source.name();

        let mut ctx = ctx;
        ctx.options = source.options.clone();

        let Some(provider) = self.registry.get(&source.language) else {
            return Execution::failed(
                ScriptError::UnsupportedLanguage {
                    language: source.language.clone(),
                },
                Some(ctx),
            );
        };

        let text = match source.code.resolve().await {
            Ok(text) => text,
            Err(e) => return Execution::failed(e, Some(ctx)),
        };

        let artifact = match self.cache.get_or_compile(Arc::clone(&provider), &text).await {
            Ok(artifact) => artifact,
            Err(e) => return Execution::failed(e, Some(ctx)),
        };

        // Raised on timeout and when the caller drops this future
        // (client disconnect); harmless after a normal completion.
        let cancel = CancelFlag::new();
        let _cancel_guard = CancelOnDrop(cancel.clone());

        let run = async {
            let permit = match Arc::clone(&self.workers).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    let _queued = QueueGuard::enter(&self.queued, self.config.queue_depth)
                        .ok_or(ScriptError::Overloaded)?;
                    Arc::clone(&self.workers)
                        .acquire_owned()
                        .await
                        .map_err(|_| ScriptError::Overloaded)?
                }
            };

            let invoke_cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                // The permit rides along so an abandoned invocation
                // still counts against the pool bound until it returns.
                let _permit = permit;
                let mut ctx = ctx;
                let verdict = provider.invoke(&artifact, &mut ctx, &invoke_cancel);
                (ctx, verdict)
            })
            .await
            .map_err(|e| ScriptError::runtime(format!("script worker panicked: {e}")))
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(Ok((ctx, verdict))) => {
                self.executed.fetch_add(1, Ordering::Relaxed);
                trace!(
                    script = %name,
                    elapsed_us = start.elapsed().as_micros() as u64,
                    "script executed"
                );
                match verdict {
                    Ok(verdict) => Execution {
                        outcome: verdict.into(),
                        context: Some(ctx),
                    },
                    Err(e) => {
                        debug!(script = %name, error = %e, "script failed at runtime");
                        Execution::failed(e, Some(ctx))
                    }
                }
            }
            Ok(Err(e)) => {
                if matches!(e, ScriptError::Overloaded) {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(script = %name, "script execution rejected: executor overloaded");
                } else {
                    self.executed.fetch_add(1, Ordering::Relaxed);
                }
                Execution::failed(e, None)
            }
            Err(_) => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                cancel.cancel();
                warn!(
                    script = %name,
                    timeout_ms = timeout.as_millis() as u64,
                    "script timed out; abandoning invocation"
                );
                Execution::failed(
                    ScriptError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    },
                    None,
                )
            }
        }
    }
}

/// Raises the cancel flag when the execution future is dropped
struct CancelOnDrop(CancelFlag);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Bounded-queue admission slot, released on drop
struct QueueGuard<'a> {
    queued: &'a AtomicUsize,
}

impl<'a> QueueGuard<'a> {
    fn enter(queued: &'a AtomicUsize, depth: usize) -> Option<Self> {
        let prev = queued.fetch_add(1, Ordering::AcqRel);
        if prev >= depth {
            queued.fetch_sub(1, Ordering::AcqRel);
            None
        } else {
            Some(Self { queued })
        }
    }
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::error::Result;
    use crate::outcome::{ScriptResponse, ScriptVerdict};
    use crate::provider::{CompiledArtifact, ScriptEngineProvider};
    use bytes::Bytes;

    /// Test language: the "script text" is an instruction.
    ///
    /// `header <name> <value>` sets a request header, `sleep <ms>`
    /// blocks, `block 403 <body>` short-circuits, `fail` errors at
    /// runtime, `badsyntax` fails to compile.
    #[derive(Debug, Default)]
    struct Scriptlet {
        compiles: AtomicUsize,
        cancellations: AtomicUsize,
    }

    impl ScriptEngineProvider for Scriptlet {
        fn language_id(&self) -> &str {
            "scriptlet"
        }

        fn compile(&self, text: &str) -> Result<CompiledArtifact> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            if text.starts_with("badsyntax") {
                return Err(ScriptError::compile("scriptlet", "unknown instruction"));
            }
            Ok(CompiledArtifact::new("scriptlet", text.to_string()))
        }

        fn invoke(
            &self,
            artifact: &CompiledArtifact,
            ctx: &mut ExchangeContext,
            cancel: &CancelFlag,
        ) -> Result<ScriptVerdict> {
            let text = artifact.downcast_ref::<String>().expect("scriptlet artifact");
            let mut parts = text.splitn(3, ' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some("header"), Some(name), Some(value)) => {
                    ctx.request.headers.set(name, value);
                    Ok(ScriptVerdict::Continue)
                }
                (Some("sleep"), Some(ms), _) => {
                    let deadline =
                        Instant::now() + Duration::from_millis(ms.parse().unwrap());
                    while Instant::now() < deadline && !cancel.is_cancelled() {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    if cancel.is_cancelled() {
                        self.cancellations.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(ScriptVerdict::Continue)
                }
                (Some("block"), Some(status), Some(body)) => {
                    Ok(ScriptVerdict::ShortCircuit(ScriptResponse::new(
                        status.parse().unwrap(),
                        body.to_string(),
                    )))
                }
                (Some("fail"), _, _) => Err(ScriptError::runtime("instructed to fail")),
                _ => Ok(ScriptVerdict::Continue),
            }
        }
    }

    fn executor(provider: Arc<Scriptlet>, config: ExecutorConfig) -> ScriptExecutor {
        let registry = ProviderRegistry::builder()
            .register(provider)
            .unwrap()
            .build();
        ScriptExecutor::new(registry, Arc::new(ScriptCache::new(CacheConfig::default())), config)
    }

    fn context() -> ExchangeContext {
        let (parts, _) = http::Request::builder()
            .uri("/test")
            .body(())
            .unwrap()
            .into_parts();
        ExchangeContext::pre(&parts, Bytes::new(), 1024).unwrap()
    }

    #[tokio::test]
    async fn test_continue_with_visible_mutation() {
        let exec = executor(Arc::default(), ExecutorConfig::default());
        let source = ScriptSource::inline("scriptlet", "header x-trace injected");

        let run = exec
            .execute(&source, context(), Some(Duration::from_secs(1)))
            .await;

        assert!(run.outcome.is_continue());
        let ctx = run.context.unwrap();
        assert_eq!(ctx.request.headers.get("X-Trace"), Some("injected"));
        assert_eq!(exec.stats().executed, 1);
    }

    #[tokio::test]
    async fn test_unsupported_language() {
        let exec = executor(Arc::default(), ExecutorConfig::default());
        let source = ScriptSource::inline("groovy", "anything");

        let run = exec
            .execute(&source, context(), Some(Duration::from_secs(1)))
            .await;

        assert!(matches!(
            run.outcome,
            ExecutionOutcome::Failed(ScriptError::UnsupportedLanguage { .. })
        ));
    }

    #[tokio::test]
    async fn test_compile_error_not_recompiled() {
        let provider = Arc::new(Scriptlet::default());
        let exec = executor(Arc::clone(&provider), ExecutorConfig::default());
        let source = ScriptSource::inline("scriptlet", "badsyntax");

        for _ in 0..2 {
            let run = exec
                .execute(&source, context(), Some(Duration::from_secs(1)))
                .await;
            assert!(matches!(
                run.outcome,
                ExecutionOutcome::Failed(ScriptError::Compile { .. })
            ));
        }
        assert_eq!(provider.compiles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_runtime_error_is_recovered() {
        let exec = executor(Arc::default(), ExecutorConfig::default());
        let source = ScriptSource::inline("scriptlet", "fail now");

        let run = exec
            .execute(&source, context(), Some(Duration::from_secs(1)))
            .await;

        assert!(matches!(
            run.outcome,
            ExecutionOutcome::Failed(ScriptError::Runtime { .. })
        ));
        // The context survives a runtime failure
        assert!(run.context.is_some());
    }

    #[tokio::test]
    async fn test_short_circuit() {
        let exec = executor(Arc::default(), ExecutorConfig::default());
        let source = ScriptSource::inline("scriptlet", "block 403 blocked");

        let run = exec
            .execute(&source, context(), Some(Duration::from_secs(1)))
            .await;

        match run.outcome {
            ExecutionOutcome::ShortCircuit(response) => {
                assert_eq!(response.status, 403);
                assert_eq!(response.body, Bytes::from("blocked"));
            }
            other => panic!("expected short circuit, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_reported_promptly_without_joining() {
        let exec = executor(Arc::default(), ExecutorConfig::default());
        // Sleeps far longer than the timeout, but polls the cancel flag
        let source = ScriptSource::inline("scriptlet", "sleep 5000");

        let start = Instant::now();
        let run = exec
            .execute(&source, context(), Some(Duration::from_millis(50)))
            .await;

        assert!(matches!(
            run.outcome,
            ExecutionOutcome::Failed(ScriptError::Timeout { timeout_ms: 50 })
        ));
        // Reported near the timeout, not after the script finishes
        assert!(start.elapsed() < Duration::from_millis(1000));
        // The context moved into the abandoned invocation
        assert!(run.context.is_none());
        assert_eq!(exec.stats().timed_out, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropping_execution_raises_cancel_flag() {
        let provider = Arc::new(Scriptlet::default());
        let exec = Arc::new(executor(Arc::clone(&provider), ExecutorConfig::default()));
        let source = ScriptSource::inline("scriptlet", "sleep 5000");

        let task = {
            let exec = Arc::clone(&exec);
            let source = source.clone();
            tokio::spawn(async move {
                exec.execute(&source, context(), Some(Duration::from_secs(10))).await
            })
        };

        // Let the invocation reach a worker thread, then abandon it the
        // way a client disconnect would
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        let deadline = Instant::now() + Duration::from_secs(2);
        while provider.cancellations.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // The worker observed the flag and stopped well before the
        // script's 5s sleep ran out
        assert_eq!(provider.cancellations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_timeout_falls_back_to_executor_default() {
        let exec = executor(
            Arc::default(),
            ExecutorConfig {
                workers: 4,
                queue_depth: 64,
                default_timeout: Duration::from_millis(50),
            },
        );
        let source = ScriptSource::inline("scriptlet", "sleep 5000");

        let run = exec.execute(&source, context(), None).await;

        assert!(matches!(
            run.outcome,
            ExecutionOutcome::Failed(ScriptError::Timeout { timeout_ms: 50 })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_burst_beyond_pool_and_queue_is_rejected() {
        let exec = Arc::new(executor(
            Arc::default(),
            ExecutorConfig {
                workers: 1,
                queue_depth: 1,
                default_timeout: Duration::from_secs(1),
            },
        ));
        let source = ScriptSource::inline("scriptlet", "sleep 200");

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let exec = Arc::clone(&exec);
                let source = source.clone();
                tokio::spawn(async move {
                    exec.execute(&source, context(), Some(Duration::from_secs(5))).await
                })
            })
            .collect();

        let mut rejected = 0;
        let mut completed = 0;
        for task in tasks {
            match task.await.unwrap().outcome {
                ExecutionOutcome::Failed(ScriptError::Overloaded) => rejected += 1,
                ExecutionOutcome::Continue => completed += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        // 1 worker + 1 queue slot: exactly one of three is turned away
        assert_eq!(rejected, 1);
        assert_eq!(completed, 2);
        assert_eq!(exec.stats().rejected, 1);
    }
}
