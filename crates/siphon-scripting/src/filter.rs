//! Script gateway filter
//!
//! Thin boundary adapter between the script executor and the proxy's
//! filter chain: builds an [`ExchangeContext`] from the in-flight
//! exchange, runs the route's script through the shared executor, and
//! translates the outcome into chain behavior: continue, short-circuit
//! with the script's response, or fail with the error's mapped HTTP
//! status.

use crate::context::ExchangeContext;
use crate::error::ScriptError;
use crate::executor::ScriptExecutor;
use crate::outcome::{ExecutionOutcome, ScriptResponse};
use crate::source::{Phase, ScriptSource};
use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use siphon_core::{Attributes, Body, Error, Filter, Next, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Script filter configuration, bound from route configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptFilterConfig {
    /// Script source: `language`, `script` or `script_file`, `phase`,
    /// `options`
    #[serde(flatten)]
    pub source: ScriptSource,

    /// Maximum execution time in milliseconds; falls back to the
    /// executor's configured default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Largest body the script may see in memory (default: 1 MiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Forward the exchange untouched instead of failing the request
    /// when the script errors (default: false)
    #[serde(default)]
    pub continue_on_error: bool,
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl ScriptFilterConfig {
    /// Config for an inline PRE-phase script
    pub fn inline(language: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            source: ScriptSource::inline(language, script),
            timeout_ms: None,
            max_body_bytes: default_max_body_bytes(),
            continue_on_error: false,
        }
    }

    /// Set the execution phase
    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.source.phase = phase;
        self
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Forward untouched instead of failing when the script errors
    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }
}

/// Builds [`ScriptFilter`] instances wired to the shared executor
#[derive(Debug, Clone)]
pub struct ScriptFilterFactory {
    executor: Arc<ScriptExecutor>,
}

impl ScriptFilterFactory {
    /// Create a factory over a process-wide executor
    pub fn new(executor: Arc<ScriptExecutor>) -> Self {
        Self { executor }
    }

    /// Build a filter for one route.
    ///
    /// Configuration problems are reported here, at route activation:
    /// an unregistered language or a non-positive timeout never makes
    /// it to the request path.
    pub fn filter(&self, config: ScriptFilterConfig) -> Result<ScriptFilter> {
        if !self.executor.registry().supports(&config.source.language) {
            return Err(Error::Config(format!(
                "no script provider registered for language '{}'",
                config.source.language
            )));
        }
        if config.timeout_ms == Some(0) {
            return Err(Error::Config(
                "script timeout_ms must be positive".to_string(),
            ));
        }
        if config.max_body_bytes == 0 {
            return Err(Error::Config(
                "script max_body_bytes must be positive".to_string(),
            ));
        }
        Ok(ScriptFilter {
            timeout: config.timeout_ms.map(Duration::from_millis),
            config,
            executor: Arc::clone(&self.executor),
        })
    }
}

/// One route's script filter
pub struct ScriptFilter {
    config: ScriptFilterConfig,
    executor: Arc<ScriptExecutor>,
    timeout: Option<Duration>,
}

impl ScriptFilter {
    /// Pre-compile the script into the shared cache so the first
    /// request does not pay for compilation
    pub async fn prepare(&self) -> crate::error::Result<()> {
        let provider = self
            .executor
            .registry()
            .get(&self.config.source.language)
            .ok_or_else(|| ScriptError::UnsupportedLanguage {
                language: self.config.source.language.clone(),
            })?;
        let text = self.config.source.code.resolve().await?;
        self.executor.cache().get_or_compile(provider, &text).await?;
        Ok(())
    }

    fn failure_response(&self, e: &ScriptError) -> Result<Response<Body>> {
        error!(
            script = %self.config.source.name(),
            error = %e,
            "script execution failed"
        );
        // Diagnostic bodies are the outer layer's job; only the status
        // and error kind leave this filter
        Ok(Response::builder()
            .status(e.status_code())
            .body(Body::from(""))?)
    }

    fn short_circuit_response(&self, response: ScriptResponse) -> Result<Response<Body>> {
        debug!(
            script = %self.config.source.name(),
            status = response.status,
            "script short-circuited the chain"
        );
        let header_map = match response.headers.to_header_map() {
            Ok(map) => map,
            Err(e) => return self.failure_response(&e),
        };
        let mut builder = Response::builder().status(response.status);
        if let Some(headers) = builder.headers_mut() {
            *headers = header_map;
        }
        Ok(builder.body(Body::from(response.body))?)
    }

    async fn run_pre(&self, req: Request<Body>, next: Next) -> Result<Response<Body>> {
        let (mut parts, body) = req.into_parts();
        let bytes = body
            .collect()
            .await
            .map_err(|e| Error::Internal(format!("failed to buffer request body: {e}")))?
            .to_bytes();

        let attributes = parts
            .extensions
            .get::<Attributes>()
            .cloned()
            .unwrap_or_default();

        let rebuild = |parts: http::request::Parts, bytes: Bytes| {
            Request::from_parts(parts, Body::from(bytes))
        };

        let ctx = match ExchangeContext::pre(&parts, bytes.clone(), self.config.max_body_bytes) {
            Ok(ctx) => ctx.with_attributes(attributes.into()),
            Err(e) if self.config.continue_on_error => {
                error!(script = %self.config.source.name(), error = %e, "skipping script");
                return next.run(rebuild(parts, bytes)).await;
            }
            Err(e) => return self.failure_response(&e),
        };

        let run = self.executor.execute(&self.config.source, ctx, self.timeout).await;
        match run.outcome {
            ExecutionOutcome::Continue => {
                let ctx = run
                    .context
                    .ok_or_else(|| Error::Internal("continue outcome without context".to_string()))?;
                match ctx.apply_to_request(&mut parts) {
                    Ok(new_body) => {
                        let mut req = rebuild(parts, new_body);
                        Attributes::from(ctx.attributes).attach(&mut req);
                        next.run(req).await
                    }
                    Err(e) if self.config.continue_on_error => {
                        error!(script = %self.config.source.name(), error = %e, "continuing past script error");
                        next.run(rebuild(parts, bytes)).await
                    }
                    Err(e) => self.failure_response(&e),
                }
            }
            ExecutionOutcome::ShortCircuit(response) => self.short_circuit_response(response),
            ExecutionOutcome::Failed(e) if self.config.continue_on_error => {
                error!(script = %self.config.source.name(), error = %e, "continuing past script error");
                next.run(rebuild(parts, bytes)).await
            }
            ExecutionOutcome::Failed(e) => self.failure_response(&e),
        }
    }

    async fn run_post(&self, req: Request<Body>, next: Next) -> Result<Response<Body>> {
        // Snapshot for the script's read-only request view
        let (parts, body) = req.into_parts();
        let req_parts = parts.clone();
        let res = next.run(Request::from_parts(parts, body)).await?;

        let attributes = req_parts
            .extensions
            .get::<Attributes>()
            .cloned()
            .unwrap_or_default();

        let (mut parts, body) = res.into_parts();
        let bytes = body
            .collect()
            .await
            .map_err(|e| Error::Internal(format!("failed to buffer response body: {e}")))?
            .to_bytes();

        let rebuild = |parts: http::response::Parts, bytes: Bytes| {
            Response::from_parts(parts, Body::from(bytes))
        };

        let ctx = match ExchangeContext::post(&req_parts, &parts, bytes.clone(), self.config.max_body_bytes)
        {
            Ok(ctx) => ctx.with_attributes(attributes.into()),
            Err(e) if self.config.continue_on_error => {
                error!(script = %self.config.source.name(), error = %e, "skipping script");
                return Ok(rebuild(parts, bytes));
            }
            Err(e) => return self.failure_response(&e),
        };

        let run = self.executor.execute(&self.config.source, ctx, self.timeout).await;
        match run.outcome {
            ExecutionOutcome::Continue => {
                let ctx = run
                    .context
                    .ok_or_else(|| Error::Internal("continue outcome without context".to_string()))?;
                match ctx.apply_to_response(&mut parts) {
                    Ok(new_body) => Ok(rebuild(parts, new_body)),
                    Err(e) if self.config.continue_on_error => {
                        error!(script = %self.config.source.name(), error = %e, "continuing past script error");
                        Ok(rebuild(parts, bytes))
                    }
                    Err(e) => self.failure_response(&e),
                }
            }
            ExecutionOutcome::ShortCircuit(response) => self.short_circuit_response(response),
            ExecutionOutcome::Failed(e) if self.config.continue_on_error => {
                error!(script = %self.config.source.name(), error = %e, "continuing past script error");
                Ok(rebuild(parts, bytes))
            }
            ExecutionOutcome::Failed(e) => self.failure_response(&e),
        }
    }
}

impl fmt::Debug for ScriptFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptFilter")
            .field("language", &self.config.source.language)
            .field("script", &self.config.source.name())
            .field("phase", &self.config.source.phase)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl Filter for ScriptFilter {
    async fn call(&self, req: Request<Body>, next: Next) -> Result<Response<Body>> {
        match self.config.source.phase {
            Phase::Pre => self.run_pre(req, next).await,
            Phase::Post => self.run_post(req, next).await,
        }
    }
}
