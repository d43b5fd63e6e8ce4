//! Rhai script engine provider
//!
//! Binds the exchange context into a Rhai scope, runs the compiled AST,
//! and reads script mutations back. Scripts see `method`, `path`,
//! `uri`, `headers`, `query`, `options`, `attributes`, `claims` and
//! `body` in the PRE phase; `status`, `headers` and `body` address the
//! response in the POST phase. Calling `respond(status, body)` ends the
//! chain with that response.

use crate::context::{ExchangeContext, HeaderBag};
use crate::error::{Result, ScriptError};
use crate::outcome::{ScriptResponse, ScriptVerdict};
use crate::provider::{CancelFlag, CompiledArtifact, ScriptEngineProvider};
use crate::source::Phase;
use base64::Engine as _;
use rhai::{Dynamic, Engine, Map, Scope, AST};
use std::cell::RefCell;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Language identifier served by [`RhaiProvider`]
pub const LANGUAGE_RHAI: &str = "rhai";

const RESPOND_MARKER: &str = "__siphon_respond";

thread_local! {
    // The cancel flag of the invocation currently running on this
    // worker thread, polled from the shared engine's progress hook.
    static ACTIVE_CANCEL: RefCell<Option<CancelFlag>> = const { RefCell::new(None) };
}

/// Rhai implementation of [`ScriptEngineProvider`]
#[derive(Debug)]
pub struct RhaiProvider {
    engine: Engine,
}

impl RhaiProvider {
    /// Create a provider with the default safety limits
    pub fn new() -> Self {
        Self::with_limits(100_000, 1024 * 1024)
    }

    /// Create a provider with custom operation and string-size limits
    pub fn with_limits(max_operations: u64, max_string_size: usize) -> Self {
        let mut engine = Engine::new();

        engine.set_max_expr_depths(25, 10);
        engine.set_max_operations(max_operations);
        engine.set_max_string_size(max_string_size);
        engine.set_max_array_size(10_000);
        engine.set_max_map_size(10_000);

        engine.on_progress(|_| {
            let cancelled = ACTIVE_CANCEL.with(|c| {
                c.borrow().as_ref().map(CancelFlag::is_cancelled).unwrap_or(false)
            });
            cancelled.then(|| Dynamic::from("cancelled"))
        });

        Self::register_functions(&mut engine);

        Self { engine }
    }

    fn register_functions(engine: &mut Engine) {
        // Short-circuit: unwinds out of the script as a tagged runtime
        // error and is turned into a ShortCircuit verdict by invoke()
        engine.register_fn(
            "respond",
            |status: i64, body: &str| -> std::result::Result<(), Box<rhai::EvalAltResult>> {
                Err(respond_payload(status, body))
            },
        );
        engine.register_fn(
            "respond",
            |status: i64| -> std::result::Result<(), Box<rhai::EvalAltResult>> {
                Err(respond_payload(status, ""))
            },
        );

        // String utilities
        engine.register_fn("base64_encode", |s: &str| -> String {
            base64::engine::general_purpose::STANDARD.encode(s.as_bytes())
        });

        engine.register_fn("base64_decode", |s: &str| -> String {
            base64::engine::general_purpose::STANDARD
                .decode(s.as_bytes())
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .unwrap_or_default()
        });

        engine.register_fn("unix_time", || -> i64 {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0)
        });

        engine.register_fn("uuid", || -> String { uuid::Uuid::new_v4().to_string() });

        // Logging (for debugging scripts)
        engine.register_fn("log_debug", |msg: &str| {
            debug!(script_log = msg);
        });

        engine.register_fn("log_info", |msg: &str| {
            tracing::info!(script_log = msg);
        });

        engine.register_fn("log_warn", |msg: &str| {
            warn!(script_log = msg);
        });
    }

    fn bind_scope<'a>(&self, ctx: &mut ExchangeContext) -> Scope<'a> {
        let mut scope = Scope::new();

        scope.push("method", ctx.request.method().to_string());
        scope.push("path", ctx.request.path().to_string());
        scope.push("uri", ctx.request.uri().to_string());
        scope.push("query", multi_map_to_rhai(ctx.request.query()));
        scope.push(
            "options",
            ctx.options
                .iter()
                .map(|(k, v)| (k.as_str().into(), Dynamic::from(v.clone())))
                .collect::<Map>(),
        );
        scope.push(
            "attributes",
            rhai::serde::to_dynamic(&ctx.attributes).unwrap_or_else(|_| Dynamic::from(Map::new())),
        );
        scope.push(
            "claims",
            rhai::serde::to_dynamic(ctx.request.claims())
                .unwrap_or_else(|_| Dynamic::from(Map::new())),
        );

        match ctx.phase() {
            Phase::Pre => {
                scope.push("headers", headers_to_rhai(&ctx.request.headers));
                if let Some(body) = ctx.request.body_string() {
                    scope.push("body", body);
                }
            }
            Phase::Post => {
                if let Some(response) = ctx.response.as_ref() {
                    scope.push("status", response.status as i64);
                    scope.push("headers", headers_to_rhai(&response.headers));
                    if let Some(body) = response.body_string() {
                        scope.push("body", body);
                    }
                }
            }
        }

        scope
    }

    fn apply_scope(&self, scope: &mut Scope<'_>, ctx: &mut ExchangeContext) -> Result<()> {
        if let Some(attributes) = scope.get_value::<Map>("attributes") {
            ctx.attributes = rhai::serde::from_dynamic::<HashMap<String, serde_json::Value>>(
                &Dynamic::from(attributes),
            )
            .map_err(|e| ScriptError::runtime(format!("invalid attributes value: {e}")))?;
        }

        match ctx.phase() {
            Phase::Pre => {
                if let Some(headers) = scope.get_value::<Map>("headers") {
                    // The script never saw non-UTF-8 values; keep them
                    let mut bag = rhai_to_headers(headers);
                    bag.inherit_opaque(&ctx.request.headers);
                    ctx.request.headers = bag;
                }
                if let Some(body) = scope.get_value::<String>("body") {
                    ctx.request.set_body_string(body);
                }
            }
            Phase::Post => {
                let response = ctx
                    .response
                    .as_mut()
                    .ok_or_else(|| ScriptError::runtime("no response view in POST context"))?;
                if let Some(status) = scope.get_value::<i64>("status") {
                    response.status = u16::try_from(status).map_err(|_| {
                        ScriptError::runtime(format!("invalid status code {status}"))
                    })?;
                }
                if let Some(headers) = scope.get_value::<Map>("headers") {
                    let mut bag = rhai_to_headers(headers);
                    bag.inherit_opaque(&response.headers);
                    response.headers = bag;
                }
                if let Some(body) = scope.get_value::<String>("body") {
                    response.set_body_string(body);
                }
            }
        }

        Ok(())
    }
}

impl Default for RhaiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptEngineProvider for RhaiProvider {
    fn language_id(&self) -> &str {
        LANGUAGE_RHAI
    }

    fn compile(&self, text: &str) -> Result<CompiledArtifact> {
        let ast = self.engine.compile(text).map_err(|e| ScriptError::Compile {
            language: LANGUAGE_RHAI.to_string(),
            message: e.to_string(),
            line: e.1.line(),
        })?;
        Ok(CompiledArtifact::new(LANGUAGE_RHAI, ast))
    }

    fn invoke(
        &self,
        artifact: &CompiledArtifact,
        ctx: &mut ExchangeContext,
        cancel: &CancelFlag,
    ) -> Result<ScriptVerdict> {
        let ast = artifact
            .downcast_ref::<AST>()
            .ok_or_else(|| ScriptError::runtime("artifact is not a rhai AST"))?;

        let mut scope = self.bind_scope(ctx);

        let _active = ActiveCancel::set(cancel.clone());
        let result = self.engine.eval_ast_with_scope::<Dynamic>(&mut scope, ast);

        match result {
            Ok(_) => {
                self.apply_scope(&mut scope, ctx)?;
                Ok(ScriptVerdict::Continue)
            }
            Err(e) => match as_respond(&e) {
                Some(response) => {
                    // Mutations made before respond() still apply
                    self.apply_scope(&mut scope, ctx)?;
                    Ok(ScriptVerdict::ShortCircuit(response))
                }
                None => Err(ScriptError::Runtime {
                    message: e.to_string(),
                }),
            },
        }
    }
}

/// Scope guard publishing the invocation's cancel flag to the engine's
/// progress hook on this worker thread
struct ActiveCancel;

impl ActiveCancel {
    fn set(cancel: CancelFlag) -> Self {
        ACTIVE_CANCEL.with(|c| *c.borrow_mut() = Some(cancel));
        Self
    }
}

impl Drop for ActiveCancel {
    fn drop(&mut self) {
        ACTIVE_CANCEL.with(|c| *c.borrow_mut() = None);
    }
}

fn respond_payload(status: i64, body: &str) -> Box<rhai::EvalAltResult> {
    let mut payload = Map::new();
    payload.insert(RESPOND_MARKER.into(), Dynamic::from(true));
    payload.insert("status".into(), Dynamic::from(status));
    payload.insert("body".into(), Dynamic::from(body.to_string()));
    Box::new(rhai::EvalAltResult::ErrorRuntime(
        Dynamic::from(payload),
        rhai::Position::NONE,
    ))
}

fn as_respond(err: &rhai::EvalAltResult) -> Option<ScriptResponse> {
    let payload = match err {
        rhai::EvalAltResult::ErrorRuntime(payload, _) => payload,
        // The engine may wrap a native function's error
        rhai::EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => return as_respond(inner),
        _ => return None,
    };
    let payload = payload.read_lock::<Map>()?;
    if !payload.contains_key(RESPOND_MARKER) {
        return None;
    }
    let status = payload.get("status")?.as_int().ok()?;
    let body = payload
        .get("body")
        .and_then(|b| b.clone().into_string().ok())
        .unwrap_or_default();
    Some(ScriptResponse::new(
        u16::try_from(status).unwrap_or(500),
        body,
    ))
}

fn headers_to_rhai(headers: &HeaderBag) -> Map {
    headers
        .iter()
        .map(|(name, values)| {
            let value = if values.len() == 1 {
                Dynamic::from(values[0].clone())
            } else {
                Dynamic::from(
                    values
                        .iter()
                        .map(|v| Dynamic::from(v.clone()))
                        .collect::<rhai::Array>(),
                )
            };
            (name.as_str().into(), value)
        })
        .collect()
}

fn multi_map_to_rhai(map: &HashMap<String, Vec<String>>) -> Map {
    map.iter()
        .map(|(name, values)| {
            let value = if values.len() == 1 {
                Dynamic::from(values[0].clone())
            } else {
                Dynamic::from(
                    values
                        .iter()
                        .map(|v| Dynamic::from(v.clone()))
                        .collect::<rhai::Array>(),
                )
            };
            (name.as_str().into(), value)
        })
        .collect()
}

fn rhai_to_headers(map: Map) -> HeaderBag {
    let mut headers = HeaderBag::new();
    for (name, value) in map {
        if let Some(values) = value.read_lock::<rhai::Array>() {
            headers.set_all(
                name.as_str(),
                values.iter().map(dynamic_to_string).collect(),
            );
        } else {
            headers.set(name.as_str(), dynamic_to_string(&value));
        }
    }
    headers
}

fn dynamic_to_string(value: &Dynamic) -> String {
    value
        .clone()
        .into_string()
        .unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::Method;

    fn provider() -> RhaiProvider {
        RhaiProvider::new()
    }

    fn pre_context(uri: &str) -> ExchangeContext {
        let (parts, _) = http::Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header("X-Existing", "yes")
            .body(())
            .unwrap()
            .into_parts();
        ExchangeContext::pre(&parts, Bytes::new(), 1024 * 1024).unwrap()
    }

    fn post_context(status: u16, body: &str) -> ExchangeContext {
        let (req_parts, _) = http::Request::builder()
            .uri("/api")
            .body(())
            .unwrap()
            .into_parts();
        let (resp_parts, _) = http::Response::builder()
            .status(status)
            .body(())
            .unwrap()
            .into_parts();
        ExchangeContext::post(
            &req_parts,
            &resp_parts,
            Bytes::from(body.to_string()),
            1024 * 1024,
        )
        .unwrap()
    }

    fn run(
        provider: &RhaiProvider,
        script: &str,
        ctx: &mut ExchangeContext,
    ) -> Result<ScriptVerdict> {
        let artifact = provider.compile(script)?;
        provider.invoke(&artifact, ctx, &CancelFlag::new())
    }

    #[test]
    fn test_syntax_error_reports_compile_error() {
        let err = provider().compile("let x = ;").unwrap_err();
        assert!(matches!(err, ScriptError::Compile { .. }));
    }

    #[test]
    fn test_header_injection() {
        let mut ctx = pre_context("/api");
        let verdict = run(
            &provider(),
            r#"headers["X-Trace"] = "injected";"#,
            &mut ctx,
        )
        .unwrap();

        assert!(matches!(verdict, ScriptVerdict::Continue));
        assert_eq!(ctx.request.headers.get("x-trace"), Some("injected"));
        assert_eq!(ctx.request.headers.get("x-existing"), Some("yes"));
    }

    #[test]
    fn test_read_only_method_and_query() {
        let mut ctx = pre_context("/api?user=alice");
        let verdict = run(
            &provider(),
            r#"
                if method == "GET" && query["user"] == "alice" {
                    headers["X-User"] = query["user"];
                }
            "#,
            &mut ctx,
        )
        .unwrap();

        assert!(matches!(verdict, ScriptVerdict::Continue));
        assert_eq!(ctx.request.headers.get("x-user"), Some("alice"));
    }

    #[test]
    fn test_respond_short_circuits() {
        let mut ctx = pre_context("/forbidden");
        let verdict = run(&provider(), r#"respond(403, "blocked");"#, &mut ctx).unwrap();

        match verdict {
            ScriptVerdict::ShortCircuit(response) => {
                assert_eq!(response.status, 403);
                assert_eq!(response.body, Bytes::from("blocked"));
            }
            other => panic!("expected short circuit, got {other:?}"),
        }
    }

    #[test]
    fn test_status_rewrite_in_post_phase() {
        let mut ctx = post_context(500, "upstream exploded");
        let verdict = run(
            &provider(),
            r#"
                if status == 500 {
                    status = 502;
                    body = "bad gateway";
                }
            "#,
            &mut ctx,
        )
        .unwrap();

        assert!(matches!(verdict, ScriptVerdict::Continue));
        let response = ctx.response.as_ref().unwrap();
        assert_eq!(response.status, 502);
        assert_eq!(response.body_string().unwrap(), "bad gateway");
    }

    #[test]
    fn test_runtime_error_normalized() {
        let mut ctx = pre_context("/api");
        let err = run(&provider(), r#"throw "deliberate";"#, &mut ctx).unwrap_err();
        assert!(matches!(err, ScriptError::Runtime { .. }));
    }

    #[test]
    fn test_attributes_round_trip() {
        let mut ctx = pre_context("/api");
        ctx.attributes
            .insert("seed".to_string(), serde_json::json!("value"));

        run(
            &provider(),
            r#"attributes["flag"] = attributes["seed"] + "!";"#,
            &mut ctx,
        )
        .unwrap();

        assert_eq!(ctx.attributes["flag"], serde_json::json!("value!"));
        assert_eq!(ctx.attributes["seed"], serde_json::json!("value"));
    }

    #[test]
    fn test_claims_bound_into_scope() {
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::json!({"sub": "alice"}).to_string());
        let token = format!("h.{payload}.s");

        let (parts, _) = http::Request::builder()
            .uri("/api")
            .header("authorization", format!("Bearer {token}"))
            .body(())
            .unwrap()
            .into_parts();
        let mut ctx = ExchangeContext::pre(&parts, Bytes::new(), 1024).unwrap();

        run(
            &provider(),
            r#"headers["X-Subject"] = claims["sub"];"#,
            &mut ctx,
        )
        .unwrap();

        assert_eq!(ctx.request.headers.get("x-subject"), Some("alice"));
    }

    #[test]
    fn test_helper_functions() {
        let mut ctx = pre_context("/api");
        run(
            &provider(),
            r#"
                headers["X-Encoded"] = base64_encode("hi");
                headers["X-Decoded"] = base64_decode("aGk=");
                headers["X-Id"] = uuid();
            "#,
            &mut ctx,
        )
        .unwrap();

        assert_eq!(ctx.request.headers.get("x-encoded"), Some("aGk="));
        assert_eq!(ctx.request.headers.get("x-decoded"), Some("hi"));
        assert_eq!(ctx.request.headers.get("x-id").unwrap().len(), 36);
    }

    #[test]
    fn test_non_utf8_header_survives_script_header_mutation() {
        let (mut parts, _) = http::Request::builder()
            .uri("/api")
            .body(())
            .unwrap()
            .into_parts();
        parts.headers.insert(
            "x-binary",
            http::HeaderValue::from_bytes(&[0xfe, 0xff]).unwrap(),
        );
        let mut ctx = ExchangeContext::pre(&parts, Bytes::new(), 1024).unwrap();

        run(
            &provider(),
            r#"headers["X-Trace"] = "injected";"#,
            &mut ctx,
        )
        .unwrap();

        assert_eq!(ctx.request.headers.get("x-trace"), Some("injected"));
        assert!(ctx.request.headers.contains("x-binary"));
        let map = ctx.request.headers.to_header_map().unwrap();
        assert_eq!(map.get("x-binary").unwrap().as_bytes(), &[0xfe, 0xff]);
    }

    #[test]
    fn test_body_rewrite() {
        let (parts, _) = http::Request::builder()
            .method(Method::POST)
            .uri("/api")
            .body(())
            .unwrap()
            .into_parts();
        let mut ctx =
            ExchangeContext::pre(&parts, Bytes::from("hello"), 1024).unwrap();

        run(&provider(), r#"body = body + " world";"#, &mut ctx).unwrap();
        assert_eq!(ctx.request.body_string().unwrap(), "hello world");
    }

    #[test]
    fn test_pre_raised_cancel_terminates_loop() {
        let mut ctx = pre_context("/api");
        let provider = RhaiProvider::with_limits(u64::MAX, 1024 * 1024);
        let artifact = provider.compile("while true {}").unwrap();

        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = provider.invoke(&artifact, &mut ctx, &cancel).unwrap_err();
        assert!(matches!(err, ScriptError::Runtime { .. }));
    }

    #[test]
    fn test_operation_limit_stops_runaway_scripts() {
        let mut ctx = pre_context("/api");
        let provider = RhaiProvider::with_limits(1_000, 1024 * 1024);
        let err = run(&provider, "while true {}", &mut ctx).unwrap_err();
        assert!(matches!(err, ScriptError::Runtime { .. }));
    }
}
