//! Exchange context adapter
//!
//! Scripts never see the transport's request/response objects. They get
//! an [`ExchangeContext`]: a per-request projection of the exchange with
//! exactly the mutation surface scripts are allowed: headers, body and
//! attributes (plus status on the response side). Method and URI are
//! read-only. The context is created fresh per request, handed to one
//! script invocation, and the surviving mutations are written back into
//! the exchange when the filter resumes the chain.

use crate::error::{Result, ScriptError};
use crate::source::Phase;
use base64::Engine as _;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, AUTHORIZATION};
use http::{HeaderMap, Method, StatusCode, Uri};
use std::collections::HashMap;
use std::str::FromStr;

/// Case-insensitive, multi-valued header map exposed to scripts
///
/// Keys are normalized to lowercase; values keep insertion order.
/// Values that are not valid UTF-8 are hidden from the script view but
/// preserved, so an untouched binary header survives writeback intact.
#[derive(Debug, Clone, Default)]
pub struct HeaderBag {
    entries: HashMap<String, Vec<String>>,
    opaque: HashMap<String, Vec<HeaderValue>>,
}

impl HeaderBag {
    /// Create an empty bag
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an [`http::HeaderMap`]; values that are not valid
    /// UTF-8 are kept aside as opaque entries (scripts operate on
    /// strings) and restored by [`to_header_map`](Self::to_header_map)
    pub fn from_header_map(map: &HeaderMap) -> Self {
        let mut bag = Self::new();
        for (name, value) in map.iter() {
            match value.to_str() {
                Ok(value) => bag.append(name.as_str(), value),
                Err(_) => bag
                    .opaque
                    .entry(name.as_str().to_ascii_lowercase())
                    .or_default()
                    .push(value.clone()),
            }
        }
        bag
    }

    /// Convert back into an [`http::HeaderMap`], rejecting names or
    /// values a script produced that are not valid HTTP. Opaque entries
    /// come back unchanged unless their name was removed or replaced.
    pub fn to_header_map(&self) -> Result<HeaderMap> {
        let mut map = HeaderMap::new();
        for (name, values) in &self.entries {
            let name = HeaderName::from_str(name)
                .map_err(|e| ScriptError::runtime(format!("invalid header name '{name}': {e}")))?;
            for value in values {
                let value = HeaderValue::from_str(value).map_err(|e| {
                    ScriptError::runtime(format!("invalid value for header '{name}': {e}"))
                })?;
                map.append(name.clone(), value);
            }
        }
        for (name, values) in &self.opaque {
            let name = HeaderName::from_str(name)
                .map_err(|e| ScriptError::runtime(format!("invalid header name '{name}': {e}")))?;
            for value in values {
                map.append(name.clone(), value.clone());
            }
        }
        Ok(map)
    }

    /// Carry the opaque entries of `from` into this bag, for writeback
    /// paths that rebuild the string view from scratch. Names already
    /// present as opaque entries here win.
    pub(crate) fn inherit_opaque(&mut self, from: &HeaderBag) {
        for (name, values) in &from.opaque {
            self.opaque
                .entry(name.clone())
                .or_insert_with(|| values.clone());
        }
    }

    /// First value of a header, if present
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    /// All values of a header
    pub fn get_all(&self, name: &str) -> &[String] {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Replace a header with a single value
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let name = name.to_ascii_lowercase();
        self.opaque.remove(&name);
        self.entries.insert(name, vec![value.into()]);
    }

    /// Replace a header with multiple values
    pub fn set_all(&mut self, name: &str, values: Vec<String>) {
        let name = name.to_ascii_lowercase();
        self.opaque.remove(&name);
        self.entries.insert(name, values);
    }

    /// Append a value to a header
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.entries
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// Remove a header entirely, opaque values included
    pub fn remove(&mut self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        let had_entries = self.entries.remove(&name).is_some();
        self.opaque.remove(&name).is_some() || had_entries
    }

    /// Whether a header is present
    pub fn contains(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.entries.contains_key(&name) || self.opaque.contains_key(&name)
    }

    /// Number of distinct header names
    pub fn len(&self) -> usize {
        self.entries.len()
            + self
                .opaque
                .keys()
                .filter(|name| !self.entries.contains_key(*name))
                .count()
    }

    /// Whether the bag is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.opaque.is_empty()
    }

    /// Iterate over (lowercase name, values) pairs
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.entries.iter()
    }
}

/// Read-mostly request side of the context
#[derive(Debug, Clone)]
pub struct RequestView {
    method: Method,
    uri: Uri,
    query: HashMap<String, Vec<String>>,
    /// Request headers; mutations are written back in the PRE phase
    pub headers: HeaderBag,
    /// Request body, replaceable by the script
    pub body: Option<Bytes>,
    claims: Option<serde_json::Value>,
}

impl RequestView {
    fn new(parts: &http::request::Parts, body: Option<Bytes>) -> Self {
        let query = parts
            .uri
            .query()
            .map(|q| {
                let mut map: HashMap<String, Vec<String>> = HashMap::new();
                for (k, v) in form_urlencoded::parse(q.as_bytes()) {
                    map.entry(k.into_owned()).or_default().push(v.into_owned());
                }
                map
            })
            .unwrap_or_default();

        Self {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            query,
            headers: HeaderBag::from_header_map(&parts.headers),
            body,
            claims: None,
        }
    }

    /// Request method (read-only)
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request URI (read-only)
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Request path (read-only)
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Query parameters parsed from the URI (read-only)
    pub fn query(&self) -> &HashMap<String, Vec<String>> {
        &self.query
    }

    /// First value of a query parameter
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).and_then(|v| v.first()).map(String::as_str)
    }

    /// Body as UTF-8 text, if present and valid
    pub fn body_string(&self) -> Option<String> {
        self.body
            .as_ref()
            .and_then(|b| std::str::from_utf8(b).ok())
            .map(str::to_owned)
    }

    /// Replace the body
    pub fn set_body_string(&mut self, body: String) {
        self.body = Some(Bytes::from(body));
    }

    /// Claims from the bearer token in the `Authorization` header.
    ///
    /// The payload segment is decoded without signature verification;
    /// an absent or unparseable token yields an empty object. Parsed at
    /// most once per context.
    pub fn claims(&mut self) -> &serde_json::Value {
        let headers = &self.headers;
        self.claims.get_or_insert_with(|| {
            headers
                .get(AUTHORIZATION.as_str())
                .and_then(|auth| auth.strip_prefix("Bearer "))
                .and_then(decode_jwt_claims)
                .unwrap_or_else(|| serde_json::json!({}))
        })
    }

    /// Single claim by dot-separated path, descending objects and
    /// arrays (numeric segments index arrays): `claim("roles.0")`
    pub fn claim(&mut self, path: &str) -> Option<serde_json::Value> {
        let mut value = self.claims().clone();
        for part in path.split('.') {
            value = match value {
                serde_json::Value::Object(mut map) => map.remove(part)?,
                serde_json::Value::Array(mut items) => {
                    let idx: usize = part.parse().ok()?;
                    if idx < items.len() {
                        items.swap_remove(idx)
                    } else {
                        return None;
                    }
                }
                _ => return None,
            };
        }
        Some(value)
    }
}

fn decode_jwt_claims(token: &str) -> Option<serde_json::Value> {
    let payload = token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.as_bytes())
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Mutable response side of the context, present in the POST phase only
#[derive(Debug, Clone)]
pub struct ResponseView {
    /// Response status code
    pub status: u16,
    /// Response headers
    pub headers: HeaderBag,
    /// Response body, replaceable by the script
    pub body: Option<Bytes>,
}

impl ResponseView {
    fn new(parts: &http::response::Parts, body: Option<Bytes>) -> Self {
        Self {
            status: parts.status.as_u16(),
            headers: HeaderBag::from_header_map(&parts.headers),
            body,
        }
    }

    /// Body as UTF-8 text, if present and valid
    pub fn body_string(&self) -> Option<String> {
        self.body
            .as_ref()
            .and_then(|b| std::str::from_utf8(b).ok())
            .map(str::to_owned)
    }

    /// Replace the body
    pub fn set_body_string(&mut self, body: String) {
        self.body = Some(Bytes::from(body));
    }
}

/// Per-request projection of one exchange, bound into a script's scope
///
/// Never shared across requests or across invocations.
#[derive(Debug, Clone)]
pub struct ExchangeContext {
    phase: Phase,
    /// Request side
    pub request: RequestView,
    /// Response side (POST phase only)
    pub response: Option<ResponseView>,
    /// Cross-filter attribute bag, written back to the pipeline
    pub attributes: HashMap<String, serde_json::Value>,
    /// Per-route script options, read-only for the script
    pub options: HashMap<String, String>,
}

impl ExchangeContext {
    /// Build a PRE-phase context from request parts and a fully
    /// buffered body.
    ///
    /// Fails with [`ScriptError::BodyTooLarge`] instead of exposing a
    /// body beyond `max_body_bytes` to the script.
    pub fn pre(
        parts: &http::request::Parts,
        body: Bytes,
        max_body_bytes: usize,
    ) -> Result<Self> {
        let body = check_body(body, max_body_bytes)?;
        Ok(Self {
            phase: Phase::Pre,
            request: RequestView::new(parts, body),
            response: None,
            attributes: HashMap::new(),
            options: HashMap::new(),
        })
    }

    /// Build a POST-phase context. The request side carries headers and
    /// URI only; its body is not re-buffered after the upstream call.
    pub fn post(
        req_parts: &http::request::Parts,
        resp_parts: &http::response::Parts,
        resp_body: Bytes,
        max_body_bytes: usize,
    ) -> Result<Self> {
        let body = check_body(resp_body, max_body_bytes)?;
        Ok(Self {
            phase: Phase::Post,
            request: RequestView::new(req_parts, None),
            response: Some(ResponseView::new(resp_parts, body)),
            attributes: HashMap::new(),
            options: HashMap::new(),
        })
    }

    /// Phase this context was built for
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Seed the attribute bag from the surrounding pipeline
    pub fn with_attributes(mut self, attributes: HashMap<String, serde_json::Value>) -> Self {
        self.attributes = attributes;
        self
    }

    /// Write request-side mutations back into the exchange, returning
    /// the (possibly replaced) body. PRE phase only.
    pub fn apply_to_request(&self, parts: &mut http::request::Parts) -> Result<Bytes> {
        parts.headers = self.request.headers.to_header_map()?;
        Ok(self.request.body.clone().unwrap_or_default())
    }

    /// Write response-side mutations back into the exchange, returning
    /// the (possibly replaced) body. POST phase only.
    pub fn apply_to_response(&self, parts: &mut http::response::Parts) -> Result<Bytes> {
        let response = self
            .response
            .as_ref()
            .ok_or_else(|| ScriptError::runtime("no response view in PRE-phase context"))?;
        // Validate everything before mutating anything
        let headers = response.headers.to_header_map()?;
        parts.status = StatusCode::from_u16(response.status)
            .map_err(|_| ScriptError::runtime(format!("invalid status code {}", response.status)))?;
        parts.headers = headers;
        Ok(response.body.clone().unwrap_or_default())
    }
}

fn check_body(body: Bytes, max_body_bytes: usize) -> Result<Option<Bytes>> {
    if body.is_empty() {
        Ok(None)
    } else if body.len() > max_body_bytes {
        Err(ScriptError::BodyTooLarge {
            size: body.len(),
            limit: max_body_bytes,
        })
    } else {
        Ok(Some(body))
    }
}
