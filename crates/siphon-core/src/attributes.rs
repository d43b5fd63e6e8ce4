//! Per-exchange attribute bag shared across the filter chain
//!
//! Filters communicate out-of-band through a JSON-valued map carried in
//! the request's [`http::Extensions`]. A script filter writes values
//! here and a later filter (or the terminal handler) reads them.

use std::collections::HashMap;

/// Cross-filter attribute bag for one exchange
#[derive(Debug, Clone, Default)]
pub struct Attributes(HashMap<String, serde_json::Value>);

impl Attributes {
    /// Create an empty attribute bag
    pub fn new() -> Self {
        Self::default()
    }

    /// Get an attribute value
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Set an attribute value, returning the previous one if present
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Option<serde_json::Value> {
        self.0.insert(key.into(), value)
    }

    /// Remove an attribute
    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.0.remove(key)
    }

    /// Number of attributes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the bag is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over entries
    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }

    /// Retrieve the bag from a request's extensions, if any filter has
    /// attached one
    pub fn of<B>(req: &http::Request<B>) -> Option<&Attributes> {
        req.extensions().get::<Attributes>()
    }

    /// Attach (or replace) the bag on a request
    pub fn attach<B>(self, req: &mut http::Request<B>) {
        req.extensions_mut().insert(self);
    }
}

impl From<HashMap<String, serde_json::Value>> for Attributes {
    fn from(map: HashMap<String, serde_json::Value>) -> Self {
        Self(map)
    }
}

impl From<Attributes> for HashMap<String, serde_json::Value> {
    fn from(attrs: Attributes) -> Self {
        attrs.0
    }
}
