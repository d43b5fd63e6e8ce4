//! Gateway filter trait and chain continuation

use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use std::fmt;
use std::sync::Arc;

/// Body type alias
///
/// Siphon buffers exchange bodies; filters see them fully materialized.
pub type Body = Full<Bytes>;

/// A unit in a route's filter chain
///
/// Filters run in insertion order. A filter may forward the request via
/// [`Next::run`], rewrite it first, or short-circuit by returning a
/// response without calling `next`.
#[async_trait]
pub trait Filter: Send + Sync + fmt::Debug {
    /// Process a request and produce a response, usually by delegating
    /// to the rest of the chain.
    async fn call(&self, req: Request<Body>, next: Next) -> Result<Response<Body>>;
}

/// Type alias for the terminal handler at the end of a chain
pub type HandlerFn = Box<
    dyn Fn(
            Request<Body>,
        )
            -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Response<Body>>> + Send>>
        + Send
        + Sync,
>;

/// The remainder of the filter chain from one filter's point of view
pub struct Next {
    chain: Arc<[Arc<dyn Filter>]>,
    index: usize,
    handler: Option<Arc<HandlerFn>>,
}

impl Next {
    /// Create a continuation over a filter chain with no terminal handler
    pub fn new(chain: Arc<[Arc<dyn Filter>]>) -> Self {
        Self {
            chain,
            index: 0,
            handler: None,
        }
    }

    /// Create a continuation that ends in `handler` (typically the
    /// upstream proxy call)
    pub fn with_handler(chain: Arc<[Arc<dyn Filter>]>, handler: HandlerFn) -> Self {
        Self {
            chain,
            index: 0,
            handler: Some(Arc::new(handler)),
        }
    }

    /// Run the next filter, or the terminal handler once the chain is
    /// exhausted
    pub async fn run(self, req: Request<Body>) -> Result<Response<Body>> {
        if let Some(filter) = self.chain.get(self.index) {
            let next = Self {
                chain: Arc::clone(&self.chain),
                index: self.index + 1,
                handler: self.handler.clone(),
            };
            filter.call(req, next).await
        } else if let Some(handler) = self.handler {
            handler(req).await
        } else {
            Err(Error::Internal(
                "Filter chain completed without handler".to_string(),
            ))
        }
    }
}

impl Clone for Next {
    fn clone(&self) -> Self {
        Self {
            chain: Arc::clone(&self.chain),
            index: self.index,
            handler: self.handler.clone(),
        }
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("remaining", &(self.chain.len() - self.index))
            .finish()
    }
}
