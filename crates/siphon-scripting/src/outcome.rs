//! Execution outcome model
//!
//! One [`ExecutionOutcome`] is produced per script execution and
//! consumed exactly once by the gateway filter that requested it.

use crate::context::HeaderBag;
use crate::error::ScriptError;
use bytes::Bytes;

/// Response a script asked the chain to return immediately
#[derive(Debug, Clone)]
pub struct ScriptResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: HeaderBag,
    /// Response body
    pub body: Bytes,
}

impl ScriptResponse {
    /// Create a response with a status and text body
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderBag::new(),
            body: body.into(),
        }
    }
}

/// What a compiled script decided, before executor-level error handling
#[derive(Debug, Clone)]
pub enum ScriptVerdict {
    /// Script completed normally; the chain continues
    Continue,
    /// Script asked to respond immediately, bypassing the upstream call
    ShortCircuit(ScriptResponse),
}

/// Result of one script execution as seen by the filter chain
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// Forward the (possibly mutated) exchange to the next chain link
    Continue,
    /// Terminate the chain with the given response
    ShortCircuit(ScriptResponse),
    /// The execution failed; the chain terminates with the mapped status
    Failed(ScriptError),
}

impl ExecutionOutcome {
    /// Whether this outcome lets the chain continue
    pub fn is_continue(&self) -> bool {
        matches!(self, Self::Continue)
    }
}

impl From<ScriptVerdict> for ExecutionOutcome {
    fn from(verdict: ScriptVerdict) -> Self {
        match verdict {
            ScriptVerdict::Continue => Self::Continue,
            ScriptVerdict::ShortCircuit(response) => Self::ShortCircuit(response),
        }
    }
}
