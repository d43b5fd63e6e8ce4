//! # Siphon Core
//!
//! Core types, traits, and error handling for the Siphon reverse proxy.
//!
//! This crate provides the foundational abstractions used throughout the
//! proxy:
//! - The [`Filter`] trait and [`Next`] chain continuation
//! - Error types
//! - The cross-filter [`Attributes`] bag

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod attributes;
pub mod error;
pub mod filter;

pub use attributes::Attributes;
pub use error::{Error, Result};
pub use filter::{Body, Filter, HandlerFn, Next};

// Re-export commonly used HTTP types
pub use bytes::Bytes;
pub use http::{Method, Request, Response, StatusCode};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::attributes::Attributes;
    pub use crate::error::{Error, Result};
    pub use crate::filter::{Body, Filter, Next};
}
