//! Script source model and cache fingerprinting

use crate::error::{Result, ScriptError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Execution phase of a route script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Run before the request is forwarded upstream
    #[default]
    Pre,
    /// Run after the upstream response is received
    Post,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pre => write!(f, "pre"),
            Self::Post => write!(f, "post"),
        }
    }
}

/// Where the script text comes from (inline or file-based)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptCode {
    /// Inline script text
    Inline {
        /// Script text
        #[serde(rename = "script")]
        text: String,
        /// Optional name for logs and diagnostics
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Script loaded from a file path
    File {
        /// Path to the script file
        #[serde(rename = "script_file")]
        path: PathBuf,
    },
}

impl ScriptCode {
    /// Resolve the script text, reading the file for file-based sources
    pub async fn resolve(&self) -> Result<String> {
        match self {
            Self::Inline { text, .. } => Ok(text.clone()),
            Self::File { path } => {
                tokio::fs::read_to_string(path).await.map_err(|e| ScriptError::Io {
                    message: format!("failed to read script file {}: {}", path.display(), e),
                })
            }
        }
    }

    /// Descriptive name for logging
    pub fn name(&self) -> String {
        match self {
            Self::Inline { name, .. } => name.clone().unwrap_or_else(|| "inline".to_string()),
            Self::File { path } => path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unknown")
                .to_string(),
        }
    }
}

/// A script attached to a route
///
/// Immutable once attached. Cache identity is the (language, text)
/// pair, never the route: two routes sharing identical text and
/// language share one compiled artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptSource {
    /// Language identifier, matched against a registered provider
    /// (defaults to `rhai`)
    #[serde(default = "default_language")]
    pub language: String,
    /// Script text or file reference
    #[serde(flatten)]
    pub code: ScriptCode,
    /// Execution phase
    #[serde(default)]
    pub phase: Phase,
    /// Per-route options passed through to the script scope
    #[serde(default)]
    pub options: HashMap<String, String>,
}

fn default_language() -> String {
    "rhai".to_string()
}

impl ScriptSource {
    /// Create an inline source for the given language
    pub fn inline(language: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            code: ScriptCode::Inline {
                text: text.into(),
                name: None,
            },
            phase: Phase::Pre,
            options: HashMap::new(),
        }
    }

    /// Create a file-based source for the given language
    pub fn file(language: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            language: language.into(),
            code: ScriptCode::File { path: path.into() },
            phase: Phase::Pre,
            options: HashMap::new(),
        }
    }

    /// Set the execution phase
    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    /// Descriptive name for logging
    pub fn name(&self) -> String {
        self.code.name()
    }
}

/// Cache key derived from a script's language and exact text
///
/// A collision would execute the wrong script, so the key is a full
/// SHA-256 digest rather than a fast non-cryptographic hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Compute the fingerprint of (language, text)
    pub fn of(language: &str, text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(language.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        Self(hasher.finalize().into())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint(")?;
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "…)")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}
