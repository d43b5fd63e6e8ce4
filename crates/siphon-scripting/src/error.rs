//! Script execution error types
//!
//! Every failure a script can cause is normalized into [`ScriptError`]
//! before it leaves this crate. The enum is `Clone` because compile
//! failures are cached alongside compiled artifacts and replayed to
//! later callers.

use http::StatusCode;

/// Script execution result type
pub type Result<T, E = ScriptError> = std::result::Result<T, E>;

/// Script execution error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    /// Script failed to parse/compile
    #[error("compile error in {language} script: {message}{}", fmt_line(.line))]
    Compile {
        /// Language the script declared
        language: String,
        /// Compiler diagnostic
        message: String,
        /// Line number if the compiler reported one
        line: Option<usize>,
    },

    /// No provider registered for the declared language
    #[error("unsupported script language: {language}")]
    UnsupportedLanguage {
        /// Language the script declared
        language: String,
    },

    /// Script raised an error while running
    #[error("script runtime error: {message}")]
    Runtime {
        /// Error message
        message: String,
    },

    /// Script exceeded its execution budget
    #[error("script timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured budget in milliseconds
        timeout_ms: u64,
    },

    /// Request or response body exceeds the configured in-memory limit
    #[error("body of {size} bytes exceeds script limit of {limit} bytes")]
    BodyTooLarge {
        /// Actual body size
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// Executor worker pool and queue are saturated
    #[error("script executor overloaded")]
    Overloaded,

    /// Failed to load the script source (file-based scripts)
    #[error("script I/O error: {message}")]
    Io {
        /// Error message
        message: String,
    },
}

fn fmt_line(line: &Option<usize>) -> String {
    match line {
        Some(line) => format!(" at line {line}"),
        None => String::new(),
    }
}

impl ScriptError {
    /// Create a compile error without position information
    pub fn compile(language: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Compile {
            language: language.into(),
            message: message.into(),
            line: None,
        }
    }

    /// Create a runtime error
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// HTTP status a failed execution surfaces as when the filter chain
    /// terminates on it
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Compile { .. }
            | Self::UnsupportedLanguage { .. }
            | Self::Runtime { .. }
            | Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<std::io::Error> for ScriptError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}
