// crates/evs-server/src/error.rs
// Standardized error types for EverSession

use thiserror::Error;

/// Main error type for the evs library.
///
/// Tagged outcomes that are part of normal pipeline control flow
/// (`not_triggered`, `pending_ready`, ...) live on the outcome enums in
/// `compact::pipeline`; only genuine failures are errors.
#[derive(Error, Debug)]
pub enum EvsError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("timed out acquiring lock on {path}")]
    LockTimeout { path: String },

    #[error("timed out waiting for {path} to become stable")]
    BusyTimeout { path: String },

    #[error("transcript changed between plan and write")]
    AbortedGuard,

    #[error("rewrite would worsen validation: {0}")]
    AbortedValidation(String),

    #[error("selection no longer matches transcript: {0}")]
    SelectionMismatch(String),

    #[error("invalid pending-compact record: {0}")]
    InvalidPending(String),

    #[error("summarizer failed at tier {tier}: {message}")]
    SummarizerFailed { tier: String, message: String },

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown error: {0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using EvsError
pub type Result<T> = std::result::Result<T, EvsError>;

impl EvsError {
    /// Wrap an I/O error with the path that produced it.
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// True for the retryable summarizer failure kind.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SummarizerFailed { .. } | Self::Http(_) | Self::Llm(_))
    }
}

impl From<String> for EvsError {
    fn from(s: String) -> Self {
        EvsError::Other(s)
    }
}

/// Attach a path to a bare `io::Result`.
pub trait IoResultExt<T> {
    fn at(self, path: impl AsRef<std::path::Path>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at(self, path: impl AsRef<std::path::Path>) -> Result<T> {
        self.map_err(|e| EvsError::io(path, e))
    }
}
