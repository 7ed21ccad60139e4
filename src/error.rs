//! Error types for Larder
//!
//! All modules use `LarderResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Larder operations
pub type LarderResult<T> = Result<T, LarderError>;

/// All errors that can occur in Larder
#[derive(Error, Debug)]
pub enum LarderError {
    // Cache access errors
    #[error("Cache is empty: {0}")]
    Empty(String),

    #[error("Refresh cancelled")]
    Cancelled,

    #[error("Computation blocked on an unready dependency")]
    Blocked,

    #[error("Persisted failure (reconstructed): {text}")]
    Cached { text: String },

    // Definition errors
    #[error("Duplicate cache identity: {0}")]
    DuplicateIdentity(String),

    #[error("Invalid cache definition for {cache}: {reason}")]
    Definition { cache: String, reason: String },

    #[error("Invalid cache policy for {cache}: {reason}")]
    Policy { cache: String, reason: String },

    // Ledger errors
    #[error("Dependency not declared by linker: {0}")]
    UndeclaredDependency(String),

    #[error("Parameter not declared by linker: {0}")]
    UndeclaredParameter(String),

    // Supplier errors
    #[error("Supplier failed for {cache}: {reason}")]
    Supply { cache: String, reason: String },

    #[error("Artifact was not committed before the supplier returned")]
    UncommittedArtifact,

    #[error("Artifact is read-only: {0}")]
    ArtifactReadonly(PathBuf),

    #[error("Artifact file missing: {0}")]
    ArtifactMissing(PathBuf),

    // Storage errors
    #[error("Corrupt cache metadata at {path}: {reason}")]
    CorruptMetadata { path: PathBuf, reason: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LarderError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a supplier error
    pub fn supply(cache: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Supply {
            cache: cache.into(),
            reason: reason.into(),
        }
    }

    /// Check whether the error is an expected, log-suppressed condition.
    ///
    /// Empty caches, cancellations, blocked computations, and failures that
    /// merely replay an already-persisted upstream failure are part of normal
    /// operation and must not spam the log on every cascade.
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            Self::Empty(_) | Self::Cancelled | Self::Blocked | Self::Cached { .. }
        )
    }

    /// Render the error as text suitable for persisting into a snapshot.
    ///
    /// Walks the source chain so that the persisted text carries root causes,
    /// mirroring what a live backtrace-bearing error would show.
    pub fn persisted_text(&self) -> String {
        let mut text = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            text.push_str("\nCaused by: ");
            text.push_str(&cause.to_string());
            source = cause.source();
        }
        text
    }
}
