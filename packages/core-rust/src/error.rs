//! Structured error kinds surfaced to the API layer.
//!
//! Every fallible control-plane operation returns one of five kinds. The
//! (out-of-scope) HTTP layer maps `code()` onto its JSON envelope; the kinds
//! therefore stay coarse and carry a human-readable message.

use thiserror::Error;

/// Control-plane error, classified by kind.
#[derive(Debug, Error)]
pub enum Error {
    /// Validation failure: malformed UUID, unknown enum value, non-positive
    /// TTL, sub-minimum update interval, conflicting source type/content,
    /// uncompilable regex, invalid region code.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The target entity (platform, subscription, lease, rule, node) does
    /// not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique-name collision, or an attempt to delete a reserved entity.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A required subsystem is not running or not wired (flush worker,
    /// outbound builder).
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Store commit failure after retries, or another unexpected condition.
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable machine-readable code for the API layer.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;
