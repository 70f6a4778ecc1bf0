use thiserror::Error;

// ── Error codes ─────────────────────────────────────────────────────
//
// Stable, machine-readable identifiers. Callers match on these —
// never on the human-readable message string.

/// Stable error code constants.
///
/// Codes never change; messages may be reworded.
pub mod error_code {
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
    pub const REFERENTIAL_VIOLATION: &str = "REFERENTIAL_VIOLATION";
    pub const STALE_CLAIM: &str = "STALE_CLAIM";
    pub const STORAGE_ERROR: &str = "STORAGE_ERROR";
    pub const INTERNAL: &str = "INTERNAL";
}

// ── ServiceError ────────────────────────────────────────────────────

/// Unified service error type used across all modules.
///
/// Each variant maps to a stable error code (see [`error_code`]).
/// Validation and referential errors are rejected before anything is
/// persisted; a `StaleClaim` means the caller no longer holds the claim it
/// thinks it holds and must discard its in-flight work; `Storage` is a
/// transient store failure — every mutation is a conditional single
/// statement, so retrying the whole call is safe.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Resource does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Input data is invalid. Rejected before persistence, never retried.
    #[error("{0}")]
    Validation(String),

    /// Dangling reference (e.g. a task pointing at a file record that does
    /// not exist). Rejected before persistence.
    #[error("{0}")]
    Referential(String),

    /// The caller's claim on a task was already lost (reclaimed or
    /// completed elsewhere). The caller must stop and discard its work.
    #[error("{0}")]
    StaleClaim(String),

    /// Storage backend failure.
    #[error("{0}")]
    Storage(String),

    /// Unexpected internal error.
    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable, machine-readable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceError::NotFound(_) => error_code::NOT_FOUND,
            ServiceError::Validation(_) => error_code::VALIDATION_FAILED,
            ServiceError::Referential(_) => error_code::REFERENTIAL_VIOLATION,
            ServiceError::StaleClaim(_) => error_code::STALE_CLAIM,
            ServiceError::Storage(_) => error_code::STORAGE_ERROR,
            ServiceError::Internal(_) => error_code::INTERNAL,
        }
    }

    /// Whether retrying the same call may succeed.
    ///
    /// Only storage failures are transient; everything else reflects a
    /// state the caller must react to, not wait out.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Storage(_))
    }
}
