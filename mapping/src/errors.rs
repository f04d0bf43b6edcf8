use crate::types::FilterCombination;
use serde::Serialize;
use shared::deadline::Elapsed;

/// Result type alias for mapping operations
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

/// Stable codes calling layers map to transport status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Validation,
    NotFound,
    Conflict,
    Unauthorized,
    Inconsistency,
    DeadlineExceeded,
    PartialWrite,
    Transport,
}

impl ErrorCode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Inconsistency => "INCONSISTENCY",
            ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorCode::PartialWrite => "PARTIAL_WRITE",
            ErrorCode::Transport => "TRANSPORT",
        }
    }
}

/// Failures of the persistent store itself. A failed write did not apply.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A propagation step failed partway. Logged and retried, never returned
    /// to the caller of the triggering mutation.
    #[error("inconsistent state: {0}")]
    Inconsistency(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Some upserts of a fan-out write failed. Completed upserts stay applied;
    /// retrying with `remaining` finishes the mapping.
    #[error("mapping partially written: {written} entries written, {} remaining", .remaining.len())]
    PartialFanOut {
        written: usize,
        remaining: Vec<FilterCombination>,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: &str) -> Self {
        CoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::Validation(_) => ErrorCode::Validation,
            CoreError::NotFound { .. } => ErrorCode::NotFound,
            CoreError::Conflict(_) => ErrorCode::Conflict,
            CoreError::Unauthorized(_) => ErrorCode::Unauthorized,
            CoreError::Inconsistency(_) => ErrorCode::Inconsistency,
            CoreError::DeadlineExceeded => ErrorCode::DeadlineExceeded,
            CoreError::PartialFanOut { .. } => ErrorCode::PartialWrite,
            CoreError::Store(_) => ErrorCode::Transport,
        }
    }
}

impl From<Elapsed> for CoreError {
    fn from(_: Elapsed) -> Self {
        CoreError::DeadlineExceeded
    }
}
