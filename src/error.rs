use thiserror::Error;

/// Failure of a single generator call.
///
/// Only `Unavailable` is worth retrying right away; the other two kinds mean
/// the generator answered but the answer can't be used.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("generator unavailable: {0}")]
    Unavailable(String),

    #[error("malformed generator output: {0}")]
    Malformed(String),

    #[error("generator output violates schema: {0}")]
    SchemaViolation(String),
}

impl GenerationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GenerationError::Unavailable(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GenerationError::Unavailable(_) => "unavailable",
            GenerationError::Malformed(_) => "malformed",
            GenerationError::SchemaViolation(_) => "schema_violation",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("insight for '{0}' already exists")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database not initialized, run 'insights init' first")]
    NotInitialized,

    #[error("task join error: {0}")]
    Join(String),
}

/// Errors surfaced by the caller-facing operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("user has not selected an industry yet")]
    NotOnboarded,

    #[error("invalid industry: {0}")]
    InvalidIndustry(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Whether the same call could succeed if repeated later.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Generation(e) => e.is_retryable(),
            _ => false,
        }
    }
}
