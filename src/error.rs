use thiserror::Error;

/// Crate-wide error type. Component-level operations raise their own
/// narrower error (see `transaction::error::TransactionError`,
/// `lock::LockError`) and convert into this one at the library boundary.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("no frame available: all buffer pool frames are pinned")]
    NoFrameAvailable,

    #[error("page corruption: {0}")]
    Corruption(String),

    #[error("index error: {0}")]
    Index(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("invalid projection: expected {expected} columns, got {actual}")]
    InvalidProjection { expected: usize, actual: usize },

    #[error("lock error: {0}")]
    Lock(#[from] crate::lock::LockError),

    #[error("transaction error: {0}")]
    Transaction(#[from] crate::transaction::TransactionError),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("table already exists: {0}")]
    TableAlreadyExists(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl Clone for DbError {
    fn clone(&self) -> Self {
        match self {
            DbError::Io(e) => DbError::Storage(e.to_string()),
            DbError::Serialization(s) => DbError::Serialization(s.clone()),
            DbError::Storage(s) => DbError::Storage(s.clone()),
            DbError::NoFrameAvailable => DbError::NoFrameAvailable,
            DbError::Corruption(s) => DbError::Corruption(s.clone()),
            DbError::Index(s) => DbError::Index(s.clone()),
            DbError::DuplicateKey(s) => DbError::DuplicateKey(s.clone()),
            DbError::NotFound(s) => DbError::NotFound(s.clone()),
            DbError::InvalidProjection { expected, actual } => DbError::InvalidProjection {
                expected: *expected,
                actual: *actual,
            },
            DbError::Lock(e) => DbError::Lock(e.clone()),
            DbError::Transaction(e) => DbError::Transaction(e.clone()),
            DbError::TableNotFound(s) => DbError::TableNotFound(s.clone()),
            DbError::TableAlreadyExists(s) => DbError::TableAlreadyExists(s.clone()),
            DbError::Configuration(s) => DbError::Configuration(s.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl DbError {
    /// True when retrying the whole transaction might succeed (no durable
    /// state was left inconsistent).
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DbError::Lock(_) | DbError::Transaction(_) | DbError::NoFrameAvailable
        )
    }
}
