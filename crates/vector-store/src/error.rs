use thiserror::Error;

pub type Result<T> = std::result::Result<T, VectorStoreError>;

#[derive(Error, Debug)]
pub enum VectorStoreError {
    #[error("Embedding error: {0}")]
    EmbeddingError(String),

    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    /// The store has no vector-search extension (or the index is gone).
    /// Absorbed by the query engine, which switches to a scan.
    #[error("Vector index unavailable: {0}")]
    CapabilityUnsupported(String),

    #[error("Index probe failed: {0}")]
    IndexProbe(String),

    #[error("Malformed record {key}: {reason}")]
    MalformedRecord { key: String, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid vector dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("{0}")]
    Other(String),
}

impl VectorStoreError {
    pub fn malformed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            key: key.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn is_capability_unsupported(&self) -> bool {
        matches!(self, Self::CapabilityUnsupported(_))
    }
}
