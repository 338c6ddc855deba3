use thiserror::Error;

pub type Result<T> = std::result::Result<T, SearchError>;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Vector store error: {0}")]
    VectorStoreError(#[from] catalog_vector_store::VectorStoreError),

    #[error("Empty query")]
    EmptyQuery,

    #[error("k must be between {min} and {max}, got {k}")]
    InvalidLimit { k: usize, min: usize, max: usize },
}

impl SearchError {
    /// Caller mistakes, rejected before any store access.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::EmptyQuery | Self::InvalidLimit { .. })
    }
}
