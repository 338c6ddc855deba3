use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexerError>;

#[derive(Error, Debug)]
pub enum IndexerError {
    /// The catalog itself could not be read; aborts the whole run.
    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Vector store error: {0}")]
    VectorStoreError(#[from] catalog_vector_store::VectorStoreError),

    /// One catalog row cannot become a document; the row is skipped.
    #[error("Invalid product {id}: {reason}")]
    InvalidItem { id: i64, reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    pub(crate) fn into_catalog(self) -> Self {
        match self {
            Self::Catalog(_) => self,
            other => Self::Catalog(other.to_string()),
        }
    }
}
