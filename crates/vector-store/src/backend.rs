use crate::error::Result;
use crate::types::{RawRecord, RecordFields};
use async_trait::async_trait;

/// Vector index definition bound to a key prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub prefix: String,
    pub dimension: usize,
}

impl IndexSpec {
    pub fn key_for(&self, product_id: i64) -> String {
        format!("{}{}", self.prefix, product_id)
    }

    pub fn key_pattern(&self) -> String {
        format!("{}*", self.prefix)
    }
}

/// What a read found at one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordRead {
    Found(RawRecord),
    /// The key no longer exists.
    Missing,
    /// The key exists but cannot be read as a record, e.g. it holds a
    /// non-hash value.
    Unreadable(String),
}

impl RecordRead {
    pub(crate) fn from_hash(record: RawRecord) -> Self {
        if record.is_empty() {
            Self::Missing
        } else {
            Self::Found(record)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexCreation {
    Created,
    AlreadyExists,
}

/// Low-level access to a hash-record store with an optional vector-search
/// extension.
///
/// Implementations report a missing extension or index as
/// [`VectorStoreError::CapabilityUnsupported`](crate::VectorStoreError::CapabilityUnsupported)
/// and every other failure as-is.
#[async_trait]
pub trait RecordBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn ping(&self) -> Result<()>;

    async fn create_index(&self, spec: &IndexSpec) -> Result<IndexCreation>;

    /// Replace the whole record at `key` in one atomic step.
    async fn write_record(&self, key: &str, fields: &RecordFields) -> Result<()>;

    /// Read several records, one outcome per key in order. A key that
    /// cannot be read is reported in place; only transport failures fail the
    /// whole call.
    async fn read_records(&self, keys: &[String]) -> Result<Vec<RecordRead>>;

    async fn delete_record(&self, key: &str) -> Result<bool>;

    /// One cursor step over keys matching `pattern`. A returned cursor of 0
    /// ends the iteration.
    async fn scan_keys(&self, cursor: u64, pattern: &str, count: usize)
        -> Result<(u64, Vec<String>)>;

    /// Nearest neighbours of `query` (raw f32 blob) ordered by ascending
    /// cosine distance, returned as `(key, fields)` with the distance under
    /// the `score` field.
    async fn knn(
        &self,
        spec: &IndexSpec,
        query: &[u8],
        k: usize,
        fields: &[&str],
    ) -> Result<Vec<(String, RawRecord)>>;
}
