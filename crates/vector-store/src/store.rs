use crate::backend::{IndexCreation, IndexSpec, RecordBackend, RecordRead};
use crate::error::{Result, VectorStoreError};
use crate::types::{
    encode_embedding, id_from_key, IndexCapability, ProductDocument, RawRecord, SearchHit,
    KNN_RETURN_FIELDS,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::OnceCell;

/// Product documents keyed by `prefix + product_id`, plus the optional
/// vector index over them.
pub struct ProductStore {
    backend: Arc<dyn RecordBackend>,
    index: IndexSpec,
    capability: OnceCell<IndexCapability>,
    /// Latest retry outcome after a failed first attempt.
    retried: RwLock<Option<IndexCapability>>,
    downgraded: AtomicBool,
}

/// One item yielded by a store scan.
#[derive(Debug, Clone, PartialEq)]
pub enum ScannedRecord {
    Document(ProductDocument),
    Malformed { key: String, reason: String },
}

impl ScannedRecord {
    fn decode(key: String, prefix: &str, raw: &RawRecord) -> Self {
        match ProductDocument::from_fields(&key, prefix, raw) {
            Ok(doc) => Self::Document(doc),
            Err(VectorStoreError::MalformedRecord { key, reason }) => {
                Self::Malformed { key, reason }
            }
            Err(other) => Self::Malformed {
                key,
                reason: other.to_string(),
            },
        }
    }
}

impl ProductStore {
    pub fn new(backend: Arc<dyn RecordBackend>, index: IndexSpec) -> Self {
        Self {
            backend,
            index,
            capability: OnceCell::new(),
            retried: RwLock::new(None),
            downgraded: AtomicBool::new(false),
        }
    }

    pub fn index_spec(&self) -> &IndexSpec {
        &self.index
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn key_for(&self, product_id: i64) -> String {
        self.index.key_for(product_id)
    }

    pub async fn ping(&self) -> Result<()> {
        self.backend.ping().await
    }

    /// Create the vector index on first call and cache the outcome for the
    /// lifetime of this store. An existing index counts as supported and a
    /// missing extension as unsupported; any other failure is cached as
    /// `Error` and returned to the caller.
    pub async fn ensure_index(&self) -> Result<IndexCapability> {
        let first = self
            .capability
            .get_or_init(|| async { self.probe_index().await })
            .await;
        match self.capability().unwrap_or_else(|| first.clone()) {
            IndexCapability::Error(message) => Err(VectorStoreError::IndexProbe(message)),
            capability => Ok(capability),
        }
    }

    /// Attempt index creation again while the cached outcome is a failure
    /// other than a missing extension. Each call makes at most one attempt;
    /// `None` once the outcome is settled.
    pub async fn retry_index_setup(&self) -> Option<IndexCapability> {
        if !matches!(self.capability(), Some(IndexCapability::Error(_))) {
            return None;
        }
        log::info!("Retrying vector index setup for {}", self.index.name);
        let capability = self.probe_index().await;
        *self.retried.write().unwrap_or_else(PoisonError::into_inner) = Some(capability.clone());
        Some(capability)
    }

    async fn probe_index(&self) -> IndexCapability {
        match self.backend.create_index(&self.index).await {
            Ok(IndexCreation::Created) => {
                log::info!(
                    "Created vector index {} over {}*",
                    self.index.name,
                    self.index.prefix
                );
                IndexCapability::Supported
            }
            Ok(IndexCreation::AlreadyExists) => {
                log::debug!("Vector index {} already exists", self.index.name);
                IndexCapability::Supported
            }
            Err(VectorStoreError::CapabilityUnsupported(reason)) => {
                log::warn!(
                    "Vector index extension unavailable on {} ({reason}); searches will scan",
                    self.backend.name()
                );
                IndexCapability::Unsupported
            }
            Err(err) => {
                log::error!("Vector index probe failed: {err}");
                IndexCapability::Error(err.to_string())
            }
        }
    }

    /// Cached capability; `None` until [`ensure_index`](Self::ensure_index)
    /// has run. A retried setup replaces a failed first attempt and a
    /// runtime downgrade overrides both.
    pub fn capability(&self) -> Option<IndexCapability> {
        if self.downgraded.load(Ordering::Acquire) {
            return Some(IndexCapability::Unsupported);
        }
        let retried = self.retried.read().unwrap_or_else(PoisonError::into_inner);
        retried.as_ref().or_else(|| self.capability.get()).cloned()
    }

    /// Record that the index turned out to be unusable at query time.
    pub fn mark_index_unsupported(&self) {
        if !self.downgraded.swap(true, Ordering::AcqRel) {
            log::warn!(
                "Vector index {} unavailable; switching to scan for this process",
                self.index.name
            );
        }
    }

    /// Full overwrite of one product record.
    pub async fn upsert(&self, doc: &ProductDocument) -> Result<()> {
        if doc.embedding.len() != self.index.dimension {
            return Err(VectorStoreError::InvalidDimension {
                expected: self.index.dimension,
                actual: doc.embedding.len(),
            });
        }
        let key = self.key_for(doc.product_id);
        self.backend.write_record(&key, &doc.to_fields()).await
    }

    pub async fn get(&self, product_id: i64) -> Result<Option<ProductDocument>> {
        let key = self.key_for(product_id);
        let mut reads = self.backend.read_records(std::slice::from_ref(&key)).await?;
        match reads.pop() {
            Some(RecordRead::Found(raw)) => {
                ProductDocument::from_fields(&key, &self.index.prefix, &raw).map(Some)
            }
            Some(RecordRead::Unreadable(reason)) => Err(VectorStoreError::malformed(key, reason)),
            Some(RecordRead::Missing) | None => Ok(None),
        }
    }

    pub async fn delete(&self, product_id: i64) -> Result<bool> {
        self.backend.delete_record(&self.key_for(product_id)).await
    }

    /// Lazy, restartable iteration over every record under the prefix.
    pub fn scan_all(&self, page_size: usize) -> ProductScan<'_> {
        ProductScan {
            store: self,
            pattern: self.index.key_pattern(),
            page_size: page_size.max(1),
            cursor: 0,
            finished: false,
        }
    }

    /// Ids of every stored product whose key carries a numeric suffix.
    pub async fn stored_ids(&self, page_size: usize) -> Result<Vec<i64>> {
        let pattern = self.index.key_pattern();
        let mut ids = Vec::new();
        let mut cursor = 0;
        loop {
            let (next, keys) = self
                .backend
                .scan_keys(cursor, &pattern, page_size.max(1))
                .await?;
            ids.extend(keys.iter().filter_map(|key| id_from_key(key, &self.index.prefix)));
            if next == 0 {
                break;
            }
            cursor = next;
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Nearest neighbours through the vector index, most similar first.
    pub async fn knn(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        let blob = encode_embedding(query);
        let rows = self
            .backend
            .knn(&self.index, &blob, k, &KNN_RETURN_FIELDS)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(
                |(key, raw)| match SearchHit::from_knn_row(&key, &self.index.prefix, &raw) {
                    Ok(hit) => Some(hit),
                    Err(err) => {
                        log::warn!("Skipping index row: {err}");
                        None
                    }
                },
            )
            .collect())
    }
}

/// Cursor over the store's keys. Each record is read when its page is
/// fetched, so it reflects the key at that moment.
pub struct ProductScan<'a> {
    store: &'a ProductStore,
    pattern: String,
    page_size: usize,
    cursor: u64,
    finished: bool,
}

impl ProductScan<'_> {
    /// Next page of records, or `None` once the key space is exhausted.
    /// Pages can be empty while the scan is still in progress.
    pub async fn next_page(&mut self) -> Result<Option<Vec<ScannedRecord>>> {
        if self.finished {
            return Ok(None);
        }

        let backend = &self.store.backend;
        let (next, keys) = backend
            .scan_keys(self.cursor, &self.pattern, self.page_size)
            .await?;
        self.cursor = next;
        self.finished = next == 0;

        let reads = backend.read_records(&keys).await?;
        let prefix = &self.store.index.prefix;
        let page = keys
            .into_iter()
            .zip(reads)
            .filter_map(|(key, read)| match read {
                RecordRead::Found(raw) => Some(ScannedRecord::decode(key, prefix, &raw)),
                RecordRead::Unreadable(reason) => Some(ScannedRecord::Malformed { key, reason }),
                // Deleted between SCAN and read.
                RecordRead::Missing => None,
            })
            .collect();
        Ok(Some(page))
    }

    pub fn restart(&mut self) {
        self.cursor = 0;
        self.finished = false;
    }
}
