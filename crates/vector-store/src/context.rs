use crate::config::{EmbeddingConfig, StoreConfig};
use crate::embeddings::EmbeddingModel;
use crate::error::Result;
use crate::memory_backend::MemoryBackend;
use crate::redis_backend::RedisBackend;
use crate::store::ProductStore;
use std::sync::Arc;

/// Process-wide handles: the embedding model and the record store
/// connection. Built once at startup and shared by the query engine and
/// the reconciler.
#[derive(Clone)]
pub struct EngineContext {
    embedder: Arc<EmbeddingModel>,
    store: Arc<ProductStore>,
}

impl EngineContext {
    pub fn new(embedder: EmbeddingModel, store: ProductStore) -> Self {
        Self {
            embedder: Arc::new(embedder),
            store: Arc::new(store),
        }
    }

    /// Load the model, then connect to Redis. If the connection fails the
    /// already-loaded model is dropped before the error is returned.
    pub async fn connect(store: &StoreConfig, embedding: &EmbeddingConfig) -> Result<Self> {
        let embedder = EmbeddingModel::from_config(embedding)?;
        let backend = RedisBackend::connect(&store.url).await?;
        let store = ProductStore::new(Arc::new(backend), store.index_spec());
        Ok(Self::new(embedder, store))
    }

    /// Stub embeddings over an in-process store.
    pub fn in_memory(store: &StoreConfig, backend: Arc<MemoryBackend>) -> Self {
        Self::new(
            EmbeddingModel::stub(),
            ProductStore::new(backend, store.index_spec()),
        )
    }

    pub fn embedder(&self) -> &Arc<EmbeddingModel> {
        &self.embedder
    }

    pub fn store(&self) -> &Arc<ProductStore> {
        &self.store
    }

    /// Release the model and the connection. Clones held elsewhere keep
    /// their handles alive until they are dropped too.
    pub fn shutdown(self) {
        let model_refs = Arc::strong_count(&self.embedder);
        let store_refs = Arc::strong_count(&self.store);
        if model_refs > 1 || store_refs > 1 {
            log::warn!(
                "Engine shutdown with outstanding handles (model: {}, store: {})",
                model_refs - 1,
                store_refs - 1
            );
        }
        drop(self.embedder);
        drop(self.store);
        log::info!("Engine resources released");
    }
}
