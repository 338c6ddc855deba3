//! # Catalog Vector Store
//!
//! Secondary, vector-indexed copy of the product catalog.
//!
//! ## Architecture
//!
//! ```text
//! ProductDocument
//!     │
//!     ├──> Embedding Model (ONNX MiniLM / stub)
//!     │      └─> Vector[384]
//!     │
//!     └──> ProductStore
//!            ├─> RecordBackend (Redis hashes, or in-memory)
//!            └─> Vector index (RediSearch, optional)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use catalog_vector_store::{EmbeddingConfig, EngineContext, StoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ctx = EngineContext::connect(&StoreConfig::default(), &EmbeddingConfig::default()).await?;
//!     let capability = ctx.store().ensure_index().await?;
//!     println!("vector index: {capability:?}");
//!     ctx.shutdown();
//!     Ok(())
//! }
//! ```

mod backend;
mod config;
mod context;
mod embeddings;
mod error;
mod memory_backend;
mod redis_backend;
mod store;
mod types;

pub use backend::{IndexCreation, IndexSpec, RecordBackend, RecordRead};
pub use config::{EmbeddingConfig, StoreConfig, DEFAULT_MODEL_ID, DEFAULT_REDIS_URL};
pub use context::EngineContext;
pub use embeddings::{EmbeddingMode, EmbeddingModel};
pub use error::{Result, VectorStoreError};
pub use memory_backend::MemoryBackend;
pub use redis_backend::{redact_url, RedisBackend};
pub use store::{ProductScan, ProductStore, ScannedRecord};
pub use types::{
    canonical_text, decode_embedding, encode_embedding, IndexCapability, ProductDocument,
    RawRecord, RecordFields, SearchHit, DEFAULT_INDEX_NAME, DEFAULT_KEY_PREFIX, EMBEDDING_DIM,
};
