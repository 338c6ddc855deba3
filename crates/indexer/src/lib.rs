//! # Catalog Indexer
//!
//! Full resync of the product catalog into the vector store.
//!
//! ## Pipeline
//!
//! ```text
//! ProductCatalog (relational source of truth)
//!     │
//!     ├──> Paged fetch (≤ batch_cap rows)
//!     │      └─> ProductRow, or RejectedRow (skipped, id kept from the sweep)
//!     │
//!     ├──> Embedding Model (batch embed)
//!     │      └─> ProductDocument
//!     │
//!     ├──> ProductStore::upsert (whole-record overwrite)
//!     │
//!     └──> Sweep: delete stored ids the catalog no longer returns
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use catalog_indexer::{CatalogReconciler, JsonCatalog, SyncConfig};
//! use catalog_vector_store::{EmbeddingConfig, EngineContext, StoreConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ctx = EngineContext::connect(&StoreConfig::default(), &EmbeddingConfig::default()).await?;
//!     let catalog = Arc::new(JsonCatalog::load("products.json").await?);
//!     let stats = CatalogReconciler::new(&ctx, catalog, SyncConfig::default())
//!         .run()
//!         .await?;
//!
//!     println!("Synced {} products, skipped {}", stats.processed, stats.skipped);
//!     ctx.shutdown();
//!     Ok(())
//! }
//! ```

mod catalog;
mod error;
mod reconciler;
mod stats;

pub use catalog::{
    CatalogRow, JsonCatalog, MemoryCatalog, ProductCatalog, ProductRow, RejectedRow,
};
pub use error::{IndexerError, Result};
pub use reconciler::{CatalogReconciler, SyncConfig};
pub use stats::SyncStats;
