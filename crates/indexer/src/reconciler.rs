use crate::catalog::{CatalogRow, ProductCatalog, ProductRow};
use crate::error::{IndexerError, Result};
use crate::stats::SyncStats;
use catalog_vector_store::{EmbeddingModel, EngineContext, IndexCapability, ProductStore};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Most rows fetched per run.
    pub batch_cap: usize,
    /// Rows requested from the catalog per call.
    pub page_size: usize,
    /// Delete stored products the catalog no longer returns.
    pub prune_stale: bool,
    /// JSON export read by the operator binary.
    pub catalog_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_cap: 10_000,
            page_size: 500,
            prune_stale: true,
            catalog_path: None,
        }
    }
}

/// Rebuilds the vector store from the catalog. Every run is a full resync.
pub struct CatalogReconciler {
    embedder: Arc<EmbeddingModel>,
    store: Arc<ProductStore>,
    catalog: Arc<dyn ProductCatalog>,
    config: SyncConfig,
}

impl CatalogReconciler {
    pub fn new(ctx: &EngineContext, catalog: Arc<dyn ProductCatalog>, config: SyncConfig) -> Self {
        Self {
            embedder: ctx.embedder().clone(),
            store: ctx.store().clone(),
            catalog,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Resync with the configured cap.
    pub async fn run(&self) -> Result<SyncStats> {
        self.resync(self.config.batch_cap).await
    }

    /// Fetch up to `batch_cap` rows, embed and overwrite each one, then
    /// sweep stored products that the catalog no longer has.
    ///
    /// Bad rows are skipped and reported in the stats. Only a failure to
    /// read the catalog aborts the run.
    pub async fn resync(&self, batch_cap: usize) -> Result<SyncStats> {
        let started = Instant::now();
        let mut stats = SyncStats::new();
        log::info!(
            "Resyncing catalog into {} (cap {batch_cap})",
            self.store.backend_name()
        );

        if let Err(err) = self.store.ensure_index().await {
            match self.store.retry_index_setup().await {
                Some(IndexCapability::Error(_)) | None => {
                    log::warn!("Continuing resync without vector index: {err}");
                    stats.add_error(err.to_string());
                }
                Some(capability) => log::info!("Vector index setup recovered: {capability:?}"),
            }
        }

        let page_size = self.config.page_size.max(1);
        let mut seen: HashSet<i64> = HashSet::new();
        let mut cap_reached = batch_cap == 0;

        while stats.fetched < batch_cap {
            let limit = page_size.min(batch_cap - stats.fetched);
            let rows = self
                .catalog
                .get_all(stats.fetched, limit)
                .await
                .map_err(IndexerError::into_catalog)?;
            let exhausted = rows.len() < limit;
            stats.fetched += rows.len();

            self.sync_page(rows, &mut seen, &mut stats).await;

            if exhausted {
                break;
            }
            cap_reached = stats.fetched >= batch_cap;
        }

        if self.config.prune_stale {
            if cap_reached {
                log::warn!("Fetch stopped at cap {batch_cap}; skipping stale product sweep");
            } else {
                self.sweep(&seen, &mut stats).await;
            }
        }

        stats.time_ms = started.elapsed().as_millis() as u64;
        if stats.time_ms == 0 {
            stats.time_ms = 1;
        }
        log::info!(
            "Resync completed: {} processed, {} skipped, {} removed of {} fetched in {} ms",
            stats.processed,
            stats.skipped,
            stats.removed,
            stats.fetched,
            stats.time_ms
        );
        Ok(stats)
    }

    async fn sync_page(
        &self,
        rows: Vec<CatalogRow>,
        seen: &mut HashSet<i64>,
        stats: &mut SyncStats,
    ) {
        let mut valid = Vec::with_capacity(rows.len());
        for row in rows {
            let row = match row {
                Ok(row) => row,
                Err(rejected) => {
                    // Still in the catalog: keep its stored document.
                    if let Some(id) = rejected.id.filter(|id| *id > 0) {
                        seen.insert(id);
                    }
                    log::warn!("Skipping product: {rejected}");
                    stats.add_skipped(rejected.to_string());
                    continue;
                }
            };
            if row.id > 0 {
                seen.insert(row.id);
            }
            match row.validate() {
                Ok(()) => valid.push(row),
                Err(err) => {
                    log::warn!("Skipping product: {err}");
                    stats.add_skipped(err.to_string());
                }
            }
        }
        if valid.is_empty() {
            return;
        }

        let texts: Vec<String> = valid.iter().map(ProductRow::canonical_text).collect();
        let embeddings = self
            .embedder
            .embed_batch(texts.iter().map(String::as_str).collect())
            .await;

        match embeddings {
            Ok(vectors) => {
                for (row, vector) in valid.into_iter().zip(vectors) {
                    self.write(row, Ok(vector), stats).await;
                }
            }
            Err(err) => {
                // One bad input fails the whole batch; retry row by row.
                log::debug!("Batch embedding failed ({err}); embedding rows individually");
                for (row, text) in valid.into_iter().zip(&texts) {
                    let vector = self.embedder.embed(text).await;
                    self.write(row, vector, stats).await;
                }
            }
        }
    }

    async fn write(
        &self,
        row: ProductRow,
        vector: catalog_vector_store::Result<Vec<f32>>,
        stats: &mut SyncStats,
    ) {
        let id = row.id;
        let outcome = match vector {
            Ok(vector) => self.store.upsert(&row.into_document(vector)).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(()) => stats.processed += 1,
            Err(err) => {
                log::warn!("Failed to sync product {id}: {err}");
                stats.add_skipped(format!("product {id}: {err}"));
            }
        }
    }

    async fn sweep(&self, seen: &HashSet<i64>, stats: &mut SyncStats) {
        let stored = match self.store.stored_ids(self.config.page_size).await {
            Ok(ids) => ids,
            Err(err) => {
                log::warn!("Stale product sweep failed: {err}");
                stats.add_error(format!("sweep: {err}"));
                return;
            }
        };

        for id in stored.into_iter().filter(|id| !seen.contains(id)) {
            match self.store.delete(id).await {
                Ok(true) => {
                    log::debug!("Removed stale product {id}");
                    stats.removed += 1;
                }
                Ok(false) => {}
                Err(err) => {
                    log::warn!("Failed to remove stale product {id}: {err}");
                    stats.add_error(format!("remove {id}: {err}"));
                }
            }
        }
        if stats.removed > 0 {
            log::info!("Removed {} products no longer in the catalog", stats.removed);
        }
    }
}
