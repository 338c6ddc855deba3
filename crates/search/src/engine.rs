use crate::error::{Result, SearchError};
use catalog_vector_store::{
    EmbeddingModel, EngineContext, IndexCapability, ProductStore, ScannedRecord, SearchHit,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

pub const MIN_K: usize = 1;
pub const MAX_K: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Keys fetched per step of the fallback scan; bounds its memory use.
    pub scan_page_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            scan_page_size: 500,
        }
    }
}

/// Which route answered a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchPath {
    Indexed,
    Scan,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    pub path: SearchPath,
}

/// Text query → ranked products. Cheap to clone; share one per process.
#[derive(Clone)]
pub struct QueryEngine {
    embedder: Arc<EmbeddingModel>,
    store: Arc<ProductStore>,
    config: SearchConfig,
}

impl QueryEngine {
    pub fn new(ctx: &EngineContext, config: SearchConfig) -> Self {
        Self {
            embedder: ctx.embedder().clone(),
            store: ctx.store().clone(),
            config,
        }
    }

    /// Top `k` products by cosine similarity to `query`, most similar
    /// first. An empty catalog yields an empty list.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        Ok(self.search_with_path(query, k).await?.hits)
    }

    pub async fn search_with_path(&self, query: &str, k: usize) -> Result<SearchOutcome> {
        validate_request(query, k)?;
        let started = Instant::now();

        let query_vector = self.embedder.embed(query).await?;

        if self.resolve_capability().await != IndexCapability::Unsupported {
            let mut indexed = self.store.knn(&query_vector, k).await;
            let mut retried = None;
            if matches!(&indexed, Err(err) if err.is_capability_unsupported()) {
                retried = self.store.retry_index_setup().await;
                if retried == Some(IndexCapability::Supported) {
                    indexed = self.store.knn(&query_vector, k).await;
                }
            }
            match indexed {
                Ok(mut hits) => {
                    hits.truncate(k);
                    log::debug!(
                        "Indexed search '{}' (k={}): {} hits in {} ms",
                        query,
                        k,
                        hits.len(),
                        started.elapsed().as_millis()
                    );
                    return Ok(SearchOutcome {
                        hits,
                        path: SearchPath::Indexed,
                    });
                }
                Err(err) if err.is_capability_unsupported() => {
                    // A setup that is still failing is attempted again next query.
                    if !matches!(retried, Some(IndexCapability::Error(_))) {
                        self.store.mark_index_unsupported();
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }

        let hits = self.scan_search(&query_vector, k).await?;
        log::debug!(
            "Scan search '{}' (k={}): {} hits in {} ms",
            query,
            k,
            hits.len(),
            started.elapsed().as_millis()
        );
        Ok(SearchOutcome {
            hits,
            path: SearchPath::Scan,
        })
    }

    /// Cached probe result, probing on first use. A failed probe leaves the
    /// indexed path to be tried per query.
    async fn resolve_capability(&self) -> IndexCapability {
        if let Some(capability) = self.store.capability() {
            return capability;
        }
        match self.store.ensure_index().await {
            Ok(capability) => capability,
            Err(err) => {
                log::warn!("Vector index probe failed, trying index per query: {err}");
                IndexCapability::Error(err.to_string())
            }
        }
    }

    async fn scan_search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        let mut best: Vec<SearchHit> = Vec::with_capacity(k + self.config.scan_page_size);
        let mut scanned = 0usize;
        let mut skipped = 0usize;

        let mut scan = self.store.scan_all(self.config.scan_page_size);
        while let Some(page) = scan.next_page().await? {
            for record in page {
                match record {
                    ScannedRecord::Document(doc) => {
                        scanned += 1;
                        // SCAN may return a key twice.
                        if best.iter().any(|hit| hit.product_id == doc.product_id) {
                            continue;
                        }
                        let score = EmbeddingModel::cosine_similarity(query, &doc.embedding);
                        best.push(doc.to_hit(score));
                    }
                    ScannedRecord::Malformed { key, reason } => {
                        skipped += 1;
                        log::debug!("Skipping malformed record {key}: {reason}");
                    }
                }
            }
            keep_top(&mut best, k);
        }

        if skipped > 0 {
            log::warn!("Scan skipped {skipped} malformed records ({scanned} scored)");
        }
        Ok(best)
    }
}

/// Reject a blank query or a `k` outside `MIN_K..=MAX_K`. Runs before any
/// model or store access.
pub fn validate_request(query: &str, k: usize) -> Result<()> {
    if query.trim().is_empty() {
        return Err(SearchError::EmptyQuery);
    }
    if !(MIN_K..=MAX_K).contains(&k) {
        return Err(SearchError::InvalidLimit {
            k,
            min: MIN_K,
            max: MAX_K,
        });
    }
    Ok(())
}

/// Descending by score; the sort is stable so equal scores keep scan order.
fn keep_top(hits: &mut Vec<SearchHit>, k: usize) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(k);
}
