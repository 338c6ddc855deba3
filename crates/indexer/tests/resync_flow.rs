use async_trait::async_trait;
use catalog_indexer::{
    CatalogReconciler, CatalogRow, IndexerError, JsonCatalog, MemoryCatalog, ProductCatalog,
    ProductRow, SyncConfig,
};
use catalog_vector_store::{
    EmbeddingModel, EngineContext, IndexCapability, MemoryBackend, ProductStore, StoreConfig,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn scenario_rows() -> Vec<ProductRow> {
    let mut basket = ProductRow::new(1, "Hand-woven wicker basket", "natural rattan basket");
    basket.category_id = Some(3);
    basket.category_name = Some("Home decor".to_string());
    basket.status = Some("active".to_string());
    vec![
        basket,
        ProductRow::new(2, "Leather wallet", "brown leather bifold"),
    ]
}

fn many_rows(n: i64) -> Vec<ProductRow> {
    (1..=n)
        .map(|id| ProductRow::new(id, format!("Item {id}"), "handmade"))
        .collect()
}

fn setup(
    rows: Vec<ProductRow>,
    config: SyncConfig,
) -> (Arc<MemoryBackend>, Arc<MemoryCatalog>, CatalogReconciler) {
    let backend = Arc::new(MemoryBackend::new());
    let ctx = EngineContext::in_memory(&StoreConfig::default(), backend.clone());
    let catalog = Arc::new(MemoryCatalog::new(rows));
    let reconciler = CatalogReconciler::new(&ctx, catalog.clone(), config);
    (backend, catalog, reconciler)
}

#[tokio::test]
async fn resync_writes_every_product() {
    let (backend, _, reconciler) = setup(scenario_rows(), SyncConfig::default());
    let stats = reconciler.run().await.expect("resync");

    assert_eq!(stats.fetched, 2);
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.skipped, 0);
    assert!(stats.errors.is_empty(), "{:?}", stats.errors);
    assert!(stats.time_ms > 0);
    assert_eq!(backend.keys(), vec!["product:1", "product:2"]);

    let record = backend.raw_record("product:1").expect("record");
    assert_eq!(record["category_name"], b"Home decor".to_vec());
    assert_eq!(record["embedding"].len(), 384 * 4);
    // Absent attributes are stored as empty strings.
    let record = backend.raw_record("product:2").expect("record");
    assert_eq!(record["category_id"], Vec::<u8>::new());
}

#[tokio::test]
async fn resync_creates_the_vector_index() {
    let backend = Arc::new(MemoryBackend::new());
    let ctx = EngineContext::in_memory(&StoreConfig::default(), backend);
    let reconciler = CatalogReconciler::new(
        &ctx,
        Arc::new(MemoryCatalog::new(scenario_rows())),
        SyncConfig::default(),
    );
    reconciler.run().await.expect("resync");
    assert_eq!(ctx.store().capability(), Some(IndexCapability::Supported));
}

#[tokio::test]
async fn empty_catalog_processes_nothing() {
    let (backend, _, reconciler) = setup(Vec::new(), SyncConfig::default());
    let stats = reconciler.run().await.expect("resync");
    assert_eq!(stats.fetched, 0);
    assert_eq!(stats.processed, 0);
    assert!(backend.is_empty());
}

#[tokio::test]
async fn resync_is_idempotent() {
    let (backend, _, reconciler) = setup(scenario_rows(), SyncConfig::default());
    reconciler.run().await.expect("first");
    let first: Vec<_> = backend
        .keys()
        .into_iter()
        .map(|key| (key.clone(), backend.raw_record(&key)))
        .collect();

    let stats = reconciler.run().await.expect("second");
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.removed, 0);
    let second: Vec<_> = backend
        .keys()
        .into_iter()
        .map(|key| (key.clone(), backend.raw_record(&key)))
        .collect();
    assert_eq!(first, second);
}

#[tokio::test]
async fn bad_rows_are_skipped_without_aborting() {
    let mut rows = scenario_rows();
    rows.insert(1, ProductRow::new(7, "  ", "no name"));
    rows.push(ProductRow::new(-4, "Negative id", ""));
    let (backend, _, reconciler) = setup(rows, SyncConfig::default());

    let stats = reconciler.run().await.expect("resync");
    assert_eq!(stats.fetched, 4);
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.skipped, 2);
    assert_eq!(stats.errors.len(), 2);
    assert_eq!(backend.keys(), vec!["product:1", "product:2"]);
}

async fn json_catalog(json: &str) -> (tempfile::TempDir, Arc<JsonCatalog>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("products.json");
    std::fs::write(&path, json).expect("write export");
    let catalog = JsonCatalog::load(&path).await.expect("load export");
    (dir, Arc::new(catalog))
}

#[tokio::test]
async fn undecodable_export_rows_are_skipped() {
    let (_dir, catalog) = json_catalog(
        r#"[
            {"id": 1, "name": "Hand-woven wicker basket", "description": "natural rattan basket"},
            {"id": 2, "name": null, "description": "name lost in export"},
            {"id": 3, "name": "Leather wallet", "description": "brown leather bifold"}
        ]"#,
    )
    .await;
    let backend = Arc::new(MemoryBackend::new());
    let ctx = EngineContext::in_memory(&StoreConfig::default(), backend.clone());

    let stats = CatalogReconciler::new(&ctx, catalog, SyncConfig::default())
        .run()
        .await
        .expect("resync");
    assert_eq!(stats.fetched, 3);
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.skipped, 1);
    assert!(stats.errors.iter().any(|e| e.contains("product 2")));
    assert_eq!(backend.keys(), vec!["product:1", "product:3"]);
}

#[tokio::test]
async fn undecodable_export_row_keeps_its_previous_document() {
    let (backend, _, reconciler) = setup(scenario_rows(), SyncConfig::default());
    reconciler.run().await.expect("first");

    let (_dir, catalog) = json_catalog(
        r#"[
            {"id": 1, "name": "Hand-woven wicker basket"},
            {"id": 2, "name": 42}
        ]"#,
    )
    .await;
    let ctx = EngineContext::in_memory(&StoreConfig::default(), backend.clone());
    let stats = CatalogReconciler::new(&ctx, catalog, SyncConfig::default())
        .run()
        .await
        .expect("second");
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.removed, 0);
    assert_eq!(
        backend.raw_record("product:2").expect("kept")["name"],
        b"Leather wallet".to_vec()
    );
}

#[tokio::test]
async fn embedding_failure_skips_only_the_affected_row() {
    let backend = Arc::new(MemoryBackend::new());
    let store = ProductStore::new(backend.clone(), StoreConfig::default().index_spec());
    let ctx = EngineContext::new(EmbeddingModel::stub_rejecting("#broken"), store);
    let rows = vec![
        ProductRow::new(1, "Hand-woven wicker basket", "natural rattan basket"),
        ProductRow::new(2, "Bamboo lamp #broken", ""),
        ProductRow::new(3, "Leather wallet", "brown leather bifold"),
    ];
    let reconciler =
        CatalogReconciler::new(&ctx, Arc::new(MemoryCatalog::new(rows)), SyncConfig::default());

    let stats = reconciler.run().await.expect("resync");
    assert_eq!(stats.fetched, 3);
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.skipped, 1);
    assert!(stats.errors.iter().any(|e| e.contains("product 2")));
    assert_eq!(backend.keys(), vec!["product:1", "product:3"]);

    // Rows embedded one at a time get the same vectors as a clean batch.
    let expected = EmbeddingModel::stub()
        .embed("Leather wallet brown leather bifold")
        .await
        .expect("embed");
    let stored = ctx.store().get(3).await.expect("read").expect("stored");
    assert_eq!(stored.embedding, expected);
}

#[tokio::test]
async fn resync_retries_index_setup_after_a_failed_attempt() {
    let (backend, _, reconciler) = setup(scenario_rows(), SyncConfig::default());
    backend.set_offline(true);
    reconciler.run().await.expect("offline run completes");

    backend.set_offline(false);
    let stats = reconciler.run().await.expect("resync");
    assert!(stats.errors.is_empty(), "{:?}", stats.errors);
    assert_eq!(stats.processed, 2);
}

#[tokio::test]
async fn write_failures_are_counted_per_item() {
    let (backend, _, reconciler) = setup(scenario_rows(), SyncConfig::default());
    backend.set_offline(true);

    let stats = reconciler.run().await.expect("resync still completes");
    assert_eq!(stats.processed, 0);
    assert_eq!(stats.skipped, 2);
    assert!(stats.errors.iter().any(|e| e.contains("product 1")));
}

#[tokio::test]
async fn pages_through_the_catalog() {
    let config = SyncConfig {
        page_size: 3,
        ..SyncConfig::default()
    };
    let (backend, _, reconciler) = setup(many_rows(10), config);
    let stats = reconciler.run().await.expect("resync");
    assert_eq!(stats.fetched, 10);
    assert_eq!(stats.processed, 10);
    assert_eq!(backend.len(), 10);
}

#[tokio::test]
async fn batch_cap_bounds_the_fetch() {
    let config = SyncConfig {
        page_size: 4,
        ..SyncConfig::default()
    };
    let (backend, _, reconciler) = setup(many_rows(10), config);
    let stats = reconciler.resync(6).await.expect("resync");
    assert_eq!(stats.fetched, 6);
    assert_eq!(backend.len(), 6);
}

#[tokio::test]
async fn products_removed_from_catalog_are_swept() {
    let (backend, catalog, reconciler) = setup(scenario_rows(), SyncConfig::default());
    reconciler.run().await.expect("first");

    catalog.remove(2);
    let stats = reconciler.run().await.expect("second");
    assert_eq!(stats.removed, 1);
    assert_eq!(backend.keys(), vec!["product:1"]);
}

#[tokio::test]
async fn failed_rows_keep_their_previous_document() {
    let (backend, catalog, reconciler) = setup(scenario_rows(), SyncConfig::default());
    reconciler.run().await.expect("first");

    let mut rows = scenario_rows();
    rows[1].name = String::new();
    catalog.set_rows(rows);
    let stats = reconciler.run().await.expect("second");
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.removed, 0);
    assert_eq!(
        backend.raw_record("product:2").expect("kept")["name"],
        b"Leather wallet".to_vec()
    );
}

#[tokio::test]
async fn sweep_is_skipped_when_cap_is_hit() {
    let (backend, catalog, reconciler) = setup(many_rows(5), SyncConfig::default());
    reconciler.run().await.expect("first");

    catalog.set_rows(many_rows(3));
    let stats = reconciler.resync(2).await.expect("capped");
    assert_eq!(stats.removed, 0);
    assert_eq!(backend.len(), 5);
}

#[tokio::test]
async fn sweep_can_be_disabled() {
    let config = SyncConfig {
        prune_stale: false,
        ..SyncConfig::default()
    };
    let (backend, catalog, reconciler) = setup(scenario_rows(), config);
    reconciler.run().await.expect("first");

    catalog.set_rows(Vec::new());
    let stats = reconciler.run().await.expect("second");
    assert_eq!(stats.removed, 0);
    assert_eq!(backend.len(), 2);
}

/// Serves one page, then fails.
struct FlakyCatalog {
    calls: AtomicUsize,
}

#[async_trait]
impl ProductCatalog for FlakyCatalog {
    async fn get_all(
        &self,
        offset: usize,
        limit: usize,
    ) -> catalog_indexer::Result<Vec<CatalogRow>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(IndexerError::Other("connection reset".to_string()));
        }
        Ok(many_rows(10)
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(Ok)
            .collect())
    }
}

#[tokio::test]
async fn catalog_failure_aborts_without_sweeping() {
    let backend = Arc::new(MemoryBackend::new());
    let ctx = EngineContext::in_memory(&StoreConfig::default(), backend.clone());
    let seed = CatalogReconciler::new(
        &ctx,
        Arc::new(MemoryCatalog::new(many_rows(10))),
        SyncConfig::default(),
    );
    seed.run().await.expect("seed");

    let config = SyncConfig {
        page_size: 4,
        ..SyncConfig::default()
    };
    let flaky = Arc::new(FlakyCatalog {
        calls: AtomicUsize::new(0),
    });
    let err = CatalogReconciler::new(&ctx, flaky, config)
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, IndexerError::Catalog(ref msg) if msg.contains("connection reset")));
    assert_eq!(backend.len(), 10);
}
