use crate::error::{IndexerError, Result};
use async_trait::async_trait;
use catalog_vector_store::{canonical_text, ProductDocument};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// One row of the relational product table joined with its category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRow {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category_id: Option<i64>,
    #[serde(default)]
    pub category_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl ProductRow {
    pub fn new(id: i64, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            description: Some(description.into()),
            category_id: None,
            category_name: None,
            status: None,
        }
    }

    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or_default()
    }

    /// Text the embedding is derived from.
    pub fn canonical_text(&self) -> String {
        canonical_text(&self.name, self.description())
    }

    /// Reject rows that cannot be stored under a product key.
    pub fn validate(&self) -> Result<()> {
        if self.id <= 0 {
            return Err(IndexerError::InvalidItem {
                id: self.id,
                reason: "id must be positive".to_string(),
            });
        }
        if self.name.trim().is_empty() {
            return Err(IndexerError::InvalidItem {
                id: self.id,
                reason: "name is blank".to_string(),
            });
        }
        Ok(())
    }

    pub fn into_document(self, embedding: Vec<f32>) -> ProductDocument {
        ProductDocument {
            product_id: self.id,
            name: self.name,
            description: self.description.unwrap_or_default(),
            category_id: self.category_id,
            category_name: self.category_name,
            status: self.status,
            embedding,
        }
    }
}

/// A catalog row that exists but could not be decoded into a [`ProductRow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRow {
    /// The row's id, when that much was readable.
    pub id: Option<i64>,
    pub reason: String,
}

impl fmt::Display for RejectedRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "Unreadable product {id}: {}", self.reason),
            None => write!(f, "Unreadable product row: {}", self.reason),
        }
    }
}

/// One row as the catalog returned it.
pub type CatalogRow = std::result::Result<ProductRow, RejectedRow>;

/// Read side of the relational system of record.
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    /// Up to `limit` rows starting at `offset`, in a stable order. A row
    /// that cannot be decoded is returned in place as a [`RejectedRow`];
    /// `Err` means the catalog itself could not be read.
    async fn get_all(&self, offset: usize, limit: usize) -> Result<Vec<CatalogRow>>;
}

/// Catalog held in memory; rows can be replaced between runs.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    rows: RwLock<Vec<ProductRow>>,
}

impl MemoryCatalog {
    pub fn new(rows: Vec<ProductRow>) -> Self {
        Self {
            rows: RwLock::new(rows),
        }
    }

    pub fn set_rows(&self, rows: Vec<ProductRow>) {
        *self.rows.write().unwrap_or_else(PoisonError::into_inner) = rows;
    }

    pub fn remove(&self, id: i64) {
        self.rows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|row| row.id != id);
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ProductCatalog for MemoryCatalog {
    async fn get_all(&self, offset: usize, limit: usize) -> Result<Vec<CatalogRow>> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.iter().skip(offset).take(limit).cloned().map(Ok).collect())
    }
}

/// JSON array export of the product table, e.g. produced by
/// `SELECT ... FROM Products p LEFT JOIN Categories c ...`.
///
/// Only the top-level array is checked on load; each element is decoded
/// when its page is fetched, so one bad row does not reject the export.
#[derive(Debug)]
pub struct JsonCatalog {
    path: PathBuf,
    rows: Vec<Value>,
}

impl JsonCatalog {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            IndexerError::Catalog(format!("Failed to read {}: {e}", path.display()))
        })?;
        let rows: Vec<Value> = serde_json::from_slice(&bytes).map_err(|e| {
            IndexerError::Catalog(format!("Failed to parse {}: {e}", path.display()))
        })?;
        log::debug!("Loaded {} catalog rows from {}", rows.len(), path.display());
        Ok(Self { path, rows })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn decode_row(value: &Value) -> CatalogRow {
    serde_json::from_value(value.clone()).map_err(|err| RejectedRow {
        id: value.get("id").and_then(Value::as_i64),
        reason: err.to_string(),
    })
}

#[async_trait]
impl ProductCatalog for JsonCatalog {
    async fn get_all(&self, offset: usize, limit: usize) -> Result<Vec<CatalogRow>> {
        Ok(self.rows.iter().skip(offset).take(limit).map(decode_row).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn canonical_text_drops_empty_description() {
        assert_eq!(
            ProductRow::new(1, "Wicker basket", "natural rattan").canonical_text(),
            "Wicker basket natural rattan"
        );
        let mut row = ProductRow::new(2, "Lamp", "");
        assert_eq!(row.canonical_text(), "Lamp");
        row.description = None;
        assert_eq!(row.canonical_text(), "Lamp");
    }

    #[test]
    fn validation_rejects_unkeyable_rows() {
        assert!(ProductRow::new(1, "Vase", "").validate().is_ok());
        assert!(matches!(
            ProductRow::new(0, "Vase", "").validate(),
            Err(IndexerError::InvalidItem { id: 0, .. })
        ));
        assert!(matches!(
            ProductRow::new(3, "   ", "text").validate(),
            Err(IndexerError::InvalidItem { id: 3, .. })
        ));
    }

    #[tokio::test]
    async fn memory_catalog_pages() {
        let catalog = MemoryCatalog::new((1..=5).map(|id| ProductRow::new(id, "p", "")).collect());
        let ids = |rows: Vec<CatalogRow>| {
            rows.into_iter()
                .map(|r| r.expect("decoded").id)
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(catalog.get_all(0, 2).await.unwrap()), vec![1, 2]);
        assert_eq!(ids(catalog.get_all(4, 2).await.unwrap()), vec![5]);
        assert!(catalog.get_all(9, 2).await.unwrap().is_empty());

        catalog.remove(1);
        assert_eq!(catalog.len(), 4);
    }

    #[tokio::test]
    async fn json_catalog_reads_export_with_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("products.json");
        std::fs::write(
            &path,
            r#"[
                {"id": 1, "name": "Basket", "description": null, "category_id": 4,
                 "category_name": "Home", "status": "active"},
                {"id": 2, "name": "Wallet"}
            ]"#,
        )
        .unwrap();

        let catalog = JsonCatalog::load(&path).await.unwrap();
        let rows: Vec<ProductRow> = catalog
            .get_all(0, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.expect("decoded"))
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].category_name.as_deref(), Some("Home"));
        assert_eq!(rows[0].description(), "");
        assert_eq!(rows[1].status, None);
    }

    #[tokio::test]
    async fn json_catalog_rejects_bad_rows_individually() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("products.json");
        std::fs::write(
            &path,
            r#"[
                {"id": 1, "name": "Basket"},
                {"id": 2, "name": null},
                {"id": "three", "name": "Vase"},
                {"id": 4, "name": "Lamp", "category_id": "n/a"},
                {"id": 5, "name": "Rug"}
            ]"#,
        )
        .unwrap();

        let catalog = JsonCatalog::load(&path).await.unwrap();
        assert_eq!(catalog.len(), 5);
        let rows = catalog.get_all(0, 10).await.unwrap();
        assert_eq!(rows[0].as_ref().map(|r| r.id), Ok(1));
        assert_eq!(rows[1].as_ref().unwrap_err().id, Some(2));
        assert_eq!(rows[2].as_ref().unwrap_err().id, None);
        assert_eq!(rows[3].as_ref().unwrap_err().id, Some(4));
        assert_eq!(rows[4].as_ref().map(|r| r.id), Ok(5));
        assert!(rows[1]
            .as_ref()
            .unwrap_err()
            .to_string()
            .starts_with("Unreadable product 2:"));
    }

    #[tokio::test]
    async fn json_catalog_errors_are_catalog_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = JsonCatalog::load(dir.path().join("absent.json")).await;
        assert!(matches!(missing, Err(IndexerError::Catalog(_))));

        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            JsonCatalog::load(&path).await,
            Err(IndexerError::Catalog(_))
        ));

        std::fs::write(&path, r#"{"id": 1, "name": "Basket"}"#).unwrap();
        assert!(matches!(
            JsonCatalog::load(&path).await,
            Err(IndexerError::Catalog(_))
        ));
    }
}
