use crate::error::{Result, VectorStoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Output width of the sentence embedding model.
pub const EMBEDDING_DIM: usize = 384;

pub const DEFAULT_KEY_PREFIX: &str = "product:";
pub const DEFAULT_INDEX_NAME: &str = "product_idx";

/// Field list written to a record, in storage order.
pub type RecordFields = Vec<(String, Vec<u8>)>;

/// A record as read back from the store.
pub type RawRecord = HashMap<String, Vec<u8>>;

pub const FIELD_PRODUCT_ID: &str = "product_id";
pub const FIELD_NAME: &str = "name";
pub const FIELD_DESCRIPTION: &str = "description";
pub const FIELD_EMBEDDING: &str = "embedding";
pub const FIELD_CATEGORY_ID: &str = "category_id";
pub const FIELD_CATEGORY_NAME: &str = "category_name";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_SCORE: &str = "score";

/// Fields requested from a nearest-neighbour query.
pub const KNN_RETURN_FIELDS: [&str; 5] = [
    FIELD_PRODUCT_ID,
    FIELD_NAME,
    FIELD_DESCRIPTION,
    FIELD_CATEGORY_NAME,
    FIELD_SCORE,
];

/// One product as stored in the vector record store.
///
/// Written only by the reconciler, always as a whole record. The embedding
/// reflects `name` and `description` at the time of the last resync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductDocument {
    pub product_id: i64,
    pub name: String,
    pub description: String,
    pub category_id: Option<i64>,
    pub category_name: Option<String>,
    pub status: Option<String>,
    pub embedding: Vec<f32>,
}

impl ProductDocument {
    /// Encode every field for a single hash write. Absent values become
    /// empty strings so the field set is identical for every product.
    pub fn to_fields(&self) -> RecordFields {
        vec![
            (
                FIELD_PRODUCT_ID.to_string(),
                self.product_id.to_string().into_bytes(),
            ),
            (FIELD_NAME.to_string(), self.name.clone().into_bytes()),
            (
                FIELD_DESCRIPTION.to_string(),
                self.description.clone().into_bytes(),
            ),
            (FIELD_EMBEDDING.to_string(), encode_embedding(&self.embedding)),
            (
                FIELD_CATEGORY_ID.to_string(),
                self.category_id
                    .map(|id| id.to_string())
                    .unwrap_or_default()
                    .into_bytes(),
            ),
            (
                FIELD_CATEGORY_NAME.to_string(),
                self.category_name.clone().unwrap_or_default().into_bytes(),
            ),
            (
                FIELD_STATUS.to_string(),
                self.status.clone().unwrap_or_default().into_bytes(),
            ),
        ]
    }

    /// Decode a stored hash. Fails when the id cannot be recovered or the
    /// embedding is missing, truncated or non-finite.
    pub fn from_fields(key: &str, prefix: &str, raw: &RawRecord) -> Result<Self> {
        let product_id = raw
            .get(FIELD_PRODUCT_ID)
            .and_then(|bytes| parse_i64(bytes))
            .or_else(|| id_from_key(key, prefix))
            .ok_or_else(|| VectorStoreError::malformed(key, "missing product_id"))?;

        let blob = raw
            .get(FIELD_EMBEDDING)
            .filter(|bytes| !bytes.is_empty())
            .ok_or_else(|| VectorStoreError::malformed(key, "missing embedding"))?;
        let embedding = decode_embedding(blob).ok_or_else(|| {
            VectorStoreError::malformed(
                key,
                format!("embedding blob of {} bytes is not valid f32 data", blob.len()),
            )
        })?;
        if embedding.len() != EMBEDDING_DIM {
            return Err(VectorStoreError::malformed(
                key,
                format!(
                    "embedding has {} dimensions, expected {EMBEDDING_DIM}",
                    embedding.len()
                ),
            ));
        }

        Ok(Self {
            product_id,
            name: text_field(raw, FIELD_NAME),
            description: text_field(raw, FIELD_DESCRIPTION),
            category_id: raw.get(FIELD_CATEGORY_ID).and_then(|b| parse_i64(b)),
            category_name: optional_text(raw, FIELD_CATEGORY_NAME),
            status: optional_text(raw, FIELD_STATUS),
            embedding,
        })
    }

    pub fn to_hit(&self, score: f32) -> SearchHit {
        SearchHit {
            product_id: self.product_id,
            name: self.name.clone(),
            description: self.description.clone(),
            category_name: self.category_name.clone(),
            score,
        }
    }
}

/// Text the embedding is derived from: `name description`, or just `name`
/// when the description is empty.
pub fn canonical_text(name: &str, description: &str) -> String {
    if description.trim().is_empty() {
        name.to_string()
    } else {
        format!("{name} {description}")
    }
}

/// One ranked search result. `score` is cosine similarity on every query
/// path: higher means more relevant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub product_id: i64,
    pub name: String,
    pub description: String,
    pub category_name: Option<String>,
    pub score: f32,
}

impl SearchHit {
    /// Build a hit from a nearest-neighbour reply row, whose `score` field
    /// carries cosine distance.
    pub fn from_knn_row(key: &str, prefix: &str, raw: &RawRecord) -> Result<Self> {
        let product_id = raw
            .get(FIELD_PRODUCT_ID)
            .and_then(|bytes| parse_i64(bytes))
            .or_else(|| id_from_key(key, prefix))
            .ok_or_else(|| VectorStoreError::malformed(key, "missing product_id"))?;
        let distance = raw
            .get(FIELD_SCORE)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
            .and_then(|s| s.trim().parse::<f32>().ok())
            .ok_or_else(|| VectorStoreError::malformed(key, "missing distance"))?;

        Ok(Self {
            product_id,
            name: text_field(raw, FIELD_NAME),
            description: text_field(raw, FIELD_DESCRIPTION),
            category_name: optional_text(raw, FIELD_CATEGORY_NAME),
            score: 1.0 - distance,
        })
    }
}

/// Outcome of probing the store for the vector-search extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "message")]
pub enum IndexCapability {
    Supported,
    Unsupported,
    Error(String),
}

/// Raw little-endian f32 array.
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub fn decode_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    let vector: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    if vector.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Some(vector)
}

pub fn id_from_key(key: &str, prefix: &str) -> Option<i64> {
    key.strip_prefix(prefix)?.parse().ok()
}

fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

fn text_field(raw: &RawRecord, field: &str) -> String {
    raw.get(field)
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .unwrap_or_default()
}

fn optional_text(raw: &RawRecord, field: &str) -> Option<String> {
    Some(text_field(raw, field)).filter(|s| !s.is_empty())
}
