use crate::backend::IndexSpec;
use crate::embeddings::EmbeddingMode;
use crate::types::{DEFAULT_INDEX_NAME, DEFAULT_KEY_PREFIX, EMBEDDING_DIM};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379/0";
pub const DEFAULT_MODEL_ID: &str = "all-MiniLM-L6-v2";

/// Connection and layout of the remote record store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
    pub key_prefix: String,
    pub index_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REDIS_URL.to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            index_name: DEFAULT_INDEX_NAME.to_string(),
        }
    }
}

impl StoreConfig {
    pub fn index_spec(&self) -> IndexSpec {
        IndexSpec {
            name: self.index_name.clone(),
            prefix: self.key_prefix.clone(),
            dimension: EMBEDDING_DIM,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub mode: EmbeddingMode,
    pub model_id: String,
    /// Directory holding `<model_id>/model.onnx` and `<model_id>/tokenizer.json`.
    pub model_dir: PathBuf,
    pub max_length: usize,
    pub max_batch: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            mode: EmbeddingMode::Onnx,
            model_id: DEFAULT_MODEL_ID.to_string(),
            model_dir: PathBuf::from("models"),
            max_length: 256,
            max_batch: 32,
        }
    }
}
