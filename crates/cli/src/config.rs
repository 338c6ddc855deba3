use anyhow::{Context, Result};
use catalog_indexer::SyncConfig;
use catalog_search::SearchConfig;
use catalog_vector_store::{EmbeddingConfig, EmbeddingMode, StoreConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// URL scheme selecting the in-process record store instead of Redis.
pub const MEMORY_URL_SCHEME: &str = "memory://";

/// Everything the binary needs to build an engine, loaded from an optional
/// TOML file. Missing sections and keys take their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub redis: StoreConfig,
    pub embedding: EmbeddingConfig,
    pub search: SearchConfig,
    pub sync: SyncConfig,
}

/// Values from flags or the environment that win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub redis_url: Option<String>,
    pub embed_mode: Option<EmbeddingMode>,
    pub model_dir: Option<PathBuf>,
    pub catalog_path: Option<PathBuf>,
    pub batch_cap: Option<usize>,
}

impl EngineConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = Self::from_toml_str(&raw)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(url) = overrides.redis_url {
            self.redis.url = url;
        }
        if let Some(mode) = overrides.embed_mode {
            self.embedding.mode = mode;
        }
        if let Some(dir) = overrides.model_dir {
            self.embedding.model_dir = dir;
        }
        if let Some(path) = overrides.catalog_path {
            self.sync.catalog_path = Some(path);
        }
        if let Some(cap) = overrides.batch_cap {
            self.sync.batch_cap = cap;
        }
    }

    pub fn uses_memory_store(&self) -> bool {
        self.redis.url.starts_with(MEMORY_URL_SCHEME)
    }
}
