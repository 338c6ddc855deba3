use crate::backend::{IndexCreation, IndexSpec, RecordBackend, RecordRead};
use crate::embeddings::EmbeddingModel;
use crate::error::{Result, VectorStoreError};
use crate::types::{decode_embedding, RawRecord, RecordFields, FIELD_EMBEDDING, FIELD_SCORE};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// In-process record store with the same contract as the Redis adapter.
///
/// Keys iterate in insertion order. The vector-search extension can be
/// switched off to exercise the scan path, and the whole store can be taken
/// offline to simulate connection loss.
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    vector_search: AtomicBool,
    offline: AtomicBool,
}

#[derive(Default)]
struct MemoryState {
    order: Vec<String>,
    records: HashMap<String, RawRecord>,
    /// Keys holding something other than a hash.
    non_hash: HashSet<String>,
    indexes: Vec<IndexSpec>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            vector_search: AtomicBool::new(true),
            offline: AtomicBool::new(false),
        }
    }

    pub fn without_vector_search() -> Self {
        let backend = Self::new();
        backend.set_vector_search(false);
        backend
    }

    pub fn set_vector_search(&self, enabled: bool) {
        self.vector_search.store(enabled, Ordering::SeqCst);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Store a record bypassing document encoding.
    pub fn insert_raw(&self, key: &str, record: RawRecord) {
        self.lock().put(key, record);
    }

    /// Occupy `key` with a non-hash value, as a stray string key would in
    /// Redis.
    pub fn insert_non_hash(&self, key: &str) {
        let mut state = self.lock();
        let had_record = state.records.remove(key).is_some();
        if state.non_hash.insert(key.to_string()) && !had_record {
            state.order.push(key.to_string());
        }
    }

    pub fn raw_record(&self, key: &str) -> Option<RawRecord> {
        self.lock().records.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().order.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(VectorStoreError::IoError(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "memory backend is offline",
            )));
        }
        Ok(())
    }

    fn check_vector_search(&self, command: &str) -> Result<()> {
        if !self.vector_search.load(Ordering::SeqCst) {
            return Err(VectorStoreError::CapabilityUnsupported(format!(
                "unknown command '{command}'"
            )));
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryState {
    fn put(&mut self, key: &str, record: RawRecord) {
        let replaced_other = self.non_hash.remove(key);
        if self.records.insert(key.to_string(), record).is_none() && !replaced_other {
            self.order.push(key.to_string());
        }
    }
}

fn matches_pattern(key: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[async_trait]
impl RecordBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        self.check_online()
    }

    async fn create_index(&self, spec: &IndexSpec) -> Result<IndexCreation> {
        self.check_online()?;
        self.check_vector_search("FT.CREATE")?;
        let mut state = self.lock();
        if state.indexes.iter().any(|existing| existing.name == spec.name) {
            return Ok(IndexCreation::AlreadyExists);
        }
        state.indexes.push(spec.clone());
        Ok(IndexCreation::Created)
    }

    async fn write_record(&self, key: &str, fields: &RecordFields) -> Result<()> {
        self.check_online()?;
        let record: RawRecord = fields.iter().cloned().collect();
        self.lock().put(key, record);
        Ok(())
    }

    async fn read_records(&self, keys: &[String]) -> Result<Vec<RecordRead>> {
        self.check_online()?;
        let state = self.lock();
        Ok(keys
            .iter()
            .map(|key| match state.records.get(key) {
                Some(record) => RecordRead::Found(record.clone()),
                None if state.non_hash.contains(key) => RecordRead::Unreadable(
                    "WRONGTYPE Operation against a key holding the wrong kind of value"
                        .to_string(),
                ),
                None => RecordRead::Missing,
            })
            .collect())
    }

    async fn delete_record(&self, key: &str) -> Result<bool> {
        self.check_online()?;
        let mut state = self.lock();
        if state.records.remove(key).is_none() && !state.non_hash.remove(key) {
            return Ok(false);
        }
        state.order.retain(|existing| existing != key);
        Ok(true)
    }

    async fn scan_keys(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>)> {
        self.check_online()?;
        let state = self.lock();
        let start = usize::try_from(cursor).unwrap_or(usize::MAX).min(state.order.len());
        let end = start.saturating_add(count.max(1)).min(state.order.len());
        let keys = state.order[start..end]
            .iter()
            .filter(|key| matches_pattern(key, pattern))
            .cloned()
            .collect();
        let next = if end >= state.order.len() { 0 } else { end as u64 };
        Ok((next, keys))
    }

    async fn knn(
        &self,
        spec: &IndexSpec,
        query: &[u8],
        k: usize,
        fields: &[&str],
    ) -> Result<Vec<(String, RawRecord)>> {
        self.check_online()?;
        self.check_vector_search("FT.SEARCH")?;
        let query = decode_embedding(query)
            .ok_or_else(|| VectorStoreError::Other("query vector is not f32 data".to_string()))?;
        if query.len() != spec.dimension {
            return Err(VectorStoreError::InvalidDimension {
                expected: spec.dimension,
                actual: query.len(),
            });
        }

        let state = self.lock();
        if !state.indexes.iter().any(|existing| existing.name == spec.name) {
            return Err(VectorStoreError::CapabilityUnsupported(format!(
                "{}: Unknown Index name",
                spec.name
            )));
        }

        // Records without a usable vector are simply not indexed.
        let mut scored: Vec<(f32, &String)> = state
            .order
            .iter()
            .filter(|key| key.starts_with(&spec.prefix))
            .filter_map(|key| {
                let vector = decode_embedding(state.records.get(key)?.get(FIELD_EMBEDDING)?)?;
                (vector.len() == spec.dimension).then(|| {
                    let distance = 1.0 - EmbeddingModel::cosine_similarity(&query, &vector);
                    (distance, key)
                })
            })
            .collect();
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(distance, key)| {
                let stored = &state.records[key];
                let mut row: RawRecord = fields
                    .iter()
                    .filter_map(|field| {
                        stored
                            .get(*field)
                            .map(|value| ((*field).to_string(), value.clone()))
                    })
                    .collect();
                row.insert(FIELD_SCORE.to_string(), distance.to_string().into_bytes());
                (key.clone(), row)
            })
            .collect())
    }
}
