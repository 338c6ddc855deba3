use crate::config::EmbeddingConfig;
use crate::error::{Result, VectorStoreError};
use crate::types::EMBEDDING_DIM;
use ndarray::{Array, Axis, Ix2, Ix3};
use ort::session::{builder::GraphOptimizationLevel, Session, SessionInputs};
use ort::value::{DynTensor, Tensor};
use ort::Error as OrtError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokenizers::{Encoding, PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};
use tokio::task::spawn_blocking;
use unicode_segmentation::UnicodeSegmentation;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingMode {
    /// Sentence-transformer model executed with ONNX Runtime.
    #[default]
    Onnx,
    /// Model-free hashed bag-of-words vectors.
    Stub,
}

impl FromStr for EmbeddingMode {
    type Err = VectorStoreError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "onnx" | "fast" => Ok(Self::Onnx),
            "stub" => Ok(Self::Stub),
            other => Err(VectorStoreError::EmbeddingError(format!(
                "Unsupported embedding mode '{other}' (expected 'onnx' or 'stub')"
            ))),
        }
    }
}

impl fmt::Display for EmbeddingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Onnx => f.write_str("onnx"),
            Self::Stub => f.write_str("stub"),
        }
    }
}

#[derive(Clone)]
struct ModelAssets {
    model_path: PathBuf,
    tokenizer_path: PathBuf,
}

impl ModelAssets {
    fn in_dir(model_dir: &Path, model_id: &str) -> Self {
        let dir = model_dir.join(model_id);
        Self {
            model_path: dir.join("model.onnx"),
            tokenizer_path: dir.join("tokenizer.json"),
        }
    }
}

struct OrtBackend {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    max_length: usize,
    max_batch: usize,
    dimension: usize,
}

impl OrtBackend {
    fn new(config: &EmbeddingConfig, dimension: usize) -> Result<Self> {
        if !tokenizers::utils::parallelism::is_parallelism_configured() {
            tokenizers::utils::parallelism::set_parallelism(false);
        }

        let assets = ModelAssets::in_dir(&config.model_dir, &config.model_id);
        if !assets.model_path.exists() || !assets.tokenizer_path.exists() {
            return Err(VectorStoreError::EmbeddingError(format!(
                "Model files for '{}' are missing. Expected ONNX at {} and tokenizer at {}.",
                config.model_id,
                assets.model_path.display(),
                assets.tokenizer_path.display(),
            )));
        }

        let mut tokenizer = Tokenizer::from_file(&assets.tokenizer_path)
            .map_err(|e| VectorStoreError::EmbeddingError(format!("Tokenizer load failed: {e}")))?;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..PaddingParams::default()
        }));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: config.max_length,
                ..TruncationParams::default()
            }))
            .map_err(|e| {
                VectorStoreError::EmbeddingError(format!("Tokenizer truncation failed: {e}"))
            })?;

        let session = Session::builder()
            .map_err(|e| to_embedding_error(&e))?
            .with_intra_threads(default_intra_threads())
            .map_err(|e| {
                VectorStoreError::EmbeddingError(format!("Failed to set ORT intra threads: {e}"))
            })?
            .with_intra_op_spinning(false)
            .map_err(|e| {
                VectorStoreError::EmbeddingError(format!("Failed to set ORT intra spinning: {e}"))
            })?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| {
                VectorStoreError::EmbeddingError(format!("Failed to set optimization level: {e}"))
            })?
            .commit_from_file(&assets.model_path)
            .map_err(|e| {
                VectorStoreError::EmbeddingError(format!("Failed to load ONNX model: {e}"))
            })?;

        log::info!(
            "Loaded ONNX model '{}' (dim {}, max_length {}, batch {})",
            config.model_id,
            dimension,
            config.max_length,
            config.max_batch
        );

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            max_length: config.max_length,
            max_batch: config.max_batch.max(1),
            dimension,
        })
    }

    fn embed_batch_blocking(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.max_batch) {
            let encodings = self
                .tokenizer
                .encode_batch(batch.to_vec(), true)
                .map_err(|e| {
                    VectorStoreError::EmbeddingError(format!("Tokenization failed: {e}"))
                })?;

            if encodings.is_empty() {
                continue;
            }

            let seq_len = encodings[0].len();
            if seq_len > self.max_length {
                return Err(VectorStoreError::EmbeddingError(format!(
                    "Tokenized length {} exceeds max_length {}",
                    seq_len, self.max_length
                )));
            }
            let (ids, masks, type_ids, mask_rows) = build_flat_tensors(&encodings, seq_len);

            let ids_array = Array::from_shape_vec((batch.len(), seq_len), ids)
                .map_err(|e| VectorStoreError::EmbeddingError(format!("IDs shape error: {e}")))?;
            let mask_array = Array::from_shape_vec((batch.len(), seq_len), masks)
                .map_err(|e| VectorStoreError::EmbeddingError(format!("Mask shape error: {e}")))?;
            let type_array = Array::from_shape_vec((batch.len(), seq_len), type_ids)
                .map_err(|e| VectorStoreError::EmbeddingError(format!("Types shape error: {e}")))?;

            let mut available: HashMap<String, DynTensor> = HashMap::new();
            available.insert(
                "input_ids".to_string(),
                Tensor::from_array(ids_array.into_dyn())
                    .map_err(|e| to_embedding_error(&e))?
                    .upcast(),
            );
            available.insert(
                "attention_mask".to_string(),
                Tensor::from_array(mask_array.into_dyn())
                    .map_err(|e| to_embedding_error(&e))?
                    .upcast(),
            );
            available.insert(
                "token_type_ids".to_string(),
                Tensor::from_array(type_array.into_dyn())
                    .map_err(|e| to_embedding_error(&e))?
                    .upcast(),
            );

            let array = {
                let mut session = self.session.lock().map_err(|_| {
                    VectorStoreError::EmbeddingError("Failed to lock ONNX session".into())
                })?;

                let mut feed: HashMap<String, DynTensor> = HashMap::new();
                for input in &session.inputs {
                    let tensor = available.remove(&input.name).ok_or_else(|| {
                        VectorStoreError::EmbeddingError(format!(
                            "Unsupported ONNX input '{}'",
                            input.name
                        ))
                    })?;
                    feed.insert(input.name.clone(), tensor);
                }

                let outputs = session.run(SessionInputs::from(feed)).map_err(|e| {
                    VectorStoreError::EmbeddingError(format!("ONNX forward failed: {e}"))
                })?;

                if outputs.len() == 0 {
                    return Err(VectorStoreError::EmbeddingError(
                        "ONNX returned no outputs".to_string(),
                    ));
                }

                let array = outputs[0]
                    .try_extract_array::<f32>()
                    .map_err(|e| {
                        VectorStoreError::EmbeddingError(format!(
                            "Failed to decode ONNX output: {e}"
                        ))
                    })?
                    .to_owned();

                drop(outputs);
                drop(session);

                array
            };
            results.extend(embeddings_from_output(array, &mask_rows, self.dimension)?);
        }

        Ok(results)
    }
}

fn default_intra_threads() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    if cpus <= 4 {
        1
    } else if cpus <= 12 {
        2
    } else {
        4
    }
}

const fn ensure_dimension(vec: &[f32], expected: usize) -> Result<()> {
    if vec.len() != expected {
        return Err(VectorStoreError::InvalidDimension {
            expected,
            actual: vec.len(),
        });
    }
    Ok(())
}

fn embeddings_from_output(
    array: ndarray::ArrayD<f32>,
    mask_rows: &[Vec<i64>],
    expected_dimension: usize,
) -> Result<Vec<Vec<f32>>> {
    let mut out = Vec::new();
    match array.ndim() {
        2 => {
            let embeddings = array
                .into_dimensionality::<Ix2>()
                .map_err(|e| VectorStoreError::EmbeddingError(format!("Bad output shape: {e}")))?;
            for row in embeddings.outer_iter() {
                let mut emb = row.to_vec();
                ensure_dimension(&emb, expected_dimension)?;
                normalize(&mut emb);
                out.push(emb);
            }
        }
        3 => {
            let hidden = array
                .into_dimensionality::<Ix3>()
                .map_err(|e| VectorStoreError::EmbeddingError(format!("Bad output shape: {e}")))?;
            for (idx, sample) in hidden.outer_iter().enumerate() {
                let attn = mask_rows
                    .get(idx)
                    .cloned()
                    .unwrap_or_else(|| vec![1; sample.len_of(Axis(0))]);
                let mut emb = mean_pool(sample.view(), &attn);
                ensure_dimension(&emb, expected_dimension)?;
                normalize(&mut emb);
                out.push(emb);
            }
        }
        _ => {
            return Err(VectorStoreError::EmbeddingError(format!(
                "Unexpected ONNX output dims: {:?}",
                array.shape()
            )));
        }
    }
    Ok(out)
}

fn mean_pool(sample: ndarray::ArrayView2<'_, f32>, mask: &[i64]) -> Vec<f32> {
    if sample.is_empty() {
        return vec![];
    }

    let hidden = sample.len_of(Axis(1));
    let mut sum = vec![0.0f32; hidden];
    let mut count = 0.0f32;

    for (token_idx, token) in sample.outer_iter().enumerate() {
        if *mask.get(token_idx).unwrap_or(&0) == 0 {
            continue;
        }
        count += 1.0;
        for (dim, value) in token.iter().enumerate() {
            sum[dim] += value;
        }
    }

    if count == 0.0 {
        return sum;
    }
    for value in &mut sum {
        *value /= count;
    }
    sum
}

fn build_flat_tensors(
    encodings: &[Encoding],
    seq_len: usize,
) -> (Vec<i64>, Vec<i64>, Vec<i64>, Vec<Vec<i64>>) {
    let mut ids = Vec::with_capacity(encodings.len() * seq_len);
    let mut masks = Vec::with_capacity(encodings.len() * seq_len);
    let mut type_ids = Vec::with_capacity(encodings.len() * seq_len);
    let mut mask_rows = Vec::with_capacity(encodings.len());

    for encoding in encodings {
        let encoding_ids = encoding.get_ids();
        let encoding_masks = encoding.get_attention_mask();
        let encoding_types = encoding.get_type_ids();

        for idx in 0..seq_len {
            ids.push(i64::from(*encoding_ids.get(idx).unwrap_or(&0)));
            masks.push(i64::from(*encoding_masks.get(idx).unwrap_or(&0)));
            type_ids.push(i64::from(*encoding_types.get(idx).unwrap_or(&0)));
        }

        mask_rows.push(
            encoding_masks
                .iter()
                .take(seq_len)
                .map(|v| i64::from(*v))
                .collect(),
        );
    }

    (ids, masks, type_ids, mask_rows)
}

fn normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return;
    }
    for value in vec {
        *value /= norm;
    }
}

/// Hashed bag-of-words: every lowercased word contributes a seeded
/// pseudo-random direction, so texts sharing words land close together.
fn stub_embed(text: &str, dimension: usize) -> Vec<f32> {
    let mut acc = vec![0.0f32; dimension];
    let mut words = 0usize;
    for word in text.unicode_words() {
        add_token_direction(&mut acc, &word.to_lowercase());
        words += 1;
    }
    if words == 0 {
        add_token_direction(&mut acc, text);
    }
    normalize(&mut acc);
    acc
}

fn add_token_direction(acc: &mut [f32], token: &str) {
    let mut state =
        fnv1a_64(token.as_bytes()) ^ (acc.len() as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    for slot in acc.iter_mut() {
        let bits = splitmix64(&mut state);
        let high = (bits >> 32) as u32;
        let mantissa = high >> 9;
        let unit = f32::from_bits(0x3f80_0000 | mantissa) - 1.0;
        *slot += unit.mul_add(2.0, -1.0);
    }
}

fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

const fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn to_embedding_error(error: &OrtError) -> VectorStoreError {
    VectorStoreError::EmbeddingError(format!("{error}"))
}

/// Text embedding model shared by the query engine and the reconciler.
///
/// Construct once per process; embedding calls take `&self` and can run
/// concurrently.
pub struct EmbeddingModel {
    backend: EmbeddingBackend,
    dimension: usize,
    model_id: String,
}

enum EmbeddingBackend {
    Ort(Arc<OrtBackend>),
    Stub {
        /// Texts containing this marker fail to embed.
        reject: Option<String>,
    },
}

impl EmbeddingModel {
    /// Load the configured backend. A missing or broken model is an error
    /// here rather than on first use.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        match config.mode {
            EmbeddingMode::Stub => Ok(Self::stub()),
            EmbeddingMode::Onnx => {
                let backend = OrtBackend::new(config, EMBEDDING_DIM)?;
                Ok(Self {
                    backend: EmbeddingBackend::Ort(Arc::new(backend)),
                    dimension: EMBEDDING_DIM,
                    model_id: config.model_id.clone(),
                })
            }
        }
    }

    #[must_use]
    pub fn stub() -> Self {
        Self {
            backend: EmbeddingBackend::Stub { reject: None },
            dimension: EMBEDDING_DIM,
            model_id: "stub".to_string(),
        }
    }

    /// Stub model that fails any call whose input contains `marker`, the
    /// way an inference backend rejects a batch it cannot process.
    #[must_use]
    pub fn stub_rejecting(marker: impl Into<String>) -> Self {
        Self {
            backend: EmbeddingBackend::Stub {
                reject: Some(marker.into()),
            },
            ..Self::stub()
        }
    }

    #[must_use]
    pub const fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut embeddings = self.embed_batch(vec![text]).await?;
        embeddings
            .pop()
            .ok_or_else(|| VectorStoreError::EmbeddingError("Empty embedding result".to_string()))
    }

    pub async fn embed_batch(&self, texts: Vec<&str>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let expected = texts.len();
        let owned: Vec<String> = texts.into_iter().map(ToString::to_string).collect();
        let vectors: Vec<Vec<f32>> = match &self.backend {
            EmbeddingBackend::Stub { reject } => {
                if let Some(text) = reject
                    .as_deref()
                    .and_then(|marker| owned.iter().find(|text| text.contains(marker)))
                {
                    return Err(VectorStoreError::EmbeddingError(format!(
                        "Stub model rejected input '{text}'"
                    )));
                }
                owned
                    .iter()
                    .map(|text| stub_embed(text, self.dimension))
                    .collect()
            }
            EmbeddingBackend::Ort(backend) => {
                let backend = backend.clone();
                spawn_blocking(move || backend.embed_batch_blocking(&owned))
                    .await
                    .map_err(|e| VectorStoreError::EmbeddingError(format!("Join error: {e}")))??
            }
        };

        if vectors.len() != expected {
            return Err(VectorStoreError::EmbeddingError(format!(
                "Expected {expected} embeddings, model returned {}",
                vectors.len()
            )));
        }
        for vector in &vectors {
            ensure_dimension(vector, self.dimension)?;
        }
        Ok(vectors)
    }

    /// Cosine similarity; 0 when either vector has zero norm or the lengths
    /// differ.
    #[must_use]
    pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return 0.0;
        }

        let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }

        dot_product / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn stub_embeddings_are_deterministic() {
        let model = EmbeddingModel::stub();
        let a = model.embed("Hand-woven wicker basket").await.unwrap();
        let b = model.embed("Hand-woven wicker basket").await.unwrap();
        assert_eq!(a.len(), EMBEDDING_DIM);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn stub_embeddings_reflect_shared_words() {
        let model = EmbeddingModel::stub();
        let query = model.embed("basket").await.unwrap();
        let basket = model
            .embed("Hand-woven wicker basket natural rattan basket")
            .await
            .unwrap();
        let wallet = model
            .embed("Leather wallet brown leather bifold")
            .await
            .unwrap();
        let near = EmbeddingModel::cosine_similarity(&query, &basket);
        let far = EmbeddingModel::cosine_similarity(&query, &wallet);
        assert!(near > 0.5, "near = {near}");
        assert!(near > far + 0.3, "near = {near}, far = {far}");
    }

    #[tokio::test]
    async fn stub_embeds_text_without_words() {
        let model = EmbeddingModel::stub();
        let vector = model.embed("--").await.unwrap();
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn rejecting_stub_fails_the_whole_batch() {
        let model = EmbeddingModel::stub_rejecting("#broken");
        let err = model
            .embed_batch(vec!["wicker basket", "lamp #broken", "wallet"])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VectorStoreError::EmbeddingError(ref msg) if msg.contains("#broken")
        ));

        let clean = model.embed("wicker basket").await.unwrap();
        assert_eq!(clean, EmbeddingModel::stub().embed("wicker basket").await.unwrap());
    }

    #[tokio::test]
    async fn embed_batch_preserves_order() {
        let model = EmbeddingModel::stub();
        let batch = model.embed_batch(vec!["lamp", "rug"]).await.unwrap();
        assert_eq!(batch[0], model.embed("lamp").await.unwrap());
        assert_eq!(batch[1], model.embed("rug").await.unwrap());
        assert!(model.embed_batch(vec![]).await.unwrap().is_empty());
    }

    #[test]
    fn missing_model_assets_fail_at_construction() {
        let dir = TempDir::new().unwrap();
        let config = EmbeddingConfig {
            mode: EmbeddingMode::Onnx,
            model_dir: dir.path().to_path_buf(),
            ..EmbeddingConfig::default()
        };
        let Err(err) = EmbeddingModel::from_config(&config) else {
            panic!("expected missing model files to fail");
        };
        assert!(err.to_string().contains("are missing"), "unexpected error: {err}");
    }

    #[test]
    fn embedding_mode_parses_aliases() {
        assert_eq!("stub".parse::<EmbeddingMode>().unwrap(), EmbeddingMode::Stub);
        assert_eq!("ONNX".parse::<EmbeddingMode>().unwrap(), EmbeddingMode::Onnx);
        assert!("gpu".parse::<EmbeddingMode>().is_err());
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let sim = EmbeddingModel::cosine_similarity(&a, &b);
        assert!((sim - 1.0).abs() < 1e-6);

        let c = vec![1.0, 0.0];
        let d = vec![0.0, 1.0];
        assert!(EmbeddingModel::cosine_similarity(&c, &d).abs() < 1e-6);

        let zero = vec![0.0, 0.0];
        assert_eq!(EmbeddingModel::cosine_similarity(&zero, &d), 0.0);
    }

    #[tokio::test]
    #[ignore = "Requires ONNX model assets under ./models"]
    async fn onnx_embeddings_are_stable() {
        let model = EmbeddingModel::from_config(&EmbeddingConfig::default()).unwrap();
        let a = model.embed("natural rattan basket").await.unwrap();
        let b = model.embed("natural rattan basket").await.unwrap();
        assert_eq!(a.len(), EMBEDDING_DIM);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5);
        }
    }
}
