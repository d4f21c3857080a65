//! Embedding providers: text → fixed-length vector.
//!
//! - [`OnnxEmbedder`]: bge-small-en-v1.5 (384 dimensions) via ONNX Runtime with
//!   mean pooling and L2 normalization. The session is blocking, so every call
//!   runs on the blocking thread pool.
//! - [`HashingEmbedder`]: deterministic feature hashing of token prefixes; no
//!   model download, suitable for offline hosts and tests.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use hf_hub::api::sync::ApiBuilder;
use ort::inputs;
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::value::Tensor;
use parking_lot::Mutex;
use tokenizers::{Tokenizer, TruncationParams};
use tracing::info;

use crate::errors::Error;

/// Embedding dimensions for bge-small-en-v1.5 model.
pub const EMBEDDING_DIMS: usize = 384;

/// Maps text to a fixed-length vector.
///
/// Implementations must be deterministic for identical input and always
/// return `dimensions()` values.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, Error>;

    /// Length of every vector returned by `embed`.
    fn dimensions(&self) -> usize;

    /// Identifier recorded in the store so a later model swap can be detected.
    fn model_name(&self) -> &str;
}

fn onnx_error<E: Into<ort::Error>>(err: E) -> Error {
    Error::Onnx(err.into())
}

/// Blocking ONNX session plus tokenizer.
struct OnnxSession {
    session: Session,
    tokenizer: Tokenizer,
    requires_token_type_ids: bool,
}

impl OnnxSession {
    fn load(model_id: &str, cache_dir: Option<&Path>) -> Result<Self, Error> {
        let mut builder = ApiBuilder::new();
        if let Some(dir) = cache_dir {
            builder = builder.with_cache_dir(dir.to_path_buf());
        }
        let api = builder.build()?;
        let repo = api.model(model_id.to_string());

        let model_path = repo
            .get("onnx/model.onnx")
            .or_else(|_| repo.get("model.onnx"))?;
        let tokenizer_path = repo.get("tokenizer.json")?;

        let mut tokenizer = Tokenizer::from_file(tokenizer_path)?;
        tokenizer
            .with_padding(None)
            .with_truncation(Some(TruncationParams {
                max_length: 512,
                ..Default::default()
            }))?;

        let session = Session::builder()
            .map_err(onnx_error)?
            .with_optimization_level(GraphOptimizationLevel::Level1)
            .map_err(onnx_error)?
            .commit_from_file(&model_path)
            .map_err(onnx_error)?;

        let requires_token_type_ids = session
            .inputs()
            .iter()
            .any(|input| input.name() == "token_type_ids");

        Ok(OnnxSession {
            session,
            tokenizer,
            requires_token_type_ids,
        })
    }

    /// Texts exceeding 512 tokens are truncated by the tokenizer.
    fn embed(&mut self, text: &str) -> Result<Vec<f32>, Error> {
        if text.is_empty() {
            return Ok(vec![0.0f32; EMBEDDING_DIMS]);
        }

        let encoding = self.tokenizer.encode(text, true)?;
        let input_ids = encoding.get_ids();
        let attention_mask = encoding.get_attention_mask();

        if input_ids.is_empty() {
            return Ok(vec![0.0f32; EMBEDDING_DIMS]);
        }

        let seq_len = input_ids.len();

        let input_ids_vec: Vec<i64> = input_ids.iter().map(|&id| id as i64).collect();
        let attention_mask_vec: Vec<i64> = attention_mask.iter().map(|&m| m as i64).collect();

        let input_ids_tensor =
            Tensor::from_array(([1usize, seq_len], input_ids_vec)).map_err(onnx_error)?;
        let attention_mask_tensor =
            Tensor::from_array(([1usize, seq_len], attention_mask_vec)).map_err(onnx_error)?;

        let outputs = if self.requires_token_type_ids {
            // Single sentence: all segment ids are zero.
            let token_type_ids_tensor =
                Tensor::from_array(([1usize, seq_len], vec![0i64; seq_len])).map_err(onnx_error)?;
            self.session
                .run(inputs![
                    "input_ids" => input_ids_tensor,
                    "attention_mask" => attention_mask_tensor,
                    "token_type_ids" => token_type_ids_tensor
                ])
                .map_err(onnx_error)?
        } else {
            self.session
                .run(inputs![
                    "input_ids" => input_ids_tensor,
                    "attention_mask" => attention_mask_tensor
                ])
                .map_err(onnx_error)?
        };

        let (shape, data) = outputs
            .get("last_hidden_state")
            .or_else(|| outputs.get("token_embeddings"))
            .ok_or_else(|| {
                Error::Inference(
                    "Output tensor 'last_hidden_state' or 'token_embeddings' not found".to_string(),
                )
            })?
            .try_extract_tensor::<f32>()
            .map_err(onnx_error)?;

        if shape.len() != 3 || shape[0] != 1 || shape[2] as usize != EMBEDDING_DIMS {
            return Err(Error::Inference(format!(
                "Unexpected output shape: {:?}, batch=1, hidden={} expected",
                shape, EMBEDDING_DIMS
            )));
        }

        let mut pooled = vec![0.0f32; EMBEDDING_DIMS];
        for (token_idx, chunk) in data.chunks(EMBEDDING_DIMS).take(seq_len).enumerate() {
            let mask_value = attention_mask.get(token_idx).copied().unwrap_or(0) as f32;
            for (pooled_value, value) in pooled.iter_mut().zip(chunk) {
                *pooled_value += value * mask_value;
            }
        }

        let mask_sum: f32 = attention_mask
            .iter()
            .take(seq_len)
            .map(|&m| m as f32)
            .sum::<f32>()
            .max(1e-9);
        for value in pooled.iter_mut() {
            *value /= mask_sum;
        }

        Ok(l2_normalize(&pooled))
    }
}

/// Local sentence-embedding model served through ONNX Runtime.
///
/// The loaded session is a process-scoped resource: create it once and share
/// the provider (`Arc<dyn EmbeddingProvider>`) with every engine that needs it.
pub struct OnnxEmbedder {
    session: Arc<Mutex<OnnxSession>>,
    model_id: String,
}

impl OnnxEmbedder {
    /// Load model from the HuggingFace cache, downloading it on first use.
    ///
    /// Blocking; prefer [`OnnxEmbedder::load`] from async code.
    pub fn new(model_id: &str, cache_dir: Option<&Path>) -> Result<Self, Error> {
        let session = OnnxSession::load(model_id, cache_dir)?;
        info!(model = model_id, "embedding model loaded");
        Ok(OnnxEmbedder {
            session: Arc::new(Mutex::new(session)),
            model_id: model_id.to_string(),
        })
    }

    /// Load the model on the blocking thread pool.
    pub async fn load(model_id: &str, cache_dir: Option<&Path>) -> Result<Self, Error> {
        let model_id = model_id.to_string();
        let cache_dir = cache_dir.map(Path::to_path_buf);
        tokio::task::spawn_blocking(move || OnnxEmbedder::new(&model_id, cache_dir.as_deref()))
            .await?
    }
}

#[async_trait]
impl EmbeddingProvider for OnnxEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, Error> {
        let session = Arc::clone(&self.session);
        let text = text.to_string();
        tokio::task::spawn_blocking(move || session.lock().embed(&text)).await?
    }

    fn dimensions(&self) -> usize {
        EMBEDDING_DIMS
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

/// Characters of each token kept by [`HashingEmbedder`].
const STEM_CHARS: usize = 4;

/// Deterministic feature-hashing embedder.
///
/// Each alphanumeric token is lowercased, cut to its first `STEM_CHARS`
/// characters (a crude stem, so "prefers" and "preferences" collide on
/// purpose) and hashed into one of `dimensions` buckets. The bucket counts are
/// L2-normalized. Empty input yields the zero vector.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
    name: String,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        HashingEmbedder {
            dimensions: dimensions.max(1),
            name: format!("hashing-{}", dimensions.max(1)),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let stem: String = token
                .chars()
                .flat_map(char::to_lowercase)
                .take(STEM_CHARS)
                .collect();
            let bucket = (fnv1a(stem.as_bytes()) % self.dimensions as u64) as usize;
            vector[bucket] += 1.0;
        }
        l2_normalize(&vector)
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        HashingEmbedder::new(EMBEDDING_DIMS)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, Error> {
        Ok(self.embed_sync(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.name
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

fn l2_normalize(vec: &[f32]) -> Vec<f32> {
    let norm: f32 = vec.iter().map(|&x| x * x).sum::<f32>().sqrt();
    let norm = norm.max(1e-9);

    vec.iter().map(|&x| x / norm).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::cosine_similarity;

    #[test]
    fn test_l2_normalize_unit_vector() {
        let normalized = l2_normalize(&[1.0, 0.0, 0.0]);
        let norm: f32 = normalized.iter().map(|&x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_l2_normalize_zero_vector() {
        assert_eq!(l2_normalize(&[0.0, 0.0, 0.0]), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_l2_normalize_magnitude() {
        let normalized = l2_normalize(&[3.0, 4.0]);
        assert!((normalized[0] - 0.6).abs() < 1e-6);
        assert!((normalized[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_hashing_embedder_is_deterministic() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed_sync("The user prefers dark mode");
        let b = embedder.embed_sync("The user prefers dark mode");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_hashing_embedder_shares_prefix_stems() {
        let embedder = HashingEmbedder::default();
        let note = embedder.embed_sync("The user prefers dark mode");
        let query = embedder.embed_sync("UI preferences");
        let unrelated = embedder.embed_sync("quarterly tax filing");

        let related = cosine_similarity(&note, &query).unwrap();
        let other = cosine_similarity(&note, &unrelated).unwrap();
        assert!(related > 0.25, "related similarity was {related}");
        assert!(related > other);
    }

    #[test]
    fn test_hashing_embedder_empty_input_is_zero_vector() {
        let embedder = HashingEmbedder::new(8);
        assert_eq!(embedder.embed_sync("  ...  "), vec![0.0f32; 8]);
    }

    #[tokio::test]
    async fn test_hashing_embedder_provider_contract() {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashingEmbedder::new(32));
        let v = embedder.embed("hello world").await.unwrap();
        assert_eq!(v.len(), embedder.dimensions());
        assert_eq!(embedder.model_name(), "hashing-32");
        let norm: f32 = v.iter().map(|&x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[ignore]
    #[tokio::test]
    async fn test_integration_onnx_simple_text() {
        let embedder = OnnxEmbedder::load("BAAI/bge-small-en-v1.5", None)
            .await
            .expect("load model");
        let embedding = embedder.embed("hello world").await.expect("embed text");

        assert_eq!(embedding.len(), EMBEDDING_DIMS);
        let norm: f32 = embedding.iter().map(|&x| x * x).sum::<f32>().sqrt();
        assert!(
            (norm - 1.0).abs() < 0.01,
            "Embedding should be L2-normalized"
        );
    }

    #[ignore]
    #[tokio::test]
    async fn test_integration_onnx_long_text_truncation() {
        let embedder = OnnxEmbedder::load("BAAI/bge-small-en-v1.5", None)
            .await
            .expect("load model");
        let long_text = "This is a sentence. ".repeat(200);
        let embedding = embedder.embed(&long_text).await.expect("embed long text");
        assert_eq!(embedding.len(), EMBEDDING_DIMS);
    }
}
