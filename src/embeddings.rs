use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use crate::error::{RecallError, Result};

/// Narrow contract over whichever embedding backend the host selected.
/// Implementations: [`LocalEmbedding`] (in-process fastembed model) and
/// [`crate::embeddings_http::OpenAiCompatEmbedding`] (hosted API).
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text. Returns one vector of `dimensions()` floats.
    /// One message is the indexer's unit of work (cancellation checkpoints
    /// and failure retry are per message), so one text is the unit here.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn model_name(&self) -> &str;

    fn dimensions(&self) -> usize;
}

/// Embedding dimension for bge-small-en-v1.5.
pub const LOCAL_DIMENSIONS: usize = 384;

/// Wraps the fastembed TextEmbedding model (bge-small-en-v1.5, 384 dims).
/// Model is downloaded and cached on first use (~33MB, one-time).
///
/// The inner `TextEmbedding` session is protected by a `Mutex` so that
/// concurrent calls from search queries and background indexing are
/// serialized, preventing heap corruption in the ONNX Runtime C++ layer.
pub struct LocalEmbedding {
    model: Mutex<TextEmbedding>,
}

impl LocalEmbedding {
    /// Initialize the embedding model. Downloads on first run, cached
    /// under `cache_dir` afterwards.
    pub fn new(cache_dir: &Path, show_progress: bool) -> Result<Self> {
        let model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::BGESmallENV15)
                .with_cache_dir(cache_dir.to_path_buf())
                .with_show_download_progress(show_progress),
        )
        .map_err(|e| RecallError::ProviderUnavailable(format!("model init: {e}")))?;
        Ok(Self {
            model: Mutex::new(model),
        })
    }

    fn embed_sync(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let model = self
            .model
            .lock()
            .map_err(|e| RecallError::ProviderUnavailable(format!("model lock poisoned: {e}")))?;
        let results = model
            .embed(texts, None)
            .map_err(|e| RecallError::ProviderUnavailable(format!("inference: {e}")))?;
        Ok(results.into_iter().map(normalize).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut results = self.embed_sync(vec![text.to_string()])?;
        results
            .pop()
            .ok_or_else(|| RecallError::ProviderUnavailable("empty embedding output".into()))
    }

    fn model_name(&self) -> &str {
        "bge-small-en-v1.5"
    }

    fn dimensions(&self) -> usize {
        LOCAL_DIMENSIONS
    }
}

/// L2-normalize a vector so cosine similarity == dot product.
/// bge-small-en-v1.5 outputs are already normalized, but we normalize
/// anyway to guarantee the store's score math holds for every backend.
pub fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-10 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

/// Cosine similarity between two vectors, clamped to [0, 1].
/// Inputs are expected to be L2-normalized; the clamp keeps slightly
/// negative similarities from leaking into score fusion.
pub fn cosine_score(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot.clamp(0.0, 1.0)
}
