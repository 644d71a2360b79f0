//! OpenAI-compatible embeddings backend using the `/v1/embeddings` endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::embeddings::{normalize, EmbeddingProvider};
use crate::error::{RecallError, Result};

pub struct OpenAiCompatEmbedding {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dims: usize,
}

fn normalize_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn has_version_suffix(base_url: &str) -> bool {
    let Some(last_segment) = base_url.rsplit('/').next() else {
        return false;
    };
    let Some(rest) = last_segment.strip_prefix('v') else {
        return false;
    };
    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
}

/// Resolve the full embeddings endpoint from a user-supplied base URL.
/// Accepts a bare host, a `/v1`-style base, or the full endpoint itself.
fn embeddings_endpoint(base_url: &str) -> String {
    let normalized = normalize_base_url(base_url);
    if normalized.ends_with("/embeddings") {
        return normalized;
    }
    if normalized.ends_with("/v1") || has_version_suffix(&normalized) {
        return format!("{normalized}/embeddings");
    }
    format!("{normalized}/v1/embeddings")
}

impl OpenAiCompatEmbedding {
    pub fn new(base_url: String, api_key: String, model: String, dims: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: normalize_base_url(&base_url),
            model,
            dims,
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiCompatEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let req = EmbeddingRequest {
            model: self.model.clone(),
            input: vec![text.to_string()],
        };

        let mut resp = self
            .client
            .post(embeddings_endpoint(&self.base_url))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| RecallError::ProviderUnavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| RecallError::ProviderUnavailable(e.to_string()))?
            .json::<EmbeddingResponse>()
            .await
            .map_err(|e| RecallError::ProviderUnavailable(format!("bad response body: {e}")))?;

        if resp.data.len() != 1 {
            return Err(RecallError::ProviderUnavailable(format!(
                "expected 1 embedding, got {}",
                resp.data.len()
            )));
        }
        let data = resp.data.remove(0);
        Ok(normalize(data.embedding))
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}
