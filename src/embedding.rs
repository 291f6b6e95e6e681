use crate::completion::{http_client, send_with_backoff};
use crate::config::CompletionConfig;
use crate::error::{ReverieError, Result};
use crate::types::Embedding;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn dimension(&self) -> usize;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>>;

    async fn embed_one(&self, text: &str) -> Result<Embedding> {
        self.embed(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| ReverieError::Parse(format!("{} returned no embedding", self.name())))
    }
}

/// Zero-config embedding provider.
///
/// Deterministic and offline (FNV-hashed token buckets, L2-normalized). Used by
/// tests and by the CLI when no embedding service is configured.
#[derive(Debug, Clone)]
pub struct HashEmbeddingProvider {
    dimension: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn embed_text(&self, text: &str) -> Embedding {
        let mut vec = vec![0.0f32; self.dimension];
        let mut token_count = 0u32;

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            token_count += 1;
            let mut hash = 1469598103934665603u64;
            for b in token.to_lowercase().as_bytes() {
                hash ^= *b as u64;
                hash = hash.wrapping_mul(1099511628211u64);
            }

            let idx = (hash as usize) % self.dimension;
            vec[idx] += 1.0;
        }

        if token_count == 0 {
            return vec;
        }

        let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vec {
                *v /= norm;
            }
        }

        vec
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Embedding,
}

/// OpenAI-compatible `/embeddings` client sharing the completion backoff schedule
pub struct OpenAiEmbeddingProvider {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dimension: usize,
    backoff_ms: Vec<u64>,
}

impl OpenAiEmbeddingProvider {
    pub fn new(config: &CompletionConfig, api_key: impl Into<String>, dimension: usize) -> Result<Self> {
        Ok(Self {
            http: http_client(config)?,
            api_key: api_key.into(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.embedding_model.clone(),
            dimension,
            backoff_ms: config.backoff_ms.clone(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.base_url);
        let body = json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dimension,
        });

        let response = send_with_backoff("embedding", &self.backoff_ms, || {
            self.http.post(&url).bearer_auth(&self.api_key).json(&body)
        })
        .await?;

        let mut parsed: EmbeddingResponse = response.json().await?;
        if parsed.data.len() != texts.len() {
            return Err(ReverieError::Parse(format!(
                "asked for {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }
        parsed.data.sort_by_key(|d| d.index);
        debug!(count = texts.len(), model = %self.model, "embedded");

        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::cosine_similarity;

    #[tokio::test]
    async fn hash_embeddings_are_normalized_and_deterministic() {
        let provider = HashEmbeddingProvider::new(64);
        let a = provider.embed_one("the cat sat").await.unwrap();
        let b = provider.embed_one("The cat sat").await.unwrap();

        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn shared_words_raise_similarity() {
        let provider = HashEmbeddingProvider::new(256);
        let base = provider.embed_one("rust borrow checker").await.unwrap();
        let close = provider.embed_one("the borrow checker in rust").await.unwrap();
        let far = provider.embed_one("banana smoothie recipe").await.unwrap();

        assert!(cosine_similarity(&base, &close) > cosine_similarity(&base, &far));
    }

    #[tokio::test]
    async fn empty_text_embeds_to_zero() {
        let provider = HashEmbeddingProvider::new(8);
        assert!(provider.embed_one("").await.unwrap().iter().all(|x| *x == 0.0));
    }
}
