use crate::error::EmbeddingError;
use crate::models::EMBEDDING_DIMENSIONS;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = EMBEDDING_DIMENSIONS;

/// Turns texts into fixed-width vectors, one per input, in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    fn dimensions(&self) -> usize;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Offline provider: each coordinate is derived from `sha256(text|i)` and the
/// vector is L2-normalized. Stable across runs and machines.
#[derive(Debug, Clone, Copy)]
pub struct HashEmbedder {
    pub dimensions: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl HashEmbedder {
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = (0..self.dimensions)
            .map(|index| {
                let mut hasher = Sha256::new();
                hasher.update(format!("{text}|{index}").as_bytes());
                let digest = hasher.finalize();
                let word = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
                ((f64::from(word) / 4_294_967_296.0) * 2.0 - 1.0) as f32
            })
            .collect::<Vec<_>>();

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        "hash-sha256"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
    pub batch_size: usize,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            timeout: Duration::from_secs(40),
            batch_size: 64,
        }
    }
}

/// Embeddings from an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    config: OpenAiConfig,
}

impl OpenAiEmbedder {
    pub fn new(config: OpenAiConfig) -> Result<Self, EmbeddingError> {
        let key = config.api_key.trim();
        if key.is_empty() || key == "<PUT_YOUR_KEY_HERE>" {
            return Err(EmbeddingError::MissingApiKey);
        }

        let client = Client::builder().timeout(config.timeout).build()?;
        let endpoint = format!("{}/embeddings", config.base_url.trim_end_matches('/'));

        Ok(Self {
            client,
            endpoint,
            config,
        })
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.config.api_key.trim())
            .json(&EmbeddingRequest {
                model: &self.config.model,
                input: batch,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(500).collect();
            return Err(EmbeddingError::Provider(format!(
                "embeddings request to {} returned {status}: {snippet}",
                self.endpoint
            )));
        }

        let mut parsed: EmbeddingResponse = response.json().await?;
        parsed.data.sort_by_key(|entry| entry.index);

        if parsed.data.len() != batch.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: batch.len(),
                actual: parsed.data.len(),
            });
        }

        Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect())
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn name(&self) -> &str {
        &self.config.model
    }

    fn dimensions(&self) -> usize {
        DEFAULT_EMBEDDING_DIMENSIONS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut vectors = Vec::with_capacity(texts.len());

        for batch in texts.chunks(self.config.batch_size.max(1)) {
            let embedded = self.embed_batch(batch).await?;
            check_dimensions(&embedded, self.dimensions())?;
            vectors.extend(embedded);
        }

        Ok(vectors)
    }
}

/// Rejects any vector whose width differs from `expected`.
pub fn check_dimensions(vectors: &[Vec<f32>], expected: usize) -> Result<(), EmbeddingError> {
    match vectors.iter().find(|vector| vector.len() != expected) {
        Some(vector) => Err(EmbeddingError::DimensionMismatch {
            expected,
            actual: vector.len(),
        }),
        None => Ok(()),
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::default();
        let texts = vec!["Hydraulic pressure and flow".to_string()];
        let first = embedder.embed(&texts).await.unwrap();
        let second = embedder.embed(&texts).await.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn hash_embedder_outputs_unit_vectors_of_configured_width() {
        let embedder = HashEmbedder { dimensions: 32 };
        let vector = embedder.embed_one("abc");
        assert_eq!(vector.len(), 32);
        let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn default_width_matches_schema() {
        assert_eq!(HashEmbedder::default().embed_one("x").len(), 1536);
    }

    #[test]
    fn different_texts_embed_differently() {
        let embedder = HashEmbedder { dimensions: 16 };
        assert_ne!(embedder.embed_one("pump"), embedder.embed_one("valve"));
    }

    #[test]
    fn dimension_check_reports_the_offending_width() {
        let vectors = vec![vec![0.0; 4], vec![0.0; 3]];
        match check_dimensions(&vectors, 4) {
            Err(EmbeddingError::DimensionMismatch { expected, actual }) => {
                assert_eq!((expected, actual), (4, 3));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn openai_embedder_requires_a_real_key() {
        assert!(matches!(
            OpenAiEmbedder::new(OpenAiConfig::new("  ")),
            Err(EmbeddingError::MissingApiKey)
        ));
        assert!(matches!(
            OpenAiEmbedder::new(OpenAiConfig::new("<PUT_YOUR_KEY_HERE>")),
            Err(EmbeddingError::MissingApiKey)
        ));
    }
}
