use anyhow::{anyhow, Result};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::env;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Copy)]
pub struct HashEmbedderConfig {
    pub dimensions: usize,
    pub seed: u64,
}

impl Default for HashEmbedderConfig {
    fn default() -> Self {
        Self {
            dimensions: 256,
            seed: 1337,
        }
    }
}

/// Bag-of-words hashing embedder. Deterministic and offline, good enough for
/// local knowledge bases and tests.
#[derive(Clone)]
pub struct HashEmbedder {
    config: HashEmbedderConfig,
}

impl HashEmbedder {
    pub fn new(config: HashEmbedderConfig) -> Self {
        Self { config }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let dims = self.config.dimensions.max(1);
        let mut vector = vec![0f32; dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
        {
            let bucket = self.bucket_for(token);
            vector[bucket] += 1.0;
        }
        normalize(&mut vector);
        vector
    }

    fn bucket_for(&self, token: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        hasher.write_u64(self.config.seed);
        token.to_lowercase().hash(&mut hasher);
        (hasher.finish() as usize) % self.config.dimensions.max(1)
    }
}

#[derive(Clone)]
pub enum EmbeddingBackend {
    Hash(HashEmbedder),
    Remote(RemoteEmbeddingClient),
}

#[derive(Clone)]
pub struct EmbeddingClient {
    backend: EmbeddingBackend,
}

impl EmbeddingClient {
    pub fn from_env() -> Result<Self> {
        match env::var("EMBEDDING_PROVIDER")
            .unwrap_or_else(|_| "hash".to_string())
            .to_lowercase()
            .as_str()
        {
            "openai" => {
                let model = env::var("EMBEDDING_MODEL")
                    .unwrap_or_else(|_| "text-embedding-3-small".to_string());
                Ok(Self {
                    backend: EmbeddingBackend::Remote(RemoteEmbeddingClient::new(
                        "https://api.openai.com/v1",
                        "OPENAI_API_KEY",
                        &model,
                    )?),
                })
            }
            "mistral" => {
                let model =
                    env::var("EMBEDDING_MODEL").unwrap_or_else(|_| "mistral-embed".to_string());
                Ok(Self {
                    backend: EmbeddingBackend::Remote(RemoteEmbeddingClient::new(
                        "https://api.mistral.ai/v1",
                        "MISTRAL_API_KEY",
                        &model,
                    )?),
                })
            }
            _ => {
                let dims = env::var("HASH_EMBED_DIMENSIONS")
                    .ok()
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(HashEmbedderConfig::default().dimensions);
                Ok(Self {
                    backend: EmbeddingBackend::Hash(HashEmbedder::new(HashEmbedderConfig {
                        dimensions: dims,
                        seed: 1337,
                    })),
                })
            }
        }
    }

    pub fn hash() -> Self {
        Self {
            backend: EmbeddingBackend::Hash(HashEmbedder::new(HashEmbedderConfig::default())),
        }
    }

    pub fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        match &self.backend {
            EmbeddingBackend::Hash(embedder) => Ok(inputs
                .iter()
                .map(|text| embedder.embed_text(text))
                .collect()),
            EmbeddingBackend::Remote(client) => {
                let mut vectors = client.embed_batch(inputs)?;
                for vector in vectors.iter_mut() {
                    normalize(vector);
                }
                Ok(vectors)
            }
        }
    }

    pub fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let inputs = vec![text.to_string()];
        let mut output = self.embed_batch(&inputs)?;
        output
            .pop()
            .ok_or_else(|| anyhow!("embedding backend returned no vector"))
    }
}

/// OpenAI-compatible `/embeddings` endpoint (OpenAI, Mistral).
#[derive(Clone)]
pub struct RemoteEmbeddingClient {
    http: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl RemoteEmbeddingClient {
    pub fn new(base_url: &str, key_var: &str, model: &str) -> Result<Self> {
        let api_key = env::var(key_var)
            .map_err(|_| anyhow!("{key_var} is required for {model} embeddings"))?;
        Ok(Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        })
    }

    pub fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.base_url);
        let payload = serde_json::json!({
            "model": self.model,
            "input": inputs,
        });
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "embeddings request failed: {}",
                response.status()
            ));
        }
        let parsed: EmbeddingResponse = response.json()?;
        if parsed.data.len() != inputs.len() {
            return Err(anyhow!(
                "embeddings response has {} vectors for {} inputs",
                parsed.data.len(),
                inputs.len()
            ));
        }
        Ok(parsed.data.into_iter().map(|data| data.embedding).collect())
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

pub(crate) fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return;
    }
    for value in vector.iter_mut() {
        *value /= norm;
    }
}
