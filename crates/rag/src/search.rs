use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task;

use crate::embedding::EmbeddingClient;
use crate::store::{KnowledgeStore, StoredChunk};

/// One ranked passage returned by the search collaborator. Smaller distance
/// means closer to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub content: String,
    pub category: Option<String>,
    pub distance: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInsert {
    pub id: String,
    pub content: String,
    pub category: Option<String>,
    pub source: Option<String>,
}

/// The vector-search collaborator as seen by the triage pipeline.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn query(&self, text: &str, category: Option<&str>, k: usize)
        -> Result<Vec<SearchHit>>;

    async fn add(&self, batch: Vec<ChunkInsert>) -> Result<usize>;
}

#[derive(Clone)]
pub struct KnowledgeBase {
    store: KnowledgeStore,
    embeddings: EmbeddingClient,
}

impl KnowledgeBase {
    pub fn new(store: KnowledgeStore, embeddings: EmbeddingClient) -> Self {
        Self { store, embeddings }
    }

    pub fn store(&self) -> &KnowledgeStore {
        &self.store
    }
}

#[async_trait]
impl VectorSearch for KnowledgeBase {
    async fn query(
        &self,
        text: &str,
        category: Option<&str>,
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        let kb = self.clone();
        let text = text.to_string();
        let category = category.map(|c| c.to_string());
        task::spawn_blocking(move || -> Result<Vec<SearchHit>> {
            let embedding = kb.embeddings.embed(&text)?;
            let scored = kb.store.search(&embedding, category.as_deref(), k)?;
            Ok(scored
                .into_iter()
                .map(|chunk| SearchHit {
                    id: chunk.id,
                    content: chunk.content,
                    category: chunk.category,
                    distance: chunk.distance,
                })
                .collect())
        })
        .await
        .context("search task panicked")?
    }

    async fn add(&self, batch: Vec<ChunkInsert>) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let kb = self.clone();
        task::spawn_blocking(move || -> Result<usize> {
            let texts: Vec<String> = batch.iter().map(|chunk| chunk.content.clone()).collect();
            let vectors = kb.embeddings.embed_batch(&texts)?;
            let stored: Vec<StoredChunk> = batch
                .into_iter()
                .zip(vectors)
                .map(|(chunk, embedding)| StoredChunk {
                    id: chunk.id,
                    content: chunk.content,
                    category: chunk.category,
                    source: chunk.source,
                    embedding,
                })
                .collect();
            kb.store.add_chunks(&stored)
        })
        .await
        .context("ingest task panicked")?
    }
}
