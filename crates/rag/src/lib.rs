pub mod embedding;
pub mod ingest;
pub mod search;
pub mod store;

pub use embedding::{EmbeddingBackend, EmbeddingClient, HashEmbedder, HashEmbedderConfig};
pub use ingest::{chunk_text, ingest_path, load_document, DEFAULT_CHUNK_CHARS};
pub use search::{ChunkInsert, KnowledgeBase, SearchHit, VectorSearch};
pub use store::{KnowledgeStore, ScoredChunk, StoredChunk};
