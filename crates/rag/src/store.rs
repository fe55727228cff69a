use anyhow::{anyhow, Result};
use bytemuck::{cast_slice, try_cast_slice};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};

/// SQLite-backed chunk store. Each call opens its own connection so the
/// store can be cloned into blocking tasks freely.
#[derive(Clone)]
pub struct KnowledgeStore {
    path: PathBuf,
}

impl KnowledgeStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store.init()?;
        Ok(store)
    }

    fn connection(&self) -> Result<Connection> {
        Ok(Connection::open(&self.path)?)
    }

    pub fn init(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                category TEXT,
                source TEXT,
                embedding BLOB NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_category ON chunks(category);
            "#,
        )?;
        Ok(())
    }

    pub fn add_chunks(&self, chunks: &[StoredChunk]) -> Result<usize> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        for chunk in chunks {
            let embedding_blob = cast_slice::<f32, u8>(&chunk.embedding);
            tx.execute(
                "INSERT OR REPLACE INTO chunks (id, content, category, source, embedding) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    chunk.id,
                    chunk.content,
                    chunk.category,
                    chunk.source,
                    embedding_blob
                ],
            )?;
        }
        tx.commit()?;
        Ok(chunks.len())
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Ranks chunks by squared Euclidean distance to `query_embedding`,
    /// closest first.
    pub fn search(
        &self,
        query_embedding: &[f32],
        category: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, content, category, embedding
            FROM chunks
            WHERE ?1 IS NULL OR category = ?1
            "#,
        )?;
        let mut rows = stmt.query(params![category])?;
        let mut hits = Vec::new();
        while let Some(row) = rows.next()? {
            let embedding_blob: Vec<u8> = row.get(3)?;
            // Blob alignment is not guaranteed, copy out when the cast fails.
            let embedding: Vec<f32> = match try_cast_slice::<u8, f32>(&embedding_blob) {
                Ok(values) => values.to_vec(),
                Err(_) => decode_unaligned(&embedding_blob)?,
            };
            hits.push(ScoredChunk {
                id: row.get(0)?,
                content: row.get(1)?,
                category: row.get(2)?,
                distance: squared_distance(query_embedding, &embedding),
            });
        }
        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(top_k);
        Ok(hits)
    }
}

#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub id: String,
    pub content: String,
    pub category: Option<String>,
    pub source: Option<String>,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub id: String,
    pub content: String,
    pub category: Option<String>,
    pub distance: f32,
}

fn decode_unaligned(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(anyhow!("invalid embedding blob of {} bytes", blob.len()));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|bytes| f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect())
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::MAX;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}
