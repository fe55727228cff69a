use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tokio::task;
use tracing::info;

use crate::search::{ChunkInsert, VectorSearch};

pub const DEFAULT_CHUNK_CHARS: usize = 1200;
const INGEST_BATCH: usize = 50;

/// Reads a knowledge-base document as plain text. PDFs go through
/// `pdf-extract`; everything else must be UTF-8.
pub fn load_document(path: &Path) -> Result<String> {
    let is_pdf = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false);
    if is_pdf {
        return pdf_extract::extract_text(path)
            .with_context(|| format!("failed to extract text from {}", path.display()));
    }
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Packs blank-line separated paragraphs into chunks of at most `max_chars`
/// characters. Paragraphs longer than the limit are split on whitespace.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.split_whitespace().collect::<Vec<_>>().join(" ");
        if paragraph.is_empty() {
            continue;
        }
        let pieces = if paragraph.chars().count() > max_chars {
            split_long(&paragraph, max_chars)
        } else {
            vec![paragraph]
        };
        for piece in pieces {
            let needed = piece.chars().count() + if current.is_empty() { 0 } else { 2 };
            if !current.is_empty() && current.chars().count() + needed > max_chars {
                chunks.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(&piece);
        }
    }
    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks
}

fn split_long(paragraph: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for word in paragraph.split_whitespace() {
        let extra = word.chars().count() + usize::from(!current.is_empty());
        if !current.is_empty() && current.chars().count() + extra > max_chars {
            pieces.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Chunks one document and adds it to the search collaborator under
/// `category`. Chunk ids are `<file name>_<index>`.
pub async fn ingest_path(
    search: &dyn VectorSearch,
    path: &Path,
    category: &str,
    max_chars: usize,
) -> Result<usize> {
    let owned = path.to_path_buf();
    let chunks = task::spawn_blocking(move || {
        load_document(&owned).map(|text| chunk_text(&text, max_chars))
    })
    .await
    .context("document loading task failed")??;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("document")
        .to_string();
    let source = path.display().to_string();
    info!(
        source = %source,
        category,
        chunks = chunks.len(),
        "ingesting document"
    );
    let inserts: Vec<ChunkInsert> = chunks
        .into_iter()
        .enumerate()
        .map(|(idx, content)| ChunkInsert {
            id: format!("{file_name}_{idx}"),
            content,
            category: Some(category.to_string()),
            source: Some(source.clone()),
        })
        .collect();
    let mut total = 0usize;
    for batch in inserts.chunks(INGEST_BATCH) {
        total += search.add(batch.to_vec()).await?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingClient;
    use crate::search::KnowledgeBase;
    use crate::store::KnowledgeStore;
    use tempfile::tempdir;

    #[test]
    fn chunk_text_packs_paragraphs() {
        let text = "First paragraph.\n\nSecond one.\n\n\n\nThird paragraph here.";
        let chunks = chunk_text(text, 30);
        assert_eq!(chunks, vec!["First paragraph.\n\nSecond one.", "Third paragraph here."]);
    }

    #[test]
    fn chunk_text_splits_oversized_paragraphs() {
        let text = "word ".repeat(50);
        let chunks = chunk_text(&text, 20);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.chars().count() <= 20));
        assert!(chunk_text("   \n\n  ", 20).is_empty());
    }

    #[tokio::test]
    async fn ingest_path_indexes_text_files() {
        let dir = tempdir().unwrap();
        let doc = dir.path().join("guide.md");
        std::fs::write(&doc, "Mot de passe oublié.\n\nContactez le support.").unwrap();
        let store = KnowledgeStore::open(dir.path().join("kb.sqlite")).unwrap();
        let kb = KnowledgeBase::new(store.clone(), EmbeddingClient::hash());
        let added = ingest_path(&kb, &doc, "Operational and Practical User Guides", 25)
            .await
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(store.count().unwrap(), 2);
        let hits = kb.query("mot de passe", None, 1).await.unwrap();
        assert_eq!(hits[0].id, "guide.md_0");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn missing_document_is_reported_from_loader_task() {
        let dir = tempdir().unwrap();
        let store = KnowledgeStore::open(dir.path().join("kb.sqlite")).unwrap();
        let kb = KnowledgeBase::new(store.clone(), EmbeddingClient::hash());
        let missing = dir.path().join("absent.txt");
        let err = ingest_path(&kb, &missing, "Other", 100).await.unwrap_err();
        assert!(err.to_string().contains("absent.txt"));
        assert_eq!(store.count().unwrap(), 0);
    }
}
