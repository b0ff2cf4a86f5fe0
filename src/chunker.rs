//! Turns a token stream into retrievable chunks.
//!
//! Chunk indices are assigned monotonically from 0 across all token
//! kinds and stay dense: a chunk that fails to embed is skipped without
//! consuming an index. Per-chunk failures never abort the document.
//!
//! - Text tokens are windowed over whitespace-separated words; the
//!   window advances by its size minus the overlap.
//! - Each table token yields one [`FullTable`] record plus one `TableRow`
//!   chunk per row.
//! - Each image token yields one chunk whose content is the vision
//!   model's JSON extraction.
//!
//! After all tokens are processed, a fix-up pass links logically adjacent
//! chunks through `coh_prev`/`coh_next` so retrieval can extend a match
//! with its neighbours.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::embedding::Embedder;
use crate::markdown::{TableRow, Token};
use crate::models::{Chunk, ChunkKind, FullTable};
use crate::vision::{VisionError, VisionModel};

/// Attempts granted to the vision model per image.
const VISION_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum ChunkError {
    /// Shutdown fired while the document was being chunked; the caller
    /// abandons the file so a later run can redo it.
    #[error("chunking cancelled")]
    Cancelled,
}

pub struct Chunker {
    embedder: Arc<dyn Embedder>,
    vision: Arc<dyn VisionModel>,
    chunk_size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vision: Arc<dyn VisionModel>,
        chunk_size: usize,
        overlap: usize,
    ) -> Self {
        assert!(overlap < chunk_size, "overlap must be less than chunk size");
        Self {
            embedder,
            vision,
            chunk_size,
            overlap,
        }
    }

    /// Chunk one document's token stream.
    pub async fn chunk_tokens(
        &self,
        doc_id: Uuid,
        tokens: &[Token],
        cancel: &watch::Receiver<bool>,
    ) -> Result<(Vec<Chunk>, Vec<FullTable>), ChunkError> {
        let mut chunks: Vec<Chunk> = Vec::new();
        let mut tables: Vec<FullTable> = Vec::new();

        for token in tokens {
            if *cancel.borrow() {
                return Err(ChunkError::Cancelled);
            }
            match token {
                Token::Text { content, section } => {
                    self.chunk_text(doc_id, content, section, &mut chunks).await;
                }
                Token::Table { rows, section, .. } => {
                    self.chunk_table(doc_id, rows, section, &mut chunks, &mut tables)
                        .await;
                }
                Token::Image { base64, section } => {
                    self.chunk_image(doc_id, base64, section, cancel, &mut chunks)
                        .await?;
                }
            }
        }

        link_neighbours(&mut chunks);
        Ok((chunks, tables))
    }

    async fn chunk_text(
        &self,
        doc_id: Uuid,
        content: &str,
        section: &str,
        chunks: &mut Vec<Chunk>,
    ) {
        let words: Vec<&str> = content.split_whitespace().collect();
        if words.is_empty() {
            return;
        }

        let step = self.chunk_size - self.overlap;
        let mut start = 0;
        loop {
            let end = (start + self.chunk_size).min(words.len());
            let window = words[start..end].join(" ");

            match self.embedder.embed(&window).await {
                Ok(embedding) => {
                    let mut chunk =
                        Chunk::new(doc_id, chunks.len() as i32, ChunkKind::Text, window);
                    chunk.section = section.to_string();
                    chunk.embedding = Some(embedding);
                    chunks.push(chunk);
                }
                Err(e) => {
                    tracing::warn!(%doc_id, window_start = start, error = %e, "skipping text chunk: embedding failed");
                }
            }

            if end == words.len() {
                break;
            }
            start += step;
        }
    }

    async fn chunk_table(
        &self,
        doc_id: Uuid,
        rows: &[TableRow],
        section: &str,
        chunks: &mut Vec<Chunk>,
        tables: &mut Vec<FullTable>,
    ) {
        if rows.is_empty() {
            return;
        }

        let table = FullTable {
            id: Uuid::new_v4(),
            doc_id,
            index: tables.len() as i32,
            content: render_table(rows),
        };

        for row in rows {
            let input = format!("Параметр: {}. Описание: {}.", row.key, row.value);
            match self.embedder.embed(&input).await {
                Ok(embedding) => {
                    let mut chunk = Chunk::new(
                        doc_id,
                        chunks.len() as i32,
                        ChunkKind::TableRow,
                        row.value.clone(),
                    );
                    chunk.section = section.to_string();
                    chunk.key = Some(row.key.clone());
                    chunk.table_id = Some(table.id);
                    chunk.embedding = Some(embedding);
                    chunks.push(chunk);
                }
                Err(e) => {
                    tracing::warn!(%doc_id, key = %row.key, error = %e, "skipping table row: embedding failed");
                }
            }
        }

        tables.push(table);
    }

    async fn chunk_image(
        &self,
        doc_id: Uuid,
        base64: &str,
        section: &str,
        cancel: &watch::Receiver<bool>,
        chunks: &mut Vec<Chunk>,
    ) -> Result<(), ChunkError> {
        let json = match self.vision.extract(base64, VISION_ATTEMPTS, cancel).await {
            Ok(json) => json,
            Err(VisionError::Cancelled) => return Err(ChunkError::Cancelled),
            Err(e) => {
                tracing::warn!(%doc_id, error = %e, "skipping image chunk: vision extraction failed");
                return Ok(());
            }
        };

        match self.embedder.embed(&json).await {
            Ok(embedding) => {
                let mut chunk = Chunk::new(doc_id, chunks.len() as i32, ChunkKind::Image, json);
                chunk.section = section.to_string();
                chunk.embedding = Some(embedding);
                chunks.push(chunk);
            }
            Err(e) => {
                tracing::warn!(%doc_id, error = %e, "skipping image chunk: embedding failed");
            }
        }
        Ok(())
    }
}

/// Full-table markdown rendering stored for rehydration.
fn render_table(rows: &[TableRow]) -> String {
    let mut out = String::from("| Параметр | Описание |\n| --- | --- |\n");
    for row in rows {
        out.push_str(&format!("| {} | {} |\n", row.key, row.value));
    }
    out
}

/// Link logically adjacent chunks: position `i` gets `coh_prev = i − 1`
/// and `coh_next = i + 1` at the non-boundary sides.
fn link_neighbours(chunks: &mut [Chunk]) {
    let n = chunks.len();
    for (i, chunk) in chunks.iter_mut().enumerate() {
        chunk.coh_prev = if i > 0 { Some(i as i32 - 1) } else { None };
        chunk.coh_next = if i + 1 < n { Some(i as i32 + 1) } else { None };
    }
}
