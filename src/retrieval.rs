//! Query answering: embed → search → filter → extend → assemble → LLM.
//!
//! The context-assembly step is deterministic: candidates are stably
//! sorted by similarity, grouped by document in order of first
//! appearance, and each group is ordered by chunk index before overlap
//! trimming. Given the same candidate set and overlap, the emitted
//! context string is byte-identical across runs.
//!
//! Table rows never enter the context verbatim: the first row of a
//! table pulls the whole stored rendering in once, and the remaining
//! rows of that table are skipped.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::embedding::{Embedder, EmbeddingError};
use crate::llm::{LlmClient, LlmError};
use crate::models::{Answer, Chunk, ChunkKind, Source};
use crate::store::{Store, StoreError};

/// The `config` table row consulted for the LLM endpoint.
const LLM_CONFIG_ID: i32 = 1;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Tuning knobs for the retrieval flow.
#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    /// Candidate count passed to vector search.
    pub top_k: i64,
    /// Relevance threshold; candidates at or below it are rejected.
    pub min_distance: f64,
    /// Word overlap used by the chunker, trimmed back out here.
    pub overlap: usize,
    /// Context character budget.
    pub context_budget: usize,
}

pub struct RetrievalService {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    llm: LlmClient,
    opts: RetrievalOptions,
}

impl RetrievalService {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<dyn Embedder>,
        llm: LlmClient,
        opts: RetrievalOptions,
    ) -> Self {
        Self {
            store,
            embedder,
            llm,
            opts,
        }
    }

    /// Answer a prompt from the indexed corpus.
    pub async fn answer(&self, prompt: &str, use_local: bool) -> Result<Answer, QueryError> {
        if prompt.trim().is_empty() {
            return Err(QueryError::EmptyPrompt);
        }

        let query_vector = self.embedder.embed(prompt).await?;
        let candidates = self.store.search(&query_vector, self.opts.top_k).await?;

        let survivors = filter_by_distance(candidates, self.opts.min_distance);
        // 1.0 signals "no grounding" to the caller.
        let confidence = survivors.first().map(|c| c.distance).unwrap_or(1.0);

        let extended = self.extend_with_neighbours(survivors).await?;
        tracing::debug!(count = extended.len(), "candidates after coherence extension");

        let (context_text, context_chunks) = self.build_context(extended).await;
        let sources = self.collect_sources(&context_chunks).await?;

        let context_text = if context_text.is_empty() {
            "empty".to_string()
        } else {
            context_text
        };

        let cfg = self.store.get_llm_config(LLM_CONFIG_ID).await?;
        let answer = if use_local {
            self.llm.generate_local(&cfg, &context_text, prompt).await?
        } else {
            self.llm.chat_hosted(&cfg, &context_text, prompt).await?
        };

        Ok(Answer {
            answer,
            sources,
            confidence,
            timestamp: Utc::now(),
        })
    }

    /// Append the stored neighbours of every surviving text chunk that
    /// are not already in the set. Image and table-row chunks are not
    /// extended.
    async fn extend_with_neighbours(
        &self,
        chunks: Vec<Chunk>,
    ) -> Result<Vec<Chunk>, QueryError> {
        let mut seen: HashSet<Uuid> = chunks.iter().map(|c| c.id).collect();
        let mut extended = chunks;

        for i in 0..extended.len() {
            if extended[i].kind != ChunkKind::Text {
                continue;
            }
            let neighbours = self.store.neighbours(extended[i].id).await?;
            for neighbour in neighbours {
                if seen.insert(neighbour.id) {
                    tracing::debug!(
                        chunk = %neighbour.id,
                        index = neighbour.index,
                        "added coherence neighbour"
                    );
                    extended.push(neighbour);
                }
            }
        }
        Ok(extended)
    }

    /// Deterministic context assembly; returns the context string and the
    /// chunks actually appended, in emission order.
    async fn build_context(&self, chunks: Vec<Chunk>) -> (String, Vec<Chunk>) {
        let mut out = String::new();
        let mut included: Vec<Chunk> = Vec::new();
        let mut seen_tables: HashSet<Uuid> = HashSet::new();

        for (doc_id, group) in group_by_document(chunks) {
            let _ = writeln!(out, "Документ {doc_id}:");

            let trimmed = trim_overlaps(group, self.opts.overlap);
            for chunk in trimmed {
                if let (ChunkKind::TableRow, Some(table_id)) = (chunk.kind, chunk.table_id) {
                    if seen_tables.contains(&table_id) {
                        continue;
                    }
                    let table = match self.store.get_table(table_id).await {
                        Ok(table) => table,
                        Err(e) => {
                            tracing::warn!(table = %table_id, error = %e, "failed to load table, skipping");
                            continue;
                        }
                    };
                    out.push_str("\nТаблица:\n");
                    out.push_str(&table.content);
                    out.push_str("\n\n");
                    seen_tables.insert(table_id);
                    included.push(chunk);
                } else {
                    if !chunk.section.is_empty() {
                        let _ = writeln!(out, "## {}", chunk.section);
                    }
                    out.push_str(&chunk.content);
                    out.push_str("\n\n");
                    included.push(chunk);
                }

                if out.len() > self.opts.context_budget {
                    tracing::info!(
                        limit = self.opts.context_budget,
                        "context budget reached for document"
                    );
                    break;
                }
            }
            out.push('\n');
        }

        tracing::debug!(
            length = out.len(),
            chunks = included.len(),
            tables = seen_tables.len(),
            "context assembled"
        );
        (out, included)
    }

    async fn collect_sources(&self, chunks: &[Chunk]) -> Result<Vec<Source>, QueryError> {
        let mut titles: HashMap<Uuid, String> = HashMap::new();
        let mut sources = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let title = match titles.get(&chunk.doc_id) {
                Some(title) => title.clone(),
                None => {
                    let doc = self.store.get_document(chunk.doc_id).await?;
                    titles.insert(chunk.doc_id, doc.title.clone());
                    doc.title
                }
            };
            sources.push(Source {
                doc_id: chunk.doc_id.to_string(),
                title,
                chunk_text: chunk.content.clone(),
                index: chunk.index,
            });
        }
        Ok(sources)
    }
}

/// Keep chunks above the relevance threshold; log the rejects.
fn filter_by_distance(chunks: Vec<Chunk>, min_distance: f64) -> Vec<Chunk> {
    chunks
        .into_iter()
        .filter(|chunk| {
            let keep = chunk.distance > min_distance;
            if !keep {
                tracing::info!(
                    chunk = %chunk.id,
                    distance = chunk.distance,
                    threshold = min_distance,
                    "chunk rejected by quality filter"
                );
            }
            keep
        })
        .collect()
}

/// Stable-sort by similarity, then group by document preserving the order
/// in which documents first appear; each group is ordered by index.
fn group_by_document(mut chunks: Vec<Chunk>) -> Vec<(Uuid, Vec<Chunk>)> {
    chunks.sort_by(|a, b| {
        b.distance
            .partial_cmp(&a.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut order: Vec<Uuid> = Vec::new();
    let mut groups: HashMap<Uuid, Vec<Chunk>> = HashMap::new();
    for chunk in chunks {
        if !groups.contains_key(&chunk.doc_id) {
            order.push(chunk.doc_id);
        }
        groups.entry(chunk.doc_id).or_default().push(chunk);
    }

    order
        .into_iter()
        .map(|doc_id| {
            let mut group = groups.remove(&doc_id).unwrap_or_default();
            group.sort_by_key(|c| c.index);
            (doc_id, group)
        })
        .collect()
}

/// Drop the leading `overlap` words from every chunk that directly
/// follows its predecessor (`index = prev.index + 1`, same document).
/// A text chunk with no words left is skipped entirely; non-text chunks
/// are kept whole.
fn trim_overlaps(chunks: Vec<Chunk>, overlap: usize) -> Vec<Chunk> {
    if chunks.len() <= 1 || overlap == 0 {
        return chunks;
    }

    let mut result: Vec<Chunk> = Vec::with_capacity(chunks.len());
    for i in 0..chunks.len() {
        if i == 0 {
            result.push(chunks[i].clone());
            continue;
        }

        let prev = &chunks[i - 1];
        let chunk = &chunks[i];
        let adjacent = chunk.doc_id == prev.doc_id && chunk.index == prev.index + 1;

        if !adjacent || chunk.kind != ChunkKind::Text {
            result.push(chunk.clone());
            continue;
        }

        let words: Vec<&str> = chunk.content.split_whitespace().collect();
        if words.len() > overlap {
            let mut trimmed = chunk.clone();
            trimmed.content = words[overlap..].join(" ");
            result.push(trimmed);
        } else {
            tracing::debug!(
                chunk = %chunk.id,
                index = chunk.index,
                "chunk shorter than overlap, dropped"
            );
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkKind, Document, FullTable};
    use crate::store::memory::MemoryStore;
    use crate::store::LlmConfigPatch;
    use async_trait::async_trait;
    use chrono::Utc;
    use httpmock::{Method::POST, MockServer};
    use serde_json::json;

    struct MockEmbedder;

    #[async_trait]
    impl Embedder for MockEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Ok(vec![1.0, 0.0, 0.0])
        }
    }

    fn options(overlap: usize, budget: usize) -> RetrievalOptions {
        RetrievalOptions {
            top_k: 3,
            min_distance: 0.55,
            overlap,
            context_budget: budget,
        }
    }

    fn service(store: Arc<MemoryStore>, opts: RetrievalOptions) -> RetrievalService {
        RetrievalService::new(store, Arc::new(MockEmbedder), LlmClient::new(None), opts)
    }

    fn text_chunk(doc_id: Uuid, index: i32, content: &str, distance: f64) -> Chunk {
        let mut chunk = Chunk::new(doc_id, index, ChunkKind::Text, content.to_string());
        chunk.distance = distance;
        chunk
    }

    async fn seed_document(store: &MemoryStore, doc_id: Uuid, title: &str) {
        store
            .save_document(&Document {
                id: doc_id,
                title: title.to_string(),
                source: "pdf".into(),
                source_path: "/drop/doc.pdf".into(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
                version: 1,
                chunks: Vec::new(),
                tables: Vec::new(),
            })
            .await
            .unwrap();
    }

    #[test]
    fn filter_rejects_at_or_below_threshold() {
        let doc = Uuid::new_v4();
        let chunks = vec![
            text_chunk(doc, 0, "a", 0.9),
            text_chunk(doc, 1, "b", 0.55),
            text_chunk(doc, 2, "c", 0.2),
        ];
        let kept = filter_by_distance(chunks, 0.55);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].index, 0);
    }

    #[test]
    fn groups_preserve_first_appearance_order() {
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        let chunks = vec![
            text_chunk(doc_b, 7, "b-seven", 0.8),
            text_chunk(doc_a, 1, "a-one", 0.9),
            text_chunk(doc_b, 3, "b-three", 0.7),
        ];
        let groups = group_by_document(chunks);
        // doc_a holds the best-scoring chunk, so it comes first.
        assert_eq!(groups[0].0, doc_a);
        assert_eq!(groups[1].0, doc_b);
        // Within a group, index order wins.
        let indices: Vec<i32> = groups[1].1.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![3, 7]);
    }

    #[test]
    fn trim_drops_leading_overlap_words() {
        let doc = Uuid::new_v4();
        let chunks = vec![
            text_chunk(doc, 4, "alpha beta gamma delta epsilon", 0.9),
            text_chunk(doc, 5, "delta epsilon zeta eta theta", 0.8),
        ];
        let trimmed = trim_overlaps(chunks, 2);
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed[0].content, "alpha beta gamma delta epsilon");
        assert_eq!(trimmed[1].content, "zeta eta theta");
    }

    #[test]
    fn trim_skips_chunks_shorter_than_overlap() {
        let doc = Uuid::new_v4();
        let chunks = vec![
            text_chunk(doc, 0, "one two three", 0.9),
            text_chunk(doc, 1, "four", 0.8),
        ];
        let trimmed = trim_overlaps(chunks, 2);
        assert_eq!(trimmed.len(), 1);
    }

    #[test]
    fn trim_keeps_json_chunks_whole() {
        let doc = Uuid::new_v4();
        let mut json_chunk = Chunk::new(doc, 1, ChunkKind::Json, "{\"a\": 1, \"b\": 2}".into());
        json_chunk.distance = 0.8;
        let chunks = vec![text_chunk(doc, 0, "alpha beta gamma", 0.9), json_chunk];
        let trimmed = trim_overlaps(chunks, 2);
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed[1].content, "{\"a\": 1, \"b\": 2}");
    }

    #[test]
    fn trim_ignores_non_consecutive_chunks() {
        let doc = Uuid::new_v4();
        let chunks = vec![
            text_chunk(doc, 0, "alpha beta gamma", 0.9),
            text_chunk(doc, 5, "delta epsilon zeta", 0.8),
        ];
        let trimmed = trim_overlaps(chunks, 2);
        assert_eq!(trimmed[1].content, "delta epsilon zeta");
    }

    #[tokio::test]
    async fn coherence_extension_pulls_both_neighbours() {
        let store = Arc::new(MemoryStore::new());
        let doc = Uuid::new_v4();

        let mut chunks = vec![
            text_chunk(doc, 4, "alpha beta gamma delta epsilon", 0.0),
            text_chunk(doc, 5, "delta epsilon zeta eta theta", 0.0),
            text_chunk(doc, 6, "eta theta iota kappa lambda", 0.0),
        ];
        for (i, chunk) in chunks.iter_mut().enumerate() {
            chunk.coh_prev = Some(3 + i as i32);
            chunk.coh_next = Some(5 + i as i32);
            chunk.embedding = Some(vec![1.0, 0.0, 0.0]);
            store.save_chunk(chunk).await.unwrap();
        }

        let svc = service(store.clone(), options(2, 40_000));
        let mut hit = chunks[1].clone();
        hit.distance = 0.9;

        let extended = svc.extend_with_neighbours(vec![hit]).await.unwrap();
        let mut indices: Vec<i32> = extended.iter().map(|c| c.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![4, 5, 6]);

        // Context places them in index order with overlap trimmed.
        let (context, included) = svc.build_context(extended).await;
        assert_eq!(included.len(), 3);
        let pos_alpha = context.find("alpha beta gamma delta epsilon").unwrap();
        let pos_mid = context.find("zeta eta theta").unwrap();
        let pos_tail = context.find("iota kappa lambda").unwrap();
        assert!(pos_alpha < pos_mid && pos_mid < pos_tail);
        // Overlap words from the predecessors do not repeat.
        assert_eq!(context.matches("delta epsilon").count(), 1);
    }

    #[tokio::test]
    async fn table_row_hit_rehydrates_full_table_once() {
        let store = Arc::new(MemoryStore::new());
        let doc = Uuid::new_v4();
        let table_id = Uuid::new_v4();

        store
            .save_table(&FullTable {
                id: table_id,
                doc_id: doc,
                index: 0,
                content: "| Параметр | Описание |\n| --- | --- |\n| Серия | 10 |\n| Залог | 5000 |\n| Срок | 90 дней |\n".into(),
            })
            .await
            .unwrap();

        let mut rows = Vec::new();
        for (i, (key, value)) in [("Серия", "10"), ("Залог", "5000"), ("Срок", "90 дней")]
            .iter()
            .enumerate()
        {
            let mut chunk = Chunk::new(doc, i as i32, ChunkKind::TableRow, value.to_string());
            chunk.key = Some(key.to_string());
            chunk.table_id = Some(table_id);
            chunk.distance = 0.9 - i as f64 * 0.01;
            rows.push(chunk);
        }

        let svc = service(store.clone(), options(2, 40_000));
        let (context, included) = svc.build_context(rows).await;

        assert_eq!(context.matches("Таблица:").count(), 1);
        assert!(context.contains("| Серия | 10 |"));
        // Only the rehydrating row is attributed; sibling rows are skipped.
        assert_eq!(included.len(), 1);
    }

    #[tokio::test]
    async fn budget_stops_a_document_after_the_crossing_chunk() {
        let store = Arc::new(MemoryStore::new());
        let doc = Uuid::new_v4();

        let chunks: Vec<Chunk> = (0..10)
            .map(|i| text_chunk(doc, i, &"x".repeat(30), 0.9 - i as f64 * 0.01))
            .collect();

        let svc = service(store.clone(), options(0, 100));
        let (context, included) = svc.build_context(chunks).await;

        assert!(included.len() <= 4, "included {} chunks", included.len());
        // Budget may be exceeded by at most the crossing chunk.
        assert!(context.len() <= 100 + 30 + 64);
    }

    #[tokio::test]
    async fn context_assembly_is_deterministic() {
        let store = Arc::new(MemoryStore::new());
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        let chunks = vec![
            text_chunk(doc_a, 0, "alpha beta gamma", 0.9),
            text_chunk(doc_b, 2, "delta epsilon zeta", 0.8),
            text_chunk(doc_a, 1, "gamma eta theta", 0.7),
        ];

        let svc = service(store.clone(), options(1, 40_000));
        let (first, _) = svc.build_context(chunks.clone()).await;
        let (second, _) = svc.build_context(chunks).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn cold_query_answers_with_no_sources_and_full_confidence() {
        let store = Arc::new(MemoryStore::new());
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate").body_contains("empty");
                then.status(200)
                    .json_body(json!({ "response": "I have no grounding for that." }));
            })
            .await;
        store
            .set_llm_config(
                1,
                &LlmConfigPatch {
                    llm_url: Some(format!("{}/api/generate", server.base_url())),
                    llm_model: Some("answerer".into()),
                    prompt_str: Some("system".into()),
                },
            )
            .await
            .unwrap();

        let svc = service(store, options(2, 40_000));
        let answer = svc.answer("what is the fare?", true).await.unwrap();

        assert!(!answer.answer.is_empty());
        assert!(answer.sources.is_empty());
        assert_eq!(answer.confidence, 1.0);
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(store, options(2, 40_000));
        let err = svc.answer("   ", true).await.expect_err("validation");
        assert!(matches!(err, QueryError::EmptyPrompt));
    }

    #[tokio::test]
    async fn sources_carry_document_titles() {
        let store = Arc::new(MemoryStore::new());
        let doc = Uuid::new_v4();
        seed_document(&store, doc, "fare rules 2024").await;

        let svc = service(store, options(0, 40_000));
        let chunks = vec![text_chunk(doc, 0, "alpha", 0.9)];
        let sources = svc.collect_sources(&chunks).await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].title, "fare rules 2024");
        assert_eq!(sources[0].index, 0);
        assert_eq!(sources[0].doc_id, doc.to_string());
    }
}
