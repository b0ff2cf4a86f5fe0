//! Persistence layer over the vector-enabled Postgres store.
//!
//! [`Store`] is the seam between the pipeline/retrieval code and the
//! database; [`PostgresStore`] implements it over a `sqlx::PgPool` with
//! embeddings carried as [`pgvector::Vector`] values.
//!
//! Semantics:
//!
//! - every trait call is one database transaction unit; the composite
//!   [`Store::replace_document`] wraps delete + upserts in one explicit
//!   transaction so a document is never half-replaced;
//! - *not found* is the distinguished [`StoreError::NotFound`] outcome,
//!   not a connectivity error;
//! - [`Store::search`] returns the top-k chunks by cosine similarity with
//!   `distance = 1 − cosine_distance` (higher is more similar), skipping
//!   rows without an embedding.

use async_trait::async_trait;
use pgvector::Vector;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Chunk, ChunkKind, Document, FullTable};

/// Errors surfaced by the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The named entity does not exist. A normal outcome, not a failure.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// Search was asked to rank against an empty vector.
    #[error("empty query vector")]
    EmptyQueryVector,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// The LLM endpoint configuration row.
#[derive(Debug, Clone, Serialize)]
pub struct LlmConfig {
    pub id: i32,
    pub llm_url: String,
    pub llm_model: String,
    pub prompt_str: String,
}

/// Partial update for the config row; only non-empty fields are applied.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmConfigPatch {
    pub llm_url: Option<String>,
    pub llm_model: Option<String>,
    pub prompt_str: Option<String>,
}

impl LlmConfigPatch {
    /// The `(column, value)` pairs that are present and non-empty.
    pub fn fields(&self) -> Vec<(&'static str, &str)> {
        let mut fields = Vec::new();
        if let Some(v) = self.llm_url.as_deref().filter(|v| !v.is_empty()) {
            fields.push(("llm_url", v));
        }
        if let Some(v) = self.llm_model.as_deref().filter(|v| !v.is_empty()) {
            fields.push(("llm_model", v));
        }
        if let Some(v) = self.prompt_str.as_deref().filter(|v| !v.is_empty()) {
            fields.push(("prompt_str", v));
        }
        fields
    }
}

/// Persistence operations needed by the pipeline and the retrieval
/// service.
#[async_trait]
pub trait Store: Send + Sync {
    /// Upsert the document row (chunks and tables are not touched).
    async fn save_document(&self, doc: &Document) -> Result<(), StoreError>;

    /// Fetch a document row; its `chunks`/`tables` collections are empty.
    async fn get_document(&self, id: Uuid) -> Result<Document, StoreError>;

    async fn delete_chunks(&self, doc_id: Uuid) -> Result<(), StoreError>;

    async fn save_chunk(&self, chunk: &Chunk) -> Result<(), StoreError>;

    async fn save_table(&self, table: &FullTable) -> Result<(), StoreError>;

    async fn get_table(&self, id: Uuid) -> Result<FullTable, StoreError>;

    /// The (≤ 2) chunks of the same document whose index equals the named
    /// chunk's `coh_prev` or `coh_next`, ordered by index.
    async fn neighbours(&self, chunk_id: Uuid) -> Result<Vec<Chunk>, StoreError>;

    /// Top-k chunks by cosine similarity against the query vector.
    async fn search(&self, query: &[f32], limit: i64) -> Result<Vec<Chunk>, StoreError>;

    /// Atomically replace a document: delete its chunks, upsert the row,
    /// save its tables and chunks, all inside one transaction.
    async fn replace_document(&self, doc: &Document) -> Result<(), StoreError>;

    async fn get_llm_config(&self, id: i32) -> Result<LlmConfig, StoreError>;

    /// Apply the non-empty subset of the patch to the config row.
    async fn set_llm_config(
        &self,
        id: i32,
        patch: &LlmConfigPatch,
    ) -> Result<LlmConfig, StoreError>;
}

/// Postgres-backed store.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

const CHUNK_COLUMNS: &str = r#"id, doc_id, "index", type, section, key, table_id, coherence_prev, coherence_next, content"#;

fn chunk_from_row(row: &PgRow) -> Chunk {
    let kind: String = row.get("type");
    Chunk {
        id: row.get("id"),
        doc_id: row.get("doc_id"),
        index: row.get("index"),
        kind: ChunkKind::from_str_lossy(&kind),
        section: row.get::<Option<String>, _>("section").unwrap_or_default(),
        key: row.get("key"),
        table_id: row.get("table_id"),
        coh_prev: row.get("coherence_prev"),
        coh_next: row.get("coherence_next"),
        content: row.get("content"),
        embedding: None,
        distance: 0.0,
    }
}

fn document_from_row(row: &PgRow) -> Document {
    Document {
        id: row.get("id"),
        title: row.get("title"),
        source: row.get::<Option<String>, _>("source").unwrap_or_default(),
        source_path: row
            .get::<Option<String>, _>("source_path")
            .unwrap_or_default(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        version: row.get("version"),
        chunks: Vec::new(),
        tables: Vec::new(),
    }
}

async fn insert_chunk<'e, E>(executor: E, chunk: &Chunk) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let embedding = chunk.embedding.clone().map(Vector::from);
    sqlx::query(
        r#"
        INSERT INTO chunks
            (id, doc_id, "index", type, section, key, table_id,
             coherence_prev, coherence_next, content, embedding)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(chunk.id)
    .bind(chunk.doc_id)
    .bind(chunk.index)
    .bind(chunk.kind.as_str())
    .bind(&chunk.section)
    .bind(chunk.key.clone())
    .bind(chunk.table_id)
    .bind(chunk.coh_prev)
    .bind(chunk.coh_next)
    .bind(&chunk.content)
    .bind(embedding)
    .execute(executor)
    .await?;
    Ok(())
}

async fn upsert_document<'e, E>(executor: E, doc: &Document) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO documents (id, title, source, source_path, created_at, updated_at, version)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (id) DO UPDATE SET
            title = EXCLUDED.title,
            source = EXCLUDED.source,
            source_path = EXCLUDED.source_path,
            updated_at = EXCLUDED.updated_at,
            version = EXCLUDED.version
        "#,
    )
    .bind(doc.id)
    .bind(&doc.title)
    .bind(&doc.source)
    .bind(&doc.source_path)
    .bind(doc.created_at)
    .bind(doc.updated_at)
    .bind(doc.version)
    .execute(executor)
    .await?;
    Ok(())
}

async fn upsert_table<'e, E>(executor: E, table: &FullTable) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO tables (id, doc_id, "index", content_md)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (id) DO UPDATE SET
            doc_id = EXCLUDED.doc_id,
            "index" = EXCLUDED."index",
            content_md = EXCLUDED.content_md
        "#,
    )
    .bind(table.id)
    .bind(table.doc_id)
    .bind(table.index)
    .bind(&table.content)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for PostgresStore {
    async fn save_document(&self, doc: &Document) -> Result<(), StoreError> {
        upsert_document(&self.pool, doc).await?;
        Ok(())
    }

    async fn get_document(&self, id: Uuid) -> Result<Document, StoreError> {
        let row = sqlx::query(
            "SELECT id, title, source, source_path, created_at, updated_at, version \
             FROM documents WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("document"))?;
        Ok(document_from_row(&row))
    }

    async fn delete_chunks(&self, doc_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM chunks WHERE doc_id = $1")
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_chunk(&self, chunk: &Chunk) -> Result<(), StoreError> {
        insert_chunk(&self.pool, chunk).await?;
        Ok(())
    }

    async fn save_table(&self, table: &FullTable) -> Result<(), StoreError> {
        upsert_table(&self.pool, table).await?;
        Ok(())
    }

    async fn get_table(&self, id: Uuid) -> Result<FullTable, StoreError> {
        let row = sqlx::query(r#"SELECT id, doc_id, "index", content_md FROM tables WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound("table"))?;
        Ok(FullTable {
            id: row.get("id"),
            doc_id: row.get("doc_id"),
            index: row.get::<Option<i32>, _>("index").unwrap_or_default(),
            content: row
                .get::<Option<String>, _>("content_md")
                .unwrap_or_default(),
        })
    }

    async fn neighbours(&self, chunk_id: Uuid) -> Result<Vec<Chunk>, StoreError> {
        let query = format!(
            r#"
            SELECT {CHUNK_COLUMNS}
            FROM chunks
            WHERE doc_id = (SELECT doc_id FROM chunks WHERE id = $1)
              AND (
                "index" = (SELECT coherence_prev FROM chunks WHERE id = $1)
                OR
                "index" = (SELECT coherence_next FROM chunks WHERE id = $1)
              )
            ORDER BY "index"
            "#
        );
        let rows = sqlx::query(&query)
            .bind(chunk_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(chunk_from_row).collect())
    }

    async fn search(&self, query: &[f32], limit: i64) -> Result<Vec<Chunk>, StoreError> {
        if query.is_empty() {
            return Err(StoreError::EmptyQueryVector);
        }

        let vector = Vector::from(query.to_vec());
        let sql = format!(
            r#"
            SELECT {CHUNK_COLUMNS}, 1 - (embedding <=> $1) AS distance
            FROM chunks
            WHERE embedding IS NOT NULL
            ORDER BY distance DESC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(vector)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let chunks = rows
            .iter()
            .map(|row| {
                let mut chunk = chunk_from_row(row);
                chunk.distance = row.get("distance");
                tracing::debug!(
                    chunk = %chunk.id,
                    doc = %chunk.doc_id,
                    index = chunk.index,
                    distance = chunk.distance,
                    "search hit"
                );
                chunk
            })
            .collect();
        Ok(chunks)
    }

    async fn replace_document(&self, doc: &Document) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE doc_id = $1")
            .bind(doc.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM tables WHERE doc_id = $1")
            .bind(doc.id)
            .execute(&mut *tx)
            .await?;

        upsert_document(&mut *tx, doc).await?;
        for table in &doc.tables {
            upsert_table(&mut *tx, table).await?;
        }
        for chunk in &doc.chunks {
            insert_chunk(&mut *tx, chunk).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_llm_config(&self, id: i32) -> Result<LlmConfig, StoreError> {
        let row = sqlx::query("SELECT id, llm_url, llm_model, prompt_str FROM config WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound("config"))?;
        Ok(LlmConfig {
            id: row.get("id"),
            llm_url: row.get::<Option<String>, _>("llm_url").unwrap_or_default(),
            llm_model: row
                .get::<Option<String>, _>("llm_model")
                .unwrap_or_default(),
            prompt_str: row
                .get::<Option<String>, _>("prompt_str")
                .unwrap_or_default(),
        })
    }

    async fn set_llm_config(
        &self,
        id: i32,
        patch: &LlmConfigPatch,
    ) -> Result<LlmConfig, StoreError> {
        let fields = patch.fields();
        if fields.is_empty() {
            return self.get_llm_config(id).await;
        }

        let sets: Vec<String> = fields
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{column} = ${}", i + 1))
            .collect();
        let sql = format!(
            "UPDATE config SET {} WHERE id = ${} RETURNING id, llm_url, llm_model, prompt_str",
            sets.join(", "),
            fields.len() + 1,
        );

        let mut query = sqlx::query(&sql);
        for (_, value) in &fields {
            query = query.bind(value.to_string());
        }
        let row = query
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound("config"))?;

        Ok(LlmConfig {
            id: row.get("id"),
            llm_url: row.get::<Option<String>, _>("llm_url").unwrap_or_default(),
            llm_model: row
                .get::<Option<String>, _>("llm_model")
                .unwrap_or_default(),
            prompt_str: row
                .get::<Option<String>, _>("prompt_str")
                .unwrap_or_default(),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_fields_skip_empty_strings() {
        let patch = LlmConfigPatch {
            llm_url: Some("http://llm".into()),
            llm_model: Some(String::new()),
            prompt_str: None,
        };
        assert_eq!(patch.fields(), vec![("llm_url", "http://llm")]);
    }

    #[test]
    fn not_found_is_distinguished() {
        assert!(StoreError::NotFound("document").is_not_found());
        assert!(!StoreError::EmptyQueryVector.is_not_found());
    }
}
