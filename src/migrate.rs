//! Database schema migrations.
//!
//! Creates the pgvector extension, all tables, and the search indices.
//! Every statement is idempotent; `docqa init` (and `docqa serve` on
//! startup) may run them any number of times.
//!
//! # Tables
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `documents` | one row per ingested source file |
//! | `chunks` | retrievable units with a `vector(D)` embedding column |
//! | `tables` | full markdown renderings for table rehydration |
//! | `config` | the LLM endpoint/model/system-prompt row |

use anyhow::Result;
use sqlx::PgPool;

/// Run all migrations against the given pool.
///
/// `dimension` is the embedding dimensionality baked into the vector
/// column; changing it requires a manual re-index.
pub async fn run_migrations(pool: &PgPool, dimension: usize) -> Result<()> {
    sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id UUID PRIMARY KEY,
            title TEXT NOT NULL,
            source TEXT,
            source_path TEXT,
            created_at TIMESTAMP WITH TIME ZONE,
            updated_at TIMESTAMP WITH TIME ZONE,
            version INTEGER DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id UUID PRIMARY KEY,
            doc_id UUID NOT NULL,
            "index" INT NOT NULL,
            type TEXT CHECK (type IN ('text','json','image','tablerow')),
            section TEXT,
            key TEXT,
            table_id UUID NULL,
            coherence_prev INT,
            coherence_next INT,
            content TEXT NOT NULL,
            embedding vector({dimension})
        )
        "#
    ))
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tables (
            id UUID PRIMARY KEY,
            doc_id UUID NOT NULL,
            "index" INT,
            content_md TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS config (
            id INT NOT NULL PRIMARY KEY,
            llm_url TEXT,
            llm_model TEXT,
            prompt_str TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Approximate-NN index over embeddings plus the filter indices.
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_embedding ON chunks \
         USING ivfflat (embedding vector_cosine_ops) WITH (lists = 100)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_doc_id ON chunks(doc_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_type ON chunks(type)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_section ON chunks(section)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_id ON documents(id)")
        .execute(pool)
        .await?;

    // Seed the LLM config row so PATCH-style updates always have a target.
    sqlx::query(
        "INSERT INTO config (id, llm_url, llm_model, prompt_str) VALUES (1, '', '', '') \
         ON CONFLICT (id) DO NOTHING",
    )
    .execute(pool)
    .await?;

    Ok(())
}
