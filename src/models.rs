//! Core data types used throughout docqa.
//!
//! The data lifecycle is:
//!
//! ```text
//! drop dir → Watcher → Parser (convert + tokenize) → Chunker → Document
//!                                                                 ↓
//!                                              Store ← replace_document()
//!                                                                 ↓
//!                                     query → search() → Answer + Sources
//! ```
//!
//! A **[`Document`]** is one logical source file with a path-derived
//! deterministic id. A **[`Chunk`]** is the retrievable unit (text window,
//! vision JSON, or table row). A **[`FullTable`]** is the re-joined
//! markdown rendering of a whole table, stored once so that retrieval can
//! rehydrate it when any one of its rows matches.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use uuid::Uuid;

/// The kind of content a chunk carries.
///
/// Stored as lowercase text in the `chunks.type` column. `Json` is the
/// legacy label for vision output; newly ingested image chunks use
/// `Image`. Both are kept whole during overlap trimming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Text,
    Json,
    Image,
    TableRow,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Text => "text",
            ChunkKind::Json => "json",
            ChunkKind::Image => "image",
            ChunkKind::TableRow => "tablerow",
        }
    }

    /// Parse the database representation. Unknown labels fall back to
    /// `Text` so schema drift never poisons retrieval.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "json" => ChunkKind::Json,
            "image" => ChunkKind::Image,
            "tablerow" => ChunkKind::TableRow,
            _ => ChunkKind::Text,
        }
    }
}

/// A retrievable unit of one document.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Random UUID primary key.
    pub id: Uuid,
    /// Owning document.
    pub doc_id: Uuid,
    /// Zero-based position within the document, dense across all kinds.
    pub index: i32,
    pub kind: ChunkKind,
    /// Last markdown heading seen before this chunk ("" when none).
    pub section: String,
    /// Table-row parameter name; set only for `TableRow` chunks.
    pub key: Option<String>,
    /// Owning [`FullTable`]; set exactly when `kind == TableRow`.
    pub table_id: Option<Uuid>,
    /// Index of the logically preceding chunk, absent at the start.
    pub coh_prev: Option<i32>,
    /// Index of the logically following chunk, absent at the end.
    pub coh_next: Option<i32>,
    pub content: String,
    /// Unit-norm embedding of the configured dimension.
    pub embedding: Option<Vec<f32>>,
    /// Similarity score (`1 − cosine_distance`), populated by search only.
    pub distance: f64,
}

impl Chunk {
    /// A bare chunk with the given identity and content; the chunker
    /// fills in section, coherence and embedding.
    pub fn new(doc_id: Uuid, index: i32, kind: ChunkKind, content: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            doc_id,
            index,
            kind,
            section: String::new(),
            key: None,
            table_id: None,
            coh_prev: None,
            coh_next: None,
            content,
            embedding: None,
            distance: 0.0,
        }
    }
}

/// One logical source file and everything extracted from it.
#[derive(Debug, Clone)]
pub struct Document {
    /// Deterministic id derived from the source path.
    pub id: Uuid,
    /// Filename with the extension stripped and separators spaced.
    pub title: String,
    /// Source kind, e.g. `"pdf"`.
    pub source: String,
    pub source_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i32,
    pub chunks: Vec<Chunk>,
    pub tables: Vec<FullTable>,
}

/// The complete markdown rendering of one table, stored once per table.
///
/// Each of its rows also lives as an individual `TableRow` chunk carrying
/// the same `id` in [`Chunk::table_id`].
#[derive(Debug, Clone)]
pub struct FullTable {
    pub id: Uuid,
    pub doc_id: Uuid,
    /// Zero-based ordinal of the table within its document.
    pub index: i32,
    pub content: String,
}

/// Source attribution for one chunk included in the answer context.
#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub doc_id: String,
    pub title: String,
    pub chunk_text: String,
    pub index: i32,
}

/// The reply of the retrieval service.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<Source>,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

/// Deterministic document id for a source path.
///
/// UUIDv3 (md5-based) over the path bytes: the same path always maps to
/// the same id, so a re-dropped file replaces its previous ingest. A
/// renamed file is a new document.
pub fn document_id_for_path(path: &Path) -> Uuid {
    Uuid::new_v3(&Uuid::NAMESPACE_URL, path.to_string_lossy().as_bytes())
}

/// Human-readable title: file stem with `_`/`-` normalised to spaces.
pub fn title_for_path(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    stem.replace('_', " ").replace('-', " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn document_id_is_deterministic() {
        let p = PathBuf::from("/drop/manual_v2.pdf");
        assert_eq!(document_id_for_path(&p), document_id_for_path(&p));
    }

    #[test]
    fn document_id_differs_per_path() {
        let a = document_id_for_path(Path::new("/drop/a.pdf"));
        let b = document_id_for_path(Path::new("/drop/b.pdf"));
        assert_ne!(a, b);
    }

    #[test]
    fn title_strips_extension_and_separators() {
        assert_eq!(
            title_for_path(Path::new("/drop/fare_rules-2024_draft.pdf")),
            "fare rules 2024 draft"
        );
    }

    #[test]
    fn title_without_extension() {
        assert_eq!(title_for_path(Path::new("/drop/notes")), "notes");
    }

    #[test]
    fn chunk_kind_roundtrip() {
        for kind in [
            ChunkKind::Text,
            ChunkKind::Json,
            ChunkKind::Image,
            ChunkKind::TableRow,
        ] {
            assert_eq!(ChunkKind::from_str_lossy(kind.as_str()), kind);
        }
    }
}
