//! Ingestion pipeline: watcher → parser → persister.
//!
//! Three long-lived workers wired by two bounded channels:
//!
//! ```text
//! DropWatcher ──(files, cap 10)──▶ parser ──(docs, cap 1)──▶ persister
//! ```
//!
//! The parser converts the PDF to markdown, tokenizes it and chunks the
//! tokens into a [`Document`]. The persister replaces the document in the
//! store atomically, then moves the source file to
//! `archive/<yyyy-mm-dd>/`, or to `bad/<yyyy-mm-dd>/` when the drop is a
//! stale re-submission (mtime not newer than the stored `updated_at`).
//!
//! One shutdown signal aborts all three workers; the supervisor gives
//! them a short drain deadline and abandons whatever is still running.
//! A file abandoned mid-parse stays in the drop directory and is
//! re-detected on the next start.

use chrono::{DateTime, Local, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::chunker::{ChunkError, Chunker};
use crate::convert::{ConvertError, PdfConverter};
use crate::markdown;
use crate::models::{self, Document};
use crate::store::Store;
use crate::watcher::DropWatcher;

/// Capacity of the watcher → parser channel.
const FILE_CHANNEL_CAPACITY: usize = 10;

/// How long workers get to drain after shutdown fires.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
enum ParseError {
    #[error("parse cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Convert(#[from] ConvertError),
}

pub struct IngestPipeline {
    pub store: Arc<dyn Store>,
    pub watcher: Arc<DropWatcher>,
    pub converter: Arc<PdfConverter>,
    pub chunker: Arc<Chunker>,
    pub archive_dir: PathBuf,
    pub bad_dir: PathBuf,
}

/// Handle over the spawned workers.
pub struct PipelineHandle {
    tasks: JoinSet<()>,
}

impl PipelineHandle {
    /// Wait for all workers to stop, abandoning stragglers after the
    /// deadline.
    pub async fn drain(mut self, deadline: Duration) {
        let all_done = async {
            while self.tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(deadline, all_done).await.is_err() {
            tracing::warn!("drain deadline exceeded, abandoning remaining workers");
        }
    }
}

impl IngestPipeline {
    /// Spawn the three workers. They stop when `shutdown` flips to true
    /// or their upstream channel closes.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> PipelineHandle {
        let (file_tx, file_rx) = mpsc::channel::<PathBuf>(FILE_CHANNEL_CAPACITY);
        let (doc_tx, doc_rx) = mpsc::channel::<Document>(1);

        let mut tasks = JoinSet::new();

        let watcher = self.watcher.clone();
        let watcher_shutdown = shutdown.clone();
        tasks.spawn(async move {
            watcher.run(file_tx, watcher_shutdown).await;
        });

        let parser_watcher = self.watcher.clone();
        let converter = self.converter.clone();
        let chunker = self.chunker.clone();
        let parser_shutdown = shutdown.clone();
        tasks.spawn(async move {
            parse_worker(
                parser_watcher,
                converter,
                chunker,
                file_rx,
                doc_tx,
                parser_shutdown,
            )
            .await;
        });

        let store = self.store.clone();
        let archive_dir = self.archive_dir.clone();
        let bad_dir = self.bad_dir.clone();
        tasks.spawn(async move {
            persist_worker(store, archive_dir, bad_dir, doc_rx, shutdown).await;
        });

        PipelineHandle { tasks }
    }
}

async fn parse_worker(
    watcher: Arc<DropWatcher>,
    converter: Arc<PdfConverter>,
    chunker: Arc<Chunker>,
    mut files: mpsc::Receiver<PathBuf>,
    docs: mpsc::Sender<Document>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let path = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            received = files.recv() => match received {
                Some(path) => path,
                None => break,
            },
        };

        tracing::info!(path = %path.display(), "processing file");
        match parse_file(&converter, &chunker, &path, &shutdown).await {
            Ok(doc) => {
                let delivered = tokio::select! {
                    sent = docs.send(doc) => sent.is_ok(),
                    _ = shutdown.changed() => false,
                };
                if !delivered {
                    // Abandoned mid-flight: the path stays in `processing`
                    // and the file is re-detected on the next start.
                    break;
                }
                watcher.forget(&path);
            }
            Err(ParseError::Cancelled) => break,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to parse file, will retry");
                watcher.release(&path);
            }
        }
    }
    tracing::info!("file processor stopped");
}

async fn parse_file(
    converter: &PdfConverter,
    chunker: &Chunker,
    path: &Path,
    cancel: &watch::Receiver<bool>,
) -> Result<Document, ParseError> {
    let metadata = tokio::fs::metadata(path).await?;
    let modified: DateTime<Utc> = metadata.modified()?.into();

    let doc_id = models::document_id_for_path(path);
    let markdown_text = converter.convert(path).await?;
    let tokens = markdown::tokenize(&markdown_text);

    let (chunks, tables) = chunker
        .chunk_tokens(doc_id, &tokens, cancel)
        .await
        .map_err(|_: ChunkError| ParseError::Cancelled)?;

    tracing::info!(
        path = %path.display(),
        chunks = chunks.len(),
        tables = tables.len(),
        "file parsed"
    );

    Ok(Document {
        id: doc_id,
        title: models::title_for_path(path),
        source: "pdf".to_string(),
        source_path: path.to_string_lossy().into_owned(),
        created_at: modified,
        updated_at: modified,
        version: 1,
        chunks,
        tables,
    })
}

async fn persist_worker(
    store: Arc<dyn Store>,
    archive_dir: PathBuf,
    bad_dir: PathBuf,
    mut docs: mpsc::Receiver<Document>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let doc = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            received = docs.recv() => match received {
                Some(doc) => doc,
                None => break,
            },
        };

        let source_path = PathBuf::from(&doc.source_path);
        match should_update(store.as_ref(), &doc).await {
            Ok(false) => {
                tracing::info!(doc = %doc.id, path = %source_path.display(), "stale submission, moving to bad");
                if let Err(e) = move_with_date(&source_path, &bad_dir) {
                    tracing::error!(path = %source_path.display(), error = %e, "failed to move file to bad");
                }
                continue;
            }
            Err(e) => {
                tracing::error!(doc = %doc.id, error = %e, "cannot check stored document, leaving file for retry");
                continue;
            }
            Ok(true) => {}
        }

        match store.replace_document(&doc).await {
            Ok(()) => {
                tracing::info!(doc = %doc.id, chunks = doc.chunks.len(), "document saved");
                if let Err(e) = move_with_date(&source_path, &archive_dir) {
                    tracing::error!(path = %source_path.display(), error = %e, "failed to archive file");
                }
            }
            Err(e) => {
                tracing::error!(doc = %doc.id, error = %e, "failed to save document, leaving file for retry");
            }
        }
    }
    tracing::info!("persister stopped");
}

/// A document is (re)ingested when it is unknown or its file is strictly
/// newer than the stored row.
async fn should_update(
    store: &dyn Store,
    doc: &Document,
) -> Result<bool, crate::store::StoreError> {
    match store.get_document(doc.id).await {
        Ok(stored) => Ok(doc.updated_at > stored.updated_at),
        Err(e) if e.is_not_found() => Ok(true),
        Err(e) => Err(e),
    }
}

/// Move a file into `<dest_root>/<yyyy-mm-dd>/`, resolving name
/// collisions with `_1`, `_2`, … suffixes before the extension.
pub fn move_with_date(source: &Path, dest_root: &Path) -> std::io::Result<PathBuf> {
    let date = Local::now().format("%Y-%m-%d").to_string();
    let dest_dir = dest_root.join(date);
    std::fs::create_dir_all(&dest_dir)?;

    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());

    let mut dest = dest_dir.join(&file_name);
    let mut counter = 1;
    while dest.exists() {
        let stem = Path::new(&file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_name.clone());
        let ext = Path::new(&file_name)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        dest = dest_dir.join(format!("{stem}_{counter}{ext}"));
        counter += 1;
    }

    match std::fs::rename(source, &dest) {
        Ok(()) => {}
        // Cross-device moves fall back to copy + remove.
        Err(_) => {
            std::fs::copy(source, &dest)?;
            std::fs::remove_file(source)?;
        }
    }
    tracing::info!(dest = %dest.display(), "file moved");
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;
    use crate::models::ChunkKind;
    use crate::store::memory::MemoryStore;
    use uuid::Uuid;

    fn doc_at(id: Uuid, updated_at: DateTime<Utc>) -> Document {
        Document {
            id,
            title: "t".into(),
            source: "pdf".into(),
            source_path: "/drop/t.pdf".into(),
            created_at: updated_at,
            updated_at,
            version: 1,
            chunks: vec![Chunk::new(id, 0, ChunkKind::Text, "x".into())],
            tables: Vec::new(),
        }
    }

    #[tokio::test]
    async fn unknown_document_is_ingested() {
        let store = MemoryStore::new();
        let doc = doc_at(Uuid::new_v4(), Utc::now());
        assert!(should_update(&store, &doc).await.unwrap());
    }

    #[tokio::test]
    async fn stale_submission_is_rejected() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let now = Utc::now();
        store.save_document(&doc_at(id, now)).await.unwrap();

        // Same mtime: stale.
        assert!(!should_update(&store, &doc_at(id, now)).await.unwrap());
        // Older mtime: stale.
        let older = now - chrono::Duration::seconds(60);
        assert!(!should_update(&store, &doc_at(id, older)).await.unwrap());
        // Strictly newer mtime: re-ingest.
        let newer = now + chrono::Duration::seconds(60);
        assert!(should_update(&store, &doc_at(id, newer)).await.unwrap());
    }

    #[tokio::test]
    async fn reingest_replaces_all_chunks() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let mut doc = doc_at(id, Utc::now());
        doc.chunks = vec![
            Chunk::new(id, 0, ChunkKind::Text, "old a".into()),
            Chunk::new(id, 1, ChunkKind::Text, "old b".into()),
        ];
        store.replace_document(&doc).await.unwrap();
        assert_eq!(store.chunk_count(), 2);

        doc.chunks = vec![Chunk::new(id, 0, ChunkKind::Text, "new".into())];
        store.replace_document(&doc).await.unwrap();
        assert_eq!(store.chunk_count(), 1);
    }

    #[test]
    fn move_with_date_appends_collision_suffixes() {
        let drop = tempfile::tempdir().unwrap();
        let archive = tempfile::tempdir().unwrap();

        for expected in ["doc.pdf", "doc_1.pdf", "doc_2.pdf"] {
            let source = drop.path().join("doc.pdf");
            std::fs::write(&source, b"data").unwrap();
            let dest = move_with_date(&source, archive.path()).unwrap();
            assert_eq!(dest.file_name().unwrap().to_string_lossy(), expected);
            assert!(!source.exists());
            assert!(dest.exists());
        }
    }

    #[test]
    fn move_with_date_uses_date_subdirectory() {
        let drop = tempfile::tempdir().unwrap();
        let archive = tempfile::tempdir().unwrap();
        let source = drop.path().join("doc.pdf");
        std::fs::write(&source, b"data").unwrap();

        let dest = move_with_date(&source, archive.path()).unwrap();
        let parent = dest.parent().unwrap().file_name().unwrap().to_string_lossy();
        assert_eq!(
            parent,
            Local::now().format("%Y-%m-%d").to_string()
        );
    }
}
