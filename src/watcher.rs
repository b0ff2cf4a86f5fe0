//! Stability-triggered drop-directory watcher.
//!
//! A file is dispatched only after it has been visible in the drop
//! directory for longer than the configured quiet period without
//! disappearing, so uploads in progress are never picked up half-written.
//!
//! State is two maps guarded by one mutex: `first_seen` (path → first
//! observation) and `processing` (paths currently being ingested). The
//! lock is never held across an await point; every critical section is a
//! map lookup or insert. Files that vanish from the directory are
//! forgotten so a re-upload starts a fresh quiet period.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Poll cadence for the drop directory.
const TICK_PERIOD: Duration = Duration::from_secs(1);

#[derive(Default)]
struct WatchState {
    first_seen: HashMap<PathBuf, Instant>,
    processing: HashSet<PathBuf>,
}

pub struct DropWatcher {
    dir: PathBuf,
    quiet_period: Duration,
    state: Mutex<WatchState>,
}

impl DropWatcher {
    pub fn new(dir: PathBuf, quiet_period: Duration) -> Self {
        Self {
            dir,
            quiet_period,
            state: Mutex::new(WatchState::default()),
        }
    }

    /// Watch the drop directory until shutdown, sending stable files on
    /// `files`. The sender is dropped on return so downstream can drain.
    pub async fn run(&self, files: mpsc::Sender<PathBuf>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(dir = %self.dir.display(), "watching drop directory");
        let mut ticker = tokio::time::interval(TICK_PERIOD);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if self.scan(&files, &mut shutdown).await.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("file watcher stopped");
    }

    /// One directory pass. `Err(())` means shutdown fired or the
    /// receiving side is gone.
    async fn scan(
        &self,
        files: &mpsc::Sender<PathBuf>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ()> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "cannot read drop directory");
                return Ok(());
            }
        };

        let mut current: HashSet<PathBuf> = HashSet::new();
        let mut ready: Vec<PathBuf> = Vec::new();

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "error while listing drop directory");
                    break;
                }
            };
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if !is_file {
                continue;
            }

            let path = entry.path();
            current.insert(path.clone());

            let dispatch = {
                let mut state = self.state.lock().unwrap();
                if state.processing.contains(&path) {
                    false
                } else if let Some(first_seen) = state.first_seen.get(&path).copied() {
                    if first_seen.elapsed() > self.quiet_period {
                        state.processing.insert(path.clone());
                        true
                    } else {
                        false
                    }
                } else {
                    state.first_seen.insert(path.clone(), Instant::now());
                    tracing::info!(path = %path.display(), "new file detected");
                    false
                }
            };

            if dispatch {
                ready.push(path);
            }
        }

        // Forget files removed while we were not looking.
        {
            let mut state = self.state.lock().unwrap();
            state.first_seen.retain(|path, _| {
                let keep = current.contains(path);
                if !keep {
                    tracing::info!(path = %path.display(), "file removed from tracking");
                }
                keep
            });
            state.processing.retain(|path| current.contains(path));
        }

        for path in ready {
            tracing::info!(path = %path.display(), "file stable, dispatching");
            tokio::select! {
                sent = files.send(path) => {
                    if sent.is_err() {
                        return Err(());
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Err(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Drop all tracking for a path after its ingest completed.
    pub fn forget(&self, path: &Path) {
        let mut state = self.state.lock().unwrap();
        state.first_seen.remove(path);
        state.processing.remove(path);
    }

    /// Release a path back for re-detection after a failed parse.
    pub fn release(&self, path: &Path) {
        let mut state = self.state.lock().unwrap();
        state.processing.remove(path);
        state.first_seen.remove(path);
    }
}
