//! Per-command file snapshot capture, revert, and accept.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::session::{FileChange, FileChangesSummary};
use crate::snapshot::{change_kind, line_stats};

/// Error type for snapshot I/O operations.
#[derive(thiserror::Error, Debug)]
pub enum SnapshotError {
    #[error("File is not tracked: {0}")]
    NotTracked(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Access to in-memory editor buffers. The snapshot engine prefers a
/// live buffer over on-disk content when capturing, and pushes reverted
/// content back into open buffers.
pub trait BufferProvider: Send + Sync {
    /// Current buffer content for a path, if the host has one open.
    fn buffer_content(&self, path: &Path) -> Option<String>;

    /// Replace the open buffer for a path after a revert.
    fn refresh_buffer(&self, path: &Path, content: &str);
}

/// Provider for hosts without an editor: disk content only.
pub struct NoBuffers;

impl BufferProvider for NoBuffers {
    fn buffer_content(&self, _path: &Path) -> Option<String> {
        None
    }

    fn refresh_buffer(&self, _path: &Path, _content: &str) {}
}

#[derive(Debug, Clone)]
struct FileSnapshot {
    original: String,
    was_new: bool,
    after: Option<String>,
}

/// Snapshots for the files touched during one logical command.
///
/// Scoped to a single session; the orchestrator keeps one manager per
/// session so concurrent turns never share snapshot state. Snapshots
/// live only in memory: a restart loses the ability to revert.
pub struct SnapshotManager {
    snapshots: HashMap<PathBuf, FileSnapshot>,
    buffers: Arc<dyn BufferProvider>,
}

impl SnapshotManager {
    /// Create a manager with the given buffer provider.
    #[must_use]
    pub fn new(buffers: Arc<dyn BufferProvider>) -> Self {
        Self {
            snapshots: HashMap::new(),
            buffers,
        }
    }

    /// Clear all snapshots at the start of a new user turn.
    pub fn begin_command(&mut self) {
        self.snapshots.clear();
    }

    /// Number of tracked files.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.snapshots.len()
    }

    /// Record a file's content before an edit. No-op when the file was
    /// already captured for this command.
    pub async fn capture_before(&mut self, path: &Path) {
        if self.snapshots.contains_key(path) {
            return;
        }
        let snapshot = match self.read_current(path).await {
            Some(content) => FileSnapshot {
                original: content,
                was_new: false,
                after: None,
            },
            None => FileSnapshot {
                original: String::new(),
                was_new: true,
                after: None,
            },
        };
        tracing::debug!(path = ?path, was_new = snapshot.was_new, "captured before-content");
        self.snapshots.insert(path.to_path_buf(), snapshot);
    }

    /// Record a file's content after an edit. Empty string when the file
    /// no longer exists. Ignored (with a log entry) when no before
    /// capture happened for this command.
    pub async fn capture_after(&mut self, path: &Path) {
        let content = self.read_current(path).await.unwrap_or_default();
        if let Some(snapshot) = self.snapshots.get_mut(path) {
            snapshot.after = Some(content);
        } else {
            tracing::warn!(path = ?path, "after-capture without before-capture, ignoring");
        }
    }

    /// Changed files: both sides known and actually different.
    #[must_use]
    pub fn changes(&self) -> Vec<FileChange> {
        let mut changes: Vec<FileChange> = self
            .snapshots
            .iter()
            .filter_map(|(path, snapshot)| {
                let after = snapshot.after.as_ref()?;
                if *after == snapshot.original {
                    return None;
                }
                let stats = line_stats(&snapshot.original, after);
                Some(FileChange {
                    path: path.clone(),
                    display_name: path
                        .file_name()
                        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned()),
                    kind: change_kind(&snapshot.original, after),
                    added_lines: stats.added,
                    removed_lines: stats.removed,
                    original: snapshot.original.clone(),
                    modified: after.clone(),
                })
            })
            .collect();
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        changes
    }

    /// Aggregate summary for attaching to the turn's assistant message.
    #[must_use]
    pub fn summary(&self) -> FileChangesSummary {
        FileChangesSummary::from_changes(self.changes())
    }

    /// Restore a file to its captured original and drop its snapshot.
    /// Newly created files are deleted instead.
    ///
    /// # Errors
    ///
    /// Returns `SnapshotError` when the path is untracked or the
    /// filesystem operation fails; the snapshot is kept on failure.
    pub async fn revert_file(&mut self, path: &Path) -> Result<(), SnapshotError> {
        let snapshot = self
            .snapshots
            .get(path)
            .ok_or_else(|| SnapshotError::NotTracked(path.to_path_buf()))?;

        if snapshot.was_new {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            tokio::fs::write(path, &snapshot.original).await?;
            self.buffers.refresh_buffer(path, &snapshot.original);
        }
        tracing::info!(path = ?path, "reverted file");
        self.snapshots.remove(path);
        Ok(())
    }

    /// Revert every pending change, continuing past per-file failures.
    /// Returns the failures.
    pub async fn revert_all(&mut self) -> Vec<(PathBuf, SnapshotError)> {
        let paths: Vec<PathBuf> = self.snapshots.keys().cloned().collect();
        let mut failures = Vec::new();
        for path in paths {
            if let Err(e) = self.revert_file(&path).await {
                tracing::warn!(path = ?path, error = %e, "revert failed");
                failures.push((path, e));
            }
        }
        failures
    }

    /// Accept a single file's change: drop its snapshot, leave the file.
    pub fn accept_file(&mut self, path: &Path) -> bool {
        self.snapshots.remove(path).is_some()
    }

    /// Accept everything: discard all snapshots without touching files.
    pub fn accept_all(&mut self) {
        self.snapshots.clear();
    }

    /// Current content, preferring an open editor buffer over disk.
    async fn read_current(&self, path: &Path) -> Option<String> {
        if let Some(content) = self.buffers.buffer_content(path) {
            return Some(content);
        }
        tokio::fs::read_to_string(path).await.ok()
    }
}
