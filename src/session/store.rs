//! Durable storage for the session list.
//!
//! The whole workspace state is one serialized JSON blob: every session
//! with its full message history (including attached file-change
//! summaries) plus the id of the current session. File snapshots are
//! deliberately absent; revert capability does not survive a restart.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::Session;

/// Blob format version for forward compatibility.
const STORE_VERSION: u32 = 1;

/// Error type for store operations.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize sessions: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Unsupported store version: {0}")]
    UnsupportedVersion(u32),
}

/// The serialized record persisted per workspace.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedState {
    /// Blob format version.
    #[serde(default)]
    pub version: u32,
    /// All sessions with full message history.
    pub sessions: Vec<Session>,
    /// Id of the current session.
    pub current: Option<Uuid>,
}

/// Loads and saves the session blob at a fixed path.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    /// Create a store backed by the given file path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default store path under the user data directory.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("claude-conductor")
            .join("sessions.json")
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted state, or `None` if no blob exists yet.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on I/O failure, malformed JSON, or an
    /// unrecognized format version.
    pub async fn load(&self) -> Result<Option<PersistedState>, StoreError> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(None);
        }
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let state: PersistedState = serde_json::from_str(&raw)?;
        if state.version > STORE_VERSION {
            return Err(StoreError::UnsupportedVersion(state.version));
        }
        tracing::debug!(sessions = state.sessions.len(), "loaded session blob");
        Ok(Some(state))
    }

    /// Save the sessions and current pointer as one blob.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on I/O or serialization failure.
    pub async fn save(&self, sessions: &[Session], current: Option<Uuid>) -> Result<(), StoreError> {
        let state = PersistedState {
            version: STORE_VERSION,
            sessions: sessions.to_vec(),
            current,
        };
        let raw = serde_json::to_string_pretty(&state)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, raw).await?;
        tracing::debug!(sessions = sessions.len(), path = ?self.path, "saved session blob");
        Ok(())
    }
}
