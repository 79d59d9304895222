//! Session CRUD and the current-session pointer.

use uuid::Uuid;

use crate::session::{Session, SessionStore, StoreError};

/// Callback fired before the current-session pointer moves, letting the
/// orchestrator snapshot or clear transient in-flight state.
pub type BeforeSwitchFn = Box<dyn FnMut(Uuid, Uuid) + Send>;

/// Owns the list of conversation sessions and their persistence.
///
/// Every session access goes through this type; nothing else may hold a
/// "current session" alias.
pub struct SessionManager {
    sessions: Vec<Session>,
    current: Uuid,
    store: Option<SessionStore>,
    before_switch: Option<BeforeSwitchFn>,
}

impl SessionManager {
    /// Create a manager with one fresh session and no persistence.
    #[must_use]
    pub fn new() -> Self {
        let session = Session::new();
        let current = session.id;
        Self {
            sessions: vec![session],
            current,
            store: None,
            before_switch: None,
        }
    }

    /// Create a manager backed by a store, loading any persisted blob.
    ///
    /// A missing or empty blob falls back to one fresh session.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` when an existing blob cannot be read.
    pub async fn with_store(store: SessionStore) -> Result<Self, StoreError> {
        let mut manager = Self::new();
        if let Some(state) = store.load().await? {
            if !state.sessions.is_empty() {
                let fallback = state.sessions[0].id;
                let current = state
                    .current
                    .filter(|id| state.sessions.iter().any(|s| s.id == *id))
                    .unwrap_or(fallback);
                manager.sessions = state.sessions;
                manager.current = current;
            }
        }
        manager.store = Some(store);
        Ok(manager)
    }

    /// Register the before-switch callback.
    pub fn on_before_switch(&mut self, callback: BeforeSwitchFn) {
        self.before_switch = Some(callback);
    }

    /// Id of the current session.
    #[must_use]
    pub fn current_id(&self) -> Uuid {
        self.current
    }

    /// The current session.
    ///
    /// # Panics
    ///
    /// Never panics: the manager maintains the invariant that the current
    /// id always refers to an existing session.
    #[must_use]
    pub fn current(&self) -> &Session {
        self.sessions
            .iter()
            .find(|s| s.id == self.current)
            .unwrap_or(&self.sessions[0])
    }

    /// All sessions in creation order.
    #[must_use]
    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    /// Look up a session by id.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    /// Look up a session mutably by id.
    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    /// Create a new session and make it current.
    pub fn start_new_session(&mut self) -> Uuid {
        let session = Session::new();
        let id = session.id;
        self.run_before_switch(id);
        self.sessions.push(session);
        self.current = id;
        tracing::info!(session_id = %id, "started new session");
        id
    }

    /// Switch the current-session pointer. Returns false for unknown ids.
    /// In-flight work on the previous session is left untouched.
    pub fn switch_session(&mut self, id: Uuid) -> bool {
        if self.get(id).is_none() {
            tracing::warn!(session_id = %id, "switch to unknown session");
            return false;
        }
        if id != self.current {
            self.run_before_switch(id);
            self.current = id;
        }
        true
    }

    /// Delete a session. Deleting the current session activates another
    /// existing session, or creates a fresh one if none remain.
    pub fn delete_session(&mut self, id: Uuid) -> bool {
        let Some(idx) = self.sessions.iter().position(|s| s.id == id) else {
            return false;
        };
        self.sessions.remove(idx);
        tracing::info!(session_id = %id, "deleted session");
        if self.sessions.is_empty() {
            let session = Session::new();
            self.current = session.id;
            self.sessions.push(session);
        } else if self.current == id {
            self.current = self.sessions[0].id;
        }
        true
    }

    /// Rename a session. Returns false for unknown ids.
    pub fn rename_session(&mut self, id: Uuid, title: impl Into<String>) -> bool {
        if let Some(session) = self.get_mut(id) {
            session.title = Some(title.into());
            true
        } else {
            false
        }
    }

    /// Persist the full session list and current pointer.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on save failure. A no-op without a store.
    pub async fn save(&self) -> Result<(), StoreError> {
        if let Some(store) = &self.store {
            store.save(&self.sessions, Some(self.current)).await?;
        }
        Ok(())
    }

    fn run_before_switch(&mut self, to: Uuid) {
        let from = self.current;
        if let Some(callback) = &mut self.before_switch {
            callback(from, to);
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
