//! Session state machine.

use serde::{Deserialize, Serialize};

/// Current state of a conversation session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Sending,
    Streaming,
    Error,
}

/// State machine enforcing the allowed transition relation:
/// idle→sending, sending→streaming, streaming→idle,
/// sending/streaming→error, error→idle.
///
/// Cancellation bypasses the relation via [`force_idle`](Self::force_idle);
/// everything else goes through [`transition`](Self::transition).
#[derive(Debug, Clone, Default)]
pub struct SessionStateMachine {
    state: SessionState,
    waiting_for_user: bool,
}

impl SessionStateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the session is blocked on a human (or auto-accept) decision.
    /// Orthogonal to the state: may be true while streaming or idle.
    #[must_use]
    pub fn waiting_for_user(&self) -> bool {
        self.waiting_for_user
    }

    pub fn set_waiting_for_user(&mut self, waiting: bool) {
        self.waiting_for_user = waiting;
    }

    /// True when a prompt can be dispatched immediately.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.state == SessionState::Idle && !self.waiting_for_user
    }

    /// Attempt a transition. Invalid transitions are logged and ignored;
    /// returns whether the transition was applied.
    pub fn transition(&mut self, new_state: SessionState) -> bool {
        use SessionState::{Error, Idle, Sending, Streaming};
        let allowed = matches!(
            (self.state, new_state),
            (Idle, Sending)
                | (Sending, Streaming)
                | (Streaming, Idle)
                | (Sending | Streaming, Error)
                | (Error, Idle)
        );
        if allowed {
            tracing::debug!(from = ?self.state, to = ?new_state, "state transition");
            self.state = new_state;
        } else {
            tracing::warn!(from = ?self.state, to = ?new_state, "rejected state transition");
        }
        allowed
    }

    /// Reset to idle regardless of current state. Used by cancellation only.
    pub fn force_idle(&mut self) {
        tracing::debug!(from = ?self.state, "forced to idle");
        self.state = SessionState::Idle;
        self.waiting_for_user = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut sm = SessionStateMachine::new();
        assert!(sm.transition(SessionState::Sending));
        assert!(sm.transition(SessionState::Streaming));
        assert!(sm.transition(SessionState::Idle));
        assert_eq!(sm.state(), SessionState::Idle);
    }

    #[test]
    fn error_path_transitions() {
        let mut sm = SessionStateMachine::new();
        sm.transition(SessionState::Sending);
        assert!(sm.transition(SessionState::Error));
        assert!(sm.transition(SessionState::Idle));
    }

    #[test]
    fn invalid_transitions_rejected() {
        let mut sm = SessionStateMachine::new();
        assert!(!sm.transition(SessionState::Streaming));
        assert!(!sm.transition(SessionState::Error));
        assert!(!sm.transition(SessionState::Idle));
        assert_eq!(sm.state(), SessionState::Idle);

        sm.transition(SessionState::Sending);
        assert!(!sm.transition(SessionState::Sending));
        assert_eq!(sm.state(), SessionState::Sending);
    }

    #[test]
    fn force_idle_clears_waiting_flag() {
        let mut sm = SessionStateMachine::new();
        sm.transition(SessionState::Sending);
        sm.set_waiting_for_user(true);
        sm.force_idle();
        assert_eq!(sm.state(), SessionState::Idle);
        assert!(!sm.waiting_for_user());
    }

    #[test]
    fn waiting_is_orthogonal_to_state() {
        let mut sm = SessionStateMachine::new();
        sm.transition(SessionState::Sending);
        sm.transition(SessionState::Streaming);
        sm.set_waiting_for_user(true);
        assert_eq!(sm.state(), SessionState::Streaming);
        sm.transition(SessionState::Idle);
        assert!(sm.waiting_for_user());
        assert!(!sm.is_free());
    }
}
