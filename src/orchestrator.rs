//! Top-level session orchestration.
//!
//! Wires the session manager, per-session connections, event handler,
//! rate limit manager, and snapshot engine together, and exposes the
//! public session API to the host UI. Concurrency is interleaving of
//! independent per-session state: all mutation happens on the caller's
//! task through [`SessionOrchestrator::process_next`]; spawned tasks
//! (turn readers, the auto-accept delay, countdown ticks) only feed
//! events back through one inbound channel and are cancellable through
//! the owning session's token.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cli::{CliEvent, ConnectionError, ConnectionFactory, ConnectionStatus};
use crate::config::ConductorConfig;
use crate::context::QueuedContext;
use crate::handler::{EventHandler, TurnEffect};
use crate::ratelimit::{self, CountdownEvent, PendingRetry, RateLimitManager};
use crate::session::{
    EnqueueResult, FileChange, Message, PromptOptions, QueuedMessage, Session, SessionManager,
    SessionState, SessionStateMachine, StoreError, UsageStats,
};
use crate::snapshot::{BufferProvider, SnapshotError, SnapshotManager};

/// Delay before an auto-accepted answer is applied, giving the UI a
/// moment to render the selection.
pub const AUTO_ACCEPT_DELAY: Duration = Duration::from_millis(500);

/// Buffer size for the UI notification channel.
const NOTIFY_BUFFER: usize = 256;

/// Error type for orchestrator operations.
#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    #[error("Unknown session: {0}")]
    UnknownSession(Uuid),
    #[error("No pending ask-user request for session {0}")]
    NoPendingAskUser(Uuid),
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Observable change notifications for the host UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A new message was appended to a session.
    MessageReceived { session_id: Uuid, message_id: Uuid },
    /// An existing message changed (streaming update, seal, error).
    MessageUpdated { session_id: Uuid, message_id: Uuid },
    /// A session's state or waiting flag changed.
    StateChanged {
        session_id: Uuid,
        state: SessionState,
        waiting_for_user: bool,
    },
    /// The current-session pointer or the session list changed.
    SessionChanged { current: Uuid },
    /// A session's queue changed.
    QueueChanged { session_id: Uuid },
    /// Connection status changed.
    StatusChanged,
}

/// Outcome of a `send_message` call.
#[derive(Debug, Clone, PartialEq)]
pub enum SendResult {
    /// The message was dispatched to the CLI immediately.
    Dispatched(Message),
    /// The session was busy; the message was queued.
    Queued(QueuedMessage),
    /// The queue was at capacity; the message was not stored.
    Rejected(QueuedMessage),
}

/// Events fed back into the orchestrator by its spawned tasks.
#[derive(Debug)]
pub enum Inbound {
    /// A CLI event for a turn.
    Cli {
        session_id: Uuid,
        turn_id: Uuid,
        event: CliEvent,
    },
    /// The turn's event stream ended.
    TurnClosed {
        session_id: Uuid,
        turn_id: Uuid,
        error: Option<String>,
    },
    /// The auto-accept delay elapsed for an ask-user request.
    AutoAccept { session_id: Uuid, request_id: Uuid },
    /// A rate-limit countdown tick or expiry.
    Countdown(CountdownEvent),
}

/// Everything the orchestrator tracks for one session beyond the
/// conversation itself. Keyed by session id; never shared across
/// sessions.
struct SessionRuntime {
    state: SessionStateMachine,
    connection: Box<dyn crate::cli::CliConnection>,
    snapshots: SnapshotManager,
    cancel: CancellationToken,
    last_prompt: Option<(String, PromptOptions)>,
}

impl SessionRuntime {
    fn new(connection: Box<dyn crate::cli::CliConnection>, buffers: Arc<dyn BufferProvider>) -> Self {
        Self {
            state: SessionStateMachine::new(),
            connection,
            snapshots: SnapshotManager::new(buffers),
            cancel: CancellationToken::new(),
            last_prompt: None,
        }
    }
}

/// The top-level session orchestrator.
pub struct SessionOrchestrator {
    config: ConductorConfig,
    sessions: SessionManager,
    runtimes: HashMap<Uuid, SessionRuntime>,
    handler: EventHandler,
    rate_limit: RateLimitManager,
    /// The message rewritten by countdown ticks, per session.
    countdown_message: HashMap<Uuid, Uuid>,
    factory: Box<dyn ConnectionFactory>,
    buffers: Arc<dyn BufferProvider>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    countdown_tx: mpsc::UnboundedSender<CountdownEvent>,
    notifier: broadcast::Sender<Notification>,
}

impl SessionOrchestrator {
    /// Create an orchestrator from its collaborators.
    ///
    /// Must be called within a Tokio runtime: a forwarder task for
    /// countdown events is spawned immediately.
    #[must_use]
    pub fn new(
        config: ConductorConfig,
        mut sessions: SessionManager,
        factory: Box<dyn ConnectionFactory>,
        buffers: Arc<dyn BufferProvider>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (countdown_tx, mut countdown_rx) = mpsc::unbounded_channel();

        // Countdown events re-enter through the same inbound channel so
        // all mutation stays on the processing task.
        let forward = inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = countdown_rx.recv().await {
                if forward.send(Inbound::Countdown(event)).is_err() {
                    break;
                }
            }
        });

        let (notifier, _) = broadcast::channel(NOTIFY_BUFFER);

        // The status snapshot is scoped to the current session; observers
        // re-probe once the pointer is about to move.
        let status_notifier = notifier.clone();
        sessions.on_before_switch(Box::new(move |from, to| {
            tracing::debug!(%from, %to, "current session changing");
            let _ = status_notifier.send(Notification::StatusChanged);
        }));

        Self {
            config,
            sessions,
            runtimes: HashMap::new(),
            handler: EventHandler::new(),
            rate_limit: RateLimitManager::new(),
            countdown_message: HashMap::new(),
            factory,
            buffers,
            inbound_tx,
            inbound_rx,
            countdown_tx,
            notifier,
        }
    }

    /// Subscribe to change notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    // ---- session surface -------------------------------------------------

    /// All sessions.
    #[must_use]
    pub fn sessions(&self) -> &[Session] {
        self.sessions.sessions()
    }

    /// Id of the current session.
    #[must_use]
    pub fn current_session_id(&self) -> Uuid {
        self.sessions.current_id()
    }

    /// Message history of a session.
    #[must_use]
    pub fn messages(&self, session_id: Uuid) -> Option<&[Message]> {
        self.sessions.get(session_id).map(|s| s.messages.as_slice())
    }

    /// Observable state of a session.
    #[must_use]
    pub fn session_state(&self, session_id: Uuid) -> SessionState {
        self.runtimes
            .get(&session_id)
            .map_or(SessionState::Idle, |rt| rt.state.state())
    }

    /// Whether a session is blocked on an ask-user decision.
    #[must_use]
    pub fn is_waiting_for_user(&self, session_id: Uuid) -> bool {
        self.runtimes
            .get(&session_id)
            .is_some_and(|rt| rt.state.waiting_for_user())
    }

    /// Create a new session and make it current.
    pub fn start_new_session(&mut self) -> Uuid {
        let id = self.sessions.start_new_session();
        self.notify(Notification::SessionChanged { current: id });
        id
    }

    /// Change the current-session pointer. In-flight work on the
    /// previously current session keeps running.
    pub fn switch_session(&mut self, session_id: Uuid) -> Result<(), OrchestratorError> {
        if !self.sessions.switch_session(session_id) {
            return Err(OrchestratorError::UnknownSession(session_id));
        }
        self.notify(Notification::SessionChanged {
            current: session_id,
        });
        Ok(())
    }

    /// Delete a session, cancelling any in-flight work it owns.
    pub async fn delete_session(&mut self, session_id: Uuid) -> Result<(), OrchestratorError> {
        self.cancel_request(session_id).await;
        self.runtimes.remove(&session_id);
        if !self.sessions.delete_session(session_id) {
            return Err(OrchestratorError::UnknownSession(session_id));
        }
        self.notify(Notification::SessionChanged {
            current: self.sessions.current_id(),
        });
        Ok(())
    }

    /// Rename a session.
    pub fn rename_session(
        &mut self,
        session_id: Uuid,
        title: impl Into<String>,
    ) -> Result<(), OrchestratorError> {
        if !self.sessions.rename_session(session_id, title) {
            return Err(OrchestratorError::UnknownSession(session_id));
        }
        self.notify(Notification::SessionChanged {
            current: self.sessions.current_id(),
        });
        Ok(())
    }

    /// Persist the session list.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::Store` on save failure.
    pub async fn save(&self) -> Result<(), OrchestratorError> {
        self.sessions.save().await?;
        Ok(())
    }

    // ---- messaging -------------------------------------------------------

    /// Send a message to a session. Busy or waiting sessions (and
    /// sessions with an active rate-limit countdown) queue the message
    /// instead; a full queue rejects it.
    pub async fn send_message(
        &mut self,
        session_id: Uuid,
        content: impl Into<String>,
        options: Option<PromptOptions>,
    ) -> Result<SendResult, OrchestratorError> {
        self.send_message_with_context(session_id, content, None, options)
            .await
    }

    /// Like [`send_message`](Self::send_message), with editor context
    /// (selection, attachments) folded into the prompt at dispatch time.
    pub async fn send_message_with_context(
        &mut self,
        session_id: Uuid,
        content: impl Into<String>,
        context: Option<QueuedContext>,
        options: Option<PromptOptions>,
    ) -> Result<SendResult, OrchestratorError> {
        if self.sessions.get(session_id).is_none() {
            return Err(OrchestratorError::UnknownSession(session_id));
        }
        let content = content.into();
        let options = options.unwrap_or_else(|| self.default_options());
        let context = context.filter(|c| !c.is_empty());

        let busy = !self.runtime_mut(session_id).state.is_free()
            || self.rate_limit.counting_session() == Some(session_id);

        if busy {
            let queue_cap = self.config.queue_cap;
            let mut entry = QueuedMessage::new(content, options);
            entry.context = context;
            let result = match self.sessions.get_mut(session_id) {
                Some(session) => {
                    session.queue.set_cap(queue_cap);
                    session.queue.push_entry(entry)
                }
                None => return Err(OrchestratorError::UnknownSession(session_id)),
            };
            return Ok(match result {
                EnqueueResult::Enqueued(entry) => {
                    self.notify(Notification::QueueChanged { session_id });
                    SendResult::Queued(entry)
                }
                EnqueueResult::Rejected(entry) => SendResult::Rejected(entry),
            });
        }

        let prompt = match context {
            Some(ctx) => ctx.assemble(&content),
            None => content,
        };
        let message = self.dispatch(session_id, prompt, options, true).await;
        Ok(SendResult::Dispatched(message))
    }

    /// Answer a pending ask-user request with the chosen options.
    ///
    /// Resumes the same CLI run when a resume token or live channel is
    /// available; otherwise the response becomes a fresh prompt.
    pub async fn respond_to_ask_user(
        &mut self,
        session_id: Uuid,
        responses: Vec<String>,
    ) -> Result<(), OrchestratorError> {
        let (text, resume) = {
            let session = self
                .sessions
                .get_mut(session_id)
                .ok_or(OrchestratorError::UnknownSession(session_id))?;
            let message = session
                .messages
                .iter_mut()
                .rev()
                .find(|m| m.ask_user.is_some())
                .ok_or(OrchestratorError::NoPendingAskUser(session_id))?;
            message.ask_user = None;
            (responses.join("\n"), session.resume_token.clone())
        };
        self.notify_last_message(session_id);

        {
            let rt = self.runtime_mut(session_id);
            rt.state.set_waiting_for_user(false);
        }
        self.notify_state(session_id);

        // Live single-channel run: feed the answer straight in.
        let live = {
            let rt = self.runtime_mut(session_id);
            rt.state.state() == SessionState::Streaming && rt.connection.is_running()
        };
        if live {
            let rt = self.runtime_mut(session_id);
            rt.connection.send_user_input(&text).await?;
            return Ok(());
        }

        // The parked turn is over; seal its message before resuming.
        self.seal_in_flight(session_id);
        self.handler.cancel_turn(session_id);

        let mut options = self.default_options();
        options.resume = resume;
        self.dispatch(session_id, text, options, true).await;
        Ok(())
    }

    /// Cancel a session's in-flight request. Partial streamed content
    /// stays in the history; the session returns to idle immediately.
    pub async fn cancel_request(&mut self, session_id: Uuid) {
        if self.rate_limit.counting_session() == Some(session_id) {
            self.cancel_rate_limit(session_id);
        }
        self.seal_in_flight(session_id);
        self.handler.cancel_turn(session_id);
        if let Some(rt) = self.runtimes.get_mut(&session_id) {
            rt.cancel.cancel();
            rt.cancel = CancellationToken::new();
            if let Err(e) = rt.connection.cancel().await {
                tracing::warn!(session_id = %session_id, error = %e, "connection cancel failed");
            }
            rt.state.force_idle();
        }
        self.notify_state(session_id);
        self.drain_queue(session_id).await;
    }

    /// Cancel an active rate-limit countdown without touching the
    /// connection. The stored retry request is discarded.
    pub fn cancel_rate_limit(&mut self, session_id: Uuid) {
        if self.rate_limit.counting_session() != Some(session_id) {
            return;
        }
        self.rate_limit.cancel();
        if let Some(message_id) = self.countdown_message.remove(&session_id) {
            if let Some(session) = self.sessions.get_mut(session_id) {
                if let Some(message) = session.message_mut(message_id) {
                    message.seal();
                }
            }
            self.notify(Notification::MessageUpdated {
                session_id,
                message_id,
            });
        }
    }

    // ---- queue surface ---------------------------------------------------

    /// Pending queue entries for a session.
    #[must_use]
    pub fn queued_messages(&self, session_id: Uuid) -> Vec<QueuedMessage> {
        self.sessions
            .get(session_id)
            .map(|s| s.queue.entries().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove a queued message.
    pub fn queue_remove(&mut self, session_id: Uuid, entry_id: Uuid) -> bool {
        let removed = self
            .sessions
            .get_mut(session_id)
            .and_then(|s| s.queue.remove(entry_id))
            .is_some();
        if removed {
            self.notify(Notification::QueueChanged { session_id });
        }
        removed
    }

    /// Reorder a queued message.
    pub fn queue_reorder(&mut self, session_id: Uuid, from: usize, to: usize) -> bool {
        let moved = self
            .sessions
            .get_mut(session_id)
            .is_some_and(|s| s.queue.reorder(from, to));
        if moved {
            self.notify(Notification::QueueChanged { session_id });
        }
        moved
    }

    /// Rewrite a queued message's content.
    pub fn queue_update(&mut self, session_id: Uuid, entry_id: Uuid, content: impl Into<String>) -> bool {
        let updated = self
            .sessions
            .get_mut(session_id)
            .is_some_and(|s| s.queue.update(entry_id, content));
        if updated {
            self.notify(Notification::QueueChanged { session_id });
        }
        updated
    }

    // ---- file change surface --------------------------------------------

    /// Pending file changes for a session's last command.
    #[must_use]
    pub fn pending_file_changes(&self, session_id: Uuid) -> Vec<FileChange> {
        self.runtimes
            .get(&session_id)
            .map(|rt| rt.snapshots.changes())
            .unwrap_or_default()
    }

    /// The before/after pair for one file, for diff display.
    #[must_use]
    pub fn show_diff(&self, session_id: Uuid, path: &Path) -> Option<FileChange> {
        self.pending_file_changes(session_id)
            .into_iter()
            .find(|c| c.path == path)
    }

    /// Revert one file to its pre-command content.
    pub async fn revert_file(
        &mut self,
        session_id: Uuid,
        path: &Path,
    ) -> Result<(), OrchestratorError> {
        let rt = self
            .runtimes
            .get_mut(&session_id)
            .ok_or(OrchestratorError::UnknownSession(session_id))?;
        rt.snapshots.revert_file(path).await?;
        Ok(())
    }

    /// Revert all pending changes, returning per-file failures.
    pub async fn revert_all(&mut self, session_id: Uuid) -> Vec<(PathBuf, SnapshotError)> {
        match self.runtimes.get_mut(&session_id) {
            Some(rt) => rt.snapshots.revert_all().await,
            None => Vec::new(),
        }
    }

    /// Accept one file's change, keeping the file as edited.
    pub fn accept_file(&mut self, session_id: Uuid, path: &Path) -> bool {
        self.runtimes
            .get_mut(&session_id)
            .is_some_and(|rt| rt.snapshots.accept_file(path))
    }

    /// Accept all pending changes.
    pub fn accept_all(&mut self, session_id: Uuid) {
        if let Some(rt) = self.runtimes.get_mut(&session_id) {
            rt.snapshots.accept_all();
        }
    }

    // ---- status ----------------------------------------------------------

    /// Probe the CLI and return a status snapshot.
    pub async fn status(&mut self) -> ConnectionStatus {
        let session_id = self.sessions.current_id();
        let execution_method = self.factory.execution_method();
        let model = self.config.cli.model.clone();
        let probe = {
            let rt = self.runtime_mut(session_id);
            rt.connection.check_connection().await
        };
        match probe {
            Ok(info) => ConnectionStatus {
                connected: true,
                version: info.version,
                model,
                execution_method,
            },
            Err(e) => {
                tracing::warn!(error = %e, "connection probe failed");
                ConnectionStatus {
                    connected: false,
                    version: None,
                    model,
                    execution_method,
                }
            }
        }
    }

    // ---- event loop ------------------------------------------------------

    /// Process inbound events forever. Intended for the host to drive
    /// on a dedicated task.
    pub async fn run(&mut self) {
        while let Some(inbound) = self.inbound_rx.recv().await {
            self.apply_inbound(inbound).await;
        }
    }

    /// Process one inbound event. Returns false when the channel is
    /// closed.
    pub async fn process_next(&mut self) -> bool {
        match self.inbound_rx.recv().await {
            Some(inbound) => {
                self.apply_inbound(inbound).await;
                true
            }
            None => false,
        }
    }

    async fn apply_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Cli {
                session_id,
                turn_id,
                event,
            } => self.apply_cli(session_id, turn_id, event).await,
            Inbound::TurnClosed {
                session_id,
                turn_id,
                error,
            } => self.apply_turn_closed(session_id, turn_id, error).await,
            Inbound::AutoAccept {
                session_id,
                request_id,
            } => self.apply_auto_accept(session_id, request_id).await,
            Inbound::Countdown(event) => self.apply_countdown(event).await,
        }
    }

    async fn apply_cli(&mut self, session_id: Uuid, turn_id: Uuid, event: CliEvent) {
        // First event of the turn moves the session into streaming.
        let entered_streaming = self.runtimes.get_mut(&session_id).is_some_and(|rt| {
            rt.state.state() == SessionState::Sending && rt.state.transition(SessionState::Streaming)
        });
        if entered_streaming {
            self.notify_state(session_id);
        }

        let effects = {
            let Some(session) = self.sessions.get_mut(session_id) else {
                return;
            };
            self.handler.apply(session, turn_id, &event)
        };
        for effect in effects {
            self.apply_effect(session_id, effect).await;
        }
    }

    async fn apply_effect(&mut self, session_id: Uuid, effect: TurnEffect) {
        match effect {
            TurnEffect::MessageUpdated => self.notify_in_flight(session_id),
            TurnEffect::ResumeToken(_) => {}
            TurnEffect::FileWillEdit(path) => {
                if let Some(rt) = self.runtimes.get_mut(&session_id) {
                    rt.snapshots.capture_before(&path).await;
                }
            }
            TurnEffect::FileEdited(path) => {
                if let Some(rt) = self.runtimes.get_mut(&session_id) {
                    rt.snapshots.capture_after(&path).await;
                }
            }
            TurnEffect::AskUser(request) => self.apply_ask_user(session_id, request.id),
            TurnEffect::RateLimited {
                message,
                retry_after,
            } => self.apply_rate_limited(session_id, message, retry_after).await,
            TurnEffect::Failed(error) => self.fail_turn(session_id, error).await,
            TurnEffect::Completed { usage, is_error } => {
                self.complete_turn(session_id, usage, is_error).await;
            }
        }
    }

    fn apply_ask_user(&mut self, session_id: Uuid, request_id: Uuid) {
        if self.config.auto_accept {
            // Mark the request so the auto-selection is visible, then
            // schedule the synthesized answer.
            if let Some(session) = self.sessions.get_mut(session_id) {
                if let Some(message) = session
                    .messages
                    .iter_mut()
                    .rev()
                    .find(|m| m.ask_user.as_ref().is_some_and(|a| a.id == request_id))
                {
                    if let Some(ask) = message.ask_user.as_mut() {
                        ask.auto_accepted = true;
                    }
                }
            }
            self.notify_in_flight(session_id);

            let inbound = self.inbound_tx.clone();
            let cancel = self.runtime_mut(session_id).cancel.child_token();
            tokio::spawn(async move {
                tokio::select! {
                    () = cancel.cancelled() => {}
                    () = tokio::time::sleep(AUTO_ACCEPT_DELAY) => {
                        let _ = inbound.send(Inbound::AutoAccept {
                            session_id,
                            request_id,
                        });
                    }
                }
            });
        } else {
            self.runtime_mut(session_id).state.set_waiting_for_user(true);
            self.notify_state(session_id);
        }
    }

    async fn apply_auto_accept(&mut self, session_id: Uuid, request_id: Uuid) {
        let answer = self.sessions.get(session_id).and_then(|session| {
            session
                .messages
                .iter()
                .rev()
                .find_map(|m| m.ask_user.as_ref().filter(|a| a.id == request_id))
                .and_then(|a| a.first_option().map(String::from))
        });
        let Some(answer) = answer else {
            // Answered by a human in the meantime, or the turn was
            // cancelled; nothing to do.
            return;
        };
        tracing::debug!(session_id = %session_id, %answer, "auto-accepting ask-user request");
        if let Err(e) = self.respond_to_ask_user(session_id, vec![answer]).await {
            tracing::warn!(session_id = %session_id, error = %e, "auto-accept response failed");
        }
    }

    async fn apply_rate_limited(
        &mut self,
        session_id: Uuid,
        message: String,
        retry_after: Option<Duration>,
    ) {
        tracing::warn!(session_id = %session_id, %message, "rate limit detected");

        let Some((prompt, options)) = self
            .runtimes
            .get(&session_id)
            .and_then(|rt| rt.last_prompt.clone())
        else {
            // Nothing to retry; treat as an ordinary failure.
            self.fail_turn(session_id, message).await;
            return;
        };

        // Stop consuming this turn; the countdown owns the message now.
        let message_id = self.handler.in_flight_message(session_id);
        self.handler.cancel_turn(session_id);
        if let Some(rt) = self.runtimes.get_mut(&session_id) {
            rt.cancel.cancel();
            rt.cancel = CancellationToken::new();
            if let Err(e) = rt.connection.cancel().await {
                tracing::warn!(session_id = %session_id, error = %e, "connection cancel failed");
            }
            rt.state.transition(SessionState::Idle);
        }
        self.notify_state(session_id);

        // The notice needs a message to live in.
        let message_id = match message_id {
            Some(id) => id,
            None => {
                let notice = Message::assistant_streaming();
                let id = notice.id;
                if let Some(session) = self.sessions.get_mut(session_id) {
                    session.messages.push(notice);
                }
                self.notify(Notification::MessageReceived {
                    session_id,
                    message_id: id,
                });
                id
            }
        };
        self.countdown_message.insert(session_id, message_id);

        let retry_after = retry_after
            .unwrap_or_else(|| Duration::from_secs(self.config.rate_limit.default_retry_secs));
        self.rate_limit.begin(
            PendingRetry {
                session_id,
                prompt,
                options,
            },
            retry_after,
            self.countdown_tx.clone(),
        );
    }

    async fn apply_countdown(&mut self, event: CountdownEvent) {
        match event {
            CountdownEvent::Tick {
                session_id,
                remaining_secs,
            } => {
                let Some(&message_id) = self.countdown_message.get(&session_id) else {
                    return;
                };
                if let Some(session) = self.sessions.get_mut(session_id) {
                    if let Some(message) = session.message_mut(message_id) {
                        message.content = ratelimit::notice(remaining_secs);
                    }
                }
                self.notify(Notification::MessageUpdated {
                    session_id,
                    message_id,
                });
            }
            CountdownEvent::Expired { session_id } => {
                let Some(retry) = self.rate_limit.take_pending() else {
                    return;
                };
                // The notice message was transient; the retried turn
                // streams into a fresh one.
                if let Some(message_id) = self.countdown_message.remove(&session_id) {
                    if let Some(session) = self.sessions.get_mut(session_id) {
                        session.messages.retain(|m| m.id != message_id);
                    }
                    self.notify(Notification::MessageUpdated {
                        session_id,
                        message_id,
                    });
                }
                tracing::info!(session_id = %session_id, "rate limit expired, retrying request");
                self.dispatch(session_id, retry.prompt, retry.options, false).await;
            }
        }
    }

    async fn apply_turn_closed(&mut self, session_id: Uuid, turn_id: Uuid, error: Option<String>) {
        if !self.handler.is_active(session_id, turn_id) {
            return;
        }
        // A turn that already concluded (for example parked on an
        // ask-user request) left the session idle; the stream closing
        // afterwards carries no new information.
        if self.session_state(session_id) == SessionState::Idle {
            return;
        }
        match error {
            Some(error) => self.fail_turn(session_id, error).await,
            // The process exited before producing a single event.
            None if self.session_state(session_id) == SessionState::Sending => {
                self.fail_turn(session_id, "CLI exited without producing output".to_string())
                    .await;
            }
            // Stream ended without a terminal result event: treat the
            // process exit as completion.
            None => self.complete_turn(session_id, UsageStats::default(), false).await,
        }
    }

    // ---- turn lifecycle --------------------------------------------------

    /// Dispatch a prompt on a session. `push_user` is false for retries,
    /// where the user message already exists.
    async fn dispatch(
        &mut self,
        session_id: Uuid,
        prompt: String,
        mut options: PromptOptions,
        push_user: bool,
    ) -> Message {
        // Continue the session's CLI run where the last turn left off.
        if options.resume.is_none() {
            options.resume = self
                .sessions
                .get(session_id)
                .and_then(|s| s.resume_token.clone());
        }

        let user_message = Message::user(prompt.clone());
        if push_user {
            if let Some(session) = self.sessions.get_mut(session_id) {
                session.messages.push(user_message.clone());
            }
            self.notify(Notification::MessageReceived {
                session_id,
                message_id: user_message.id,
            });
        }

        {
            let rt = self.runtime_mut(session_id);
            rt.state.transition(SessionState::Sending);
            // New user turn: previous command's snapshots are gone.
            rt.snapshots.begin_command();
            rt.last_prompt = Some((prompt.clone(), options.clone()));
        }
        self.notify_state(session_id);

        let turn_id = self.handler.begin_turn(session_id);
        let send = {
            let rt = self.runtime_mut(session_id);
            rt.connection.send_prompt(&prompt, &options).await
        };
        match send {
            Ok(events) => {
                let inbound = self.inbound_tx.clone();
                let cancel = self.runtime_mut(session_id).cancel.child_token();
                let turn_timeout = self.config.timeouts.turn();
                tokio::spawn(run_turn_reader(
                    events,
                    inbound,
                    cancel,
                    session_id,
                    turn_id,
                    turn_timeout,
                ));
            }
            Err(e) => {
                self.fail_turn(session_id, format!("connection error: {e}")).await;
            }
        }
        user_message
    }

    async fn fail_turn(&mut self, session_id: Uuid, error: String) {
        tracing::warn!(session_id = %session_id, %error, "turn failed");
        self.handler.cancel_turn(session_id);

        // Surface the error on the in-flight message, or a fresh one.
        let message_id = {
            let session = self.sessions.get_mut(session_id);
            session.map(|session| {
                if let Some(message) = session
                    .messages
                    .iter_mut()
                    .rev()
                    .find(|m| m.is_streaming)
                {
                    message.append_chunk(&error);
                    message.is_error = true;
                    message.seal();
                    message.id
                } else {
                    let mut message = Message::assistant_streaming();
                    message.append_chunk(&error);
                    message.is_error = true;
                    message.seal();
                    let id = message.id;
                    session.messages.push(message);
                    id
                }
            })
        };
        if let Some(message_id) = message_id {
            self.notify(Notification::MessageUpdated {
                session_id,
                message_id,
            });
        }

        if let Some(rt) = self.runtimes.get_mut(&session_id) {
            rt.cancel.cancel();
            rt.cancel = CancellationToken::new();
            rt.state.transition(SessionState::Error);
        }
        self.notify_state(session_id);
        if let Some(rt) = self.runtimes.get_mut(&session_id) {
            rt.state.transition(SessionState::Idle);
        }
        self.notify_state(session_id);
        self.drain_queue(session_id).await;
    }

    async fn complete_turn(&mut self, session_id: Uuid, usage: UsageStats, is_error: bool) {
        let waiting = self
            .runtimes
            .get(&session_id)
            .is_some_and(|rt| rt.state.waiting_for_user());
        let summary = self
            .runtimes
            .get(&session_id)
            .map(|rt| rt.snapshots.summary());

        let message_id = self.handler.in_flight_message(session_id);
        if let (Some(message_id), Some(session)) = (message_id, self.sessions.get_mut(session_id)) {
            if let Some(message) = session.message_mut(message_id) {
                message.usage = Some(usage);
                if is_error {
                    message.is_error = true;
                }
                if let Some(summary) = summary {
                    if !summary.is_empty() {
                        message.file_changes = Some(summary);
                    }
                }
                // A turn that is CLI-complete but conversation-incomplete
                // stays non-final until the ask-user answer arrives.
                if !waiting {
                    message.seal();
                }
            }
            self.notify(Notification::MessageUpdated {
                session_id,
                message_id,
            });
        }

        if !waiting {
            self.handler.cancel_turn(session_id);
        }
        if let Some(rt) = self.runtimes.get_mut(&session_id) {
            rt.state.transition(SessionState::Idle);
        }
        self.notify_state(session_id);

        if let Err(e) = self.sessions.save().await {
            tracing::warn!(error = %e, "session save failed");
        }
        self.drain_queue(session_id).await;
    }

    async fn drain_queue(&mut self, session_id: Uuid) {
        let free = self
            .runtimes
            .get(&session_id)
            .map_or(true, |rt| rt.state.is_free())
            && self.rate_limit.counting_session() != Some(session_id);
        if !free {
            return;
        }
        let entry = self
            .sessions
            .get_mut(session_id)
            .and_then(|session| session.queue.pop());
        if let Some(entry) = entry {
            self.notify(Notification::QueueChanged { session_id });
            tracing::debug!(session_id = %session_id, "dispatching queued message");
            let prompt = match entry.context {
                Some(ctx) => ctx.assemble(&entry.content),
                None => entry.content,
            };
            // Boxed: dispatch can fail back into the queue drain.
            Box::pin(self.dispatch(session_id, prompt, entry.options, true)).await;
        }
    }

    // ---- helpers ---------------------------------------------------------

    fn runtime_mut(&mut self, session_id: Uuid) -> &mut SessionRuntime {
        let factory = &self.factory;
        let buffers = &self.buffers;
        self.runtimes
            .entry(session_id)
            .or_insert_with(|| SessionRuntime::new(factory.create(), Arc::clone(buffers)))
    }

    fn default_options(&self) -> PromptOptions {
        PromptOptions {
            model: self.config.cli.model.clone(),
            working_dir: self.config.cli.working_dir.clone(),
            system_prompt: self.config.cli.system_prompt.clone(),
            max_turns: self.config.cli.max_turns,
            allowed_tools: self.config.cli.allowed_tools.clone(),
            disallowed_tools: self.config.cli.disallowed_tools.clone(),
            resume: None,
        }
    }

    /// Seal the in-flight streaming message, if any.
    fn seal_in_flight(&mut self, session_id: Uuid) {
        let message_id = {
            let Some(session) = self.sessions.get_mut(session_id) else {
                return;
            };
            session
                .messages
                .iter_mut()
                .rev()
                .find(|m| m.is_streaming)
                .map(|message| {
                    message.seal();
                    message.id
                })
        };
        if let Some(message_id) = message_id {
            self.notify(Notification::MessageUpdated {
                session_id,
                message_id,
            });
        }
    }

    fn notify(&self, notification: Notification) {
        let _ = self.notifier.send(notification);
    }

    fn notify_state(&self, session_id: Uuid) {
        let (state, waiting) = self
            .runtimes
            .get(&session_id)
            .map_or((SessionState::Idle, false), |rt| {
                (rt.state.state(), rt.state.waiting_for_user())
            });
        self.notify(Notification::StateChanged {
            session_id,
            state,
            waiting_for_user: waiting,
        });
    }

    fn notify_in_flight(&self, session_id: Uuid) {
        if let Some(message_id) = self.handler.in_flight_message(session_id) {
            self.notify(Notification::MessageUpdated {
                session_id,
                message_id,
            });
        }
    }

    fn notify_last_message(&self, session_id: Uuid) {
        if let Some(message) = self.sessions.get(session_id).and_then(Session::last_message) {
            self.notify(Notification::MessageUpdated {
                session_id,
                message_id: message.id,
            });
        }
    }
}

/// Reader task for one turn: forwards events until the stream ends,
/// the turn is cancelled, or the overall timeout elapses.
async fn run_turn_reader(
    mut events: mpsc::Receiver<CliEvent>,
    inbound: mpsc::UnboundedSender<Inbound>,
    cancel: CancellationToken,
    session_id: Uuid,
    turn_id: Uuid,
    turn_timeout: Duration,
) {
    let outcome = tokio::time::timeout(turn_timeout, async {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return true,
                event = events.recv() => match event {
                    Some(event) => {
                        if inbound
                            .send(Inbound::Cli { session_id, turn_id, event })
                            .is_err()
                        {
                            return true;
                        }
                    }
                    None => return false,
                }
            }
        }
    })
    .await;

    match outcome {
        // Cancelled: the orchestrator already reset the session.
        Ok(true) => {}
        Ok(false) => {
            let _ = inbound.send(Inbound::TurnClosed {
                session_id,
                turn_id,
                error: None,
            });
        }
        Err(_) => {
            let _ = inbound.send(Inbound::TurnClosed {
                session_id,
                turn_id,
                error: Some("turn timed out waiting for the CLI".to_string()),
            });
        }
    }
}
