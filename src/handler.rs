//! Protocol state machine turning raw CLI events into message updates.
//!
//! One [`EventHandler`] serves all sessions, but every piece of turn
//! state is keyed by session id. Applying an event mutates the owning
//! session's in-flight assistant message and returns a list of
//! [`TurnEffect`]s for the orchestrator to act on. Nothing in here
//! performs I/O and nothing panics across the apply boundary; per-event
//! anomalies degrade to a log entry plus no-op.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::cli::{CliEvent, ContentDelta, ErrorEvent, QuestionEvent, ToolResultEvent, ToolUseEvent};
use crate::ratelimit;
use crate::session::{AskUserRequest, Message, Question, Session, ToolAction, UsageStats};

/// Tool name the CLI uses for interactive questions.
pub const ASK_USER_TOOL: &str = "AskUserQuestion";

/// Tools whose results mean a file was modified.
const FILE_EDIT_TOOLS: &[&str] = &["Edit", "MultiEdit", "Write", "NotebookEdit"];

/// Effects the orchestrator must apply after an event.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEffect {
    /// The in-flight message changed; notify observers.
    MessageUpdated,
    /// The CLI exposed a resume token for this session.
    ResumeToken(String),
    /// A file edit is about to happen; capture before-content.
    FileWillEdit(PathBuf),
    /// A file edit finished; capture after-content.
    FileEdited(PathBuf),
    /// The assistant needs a user decision to continue.
    AskUser(AskUserRequest),
    /// A rate limit was reported; delegate to the rate limit manager.
    RateLimited {
        /// Human-readable description.
        message: String,
        /// Parsed retry-after hint, when available.
        retry_after: Option<Duration>,
    },
    /// The turn failed with a non-rate-limit error.
    Failed(String),
    /// The CLI signalled terminal completion of the turn.
    Completed {
        /// Usage stats from the result event.
        usage: UsageStats,
        /// Whether the CLI flagged the turn as errored.
        is_error: bool,
    },
}

/// Per-session state for the in-flight turn.
#[derive(Debug, Clone)]
struct ActiveTurn {
    turn_id: Uuid,
    message_id: Option<Uuid>,
}

/// The CLI event handler: one ordered stream per session.
#[derive(Debug, Default)]
pub struct EventHandler {
    turns: HashMap<Uuid, ActiveTurn>,
}

impl EventHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a turn for a session. Returns the turn id used to tag events.
    pub fn begin_turn(&mut self, session_id: Uuid) -> Uuid {
        let turn_id = Uuid::new_v4();
        self.turns.insert(
            session_id,
            ActiveTurn {
                turn_id,
                message_id: None,
            },
        );
        turn_id
    }

    /// Drop the active turn for a session. Events still in flight for
    /// that turn will be ignored by turn-id mismatch.
    pub fn cancel_turn(&mut self, session_id: Uuid) {
        self.turns.remove(&session_id);
    }

    /// Id of the in-flight assistant message, if one exists.
    #[must_use]
    pub fn in_flight_message(&self, session_id: Uuid) -> Option<Uuid> {
        self.turns.get(&session_id).and_then(|t| t.message_id)
    }

    /// Whether the given turn is still the session's active one.
    #[must_use]
    pub fn is_active(&self, session_id: Uuid, turn_id: Uuid) -> bool {
        self.turns
            .get(&session_id)
            .is_some_and(|t| t.turn_id == turn_id)
    }

    /// Apply one event to the owning session.
    ///
    /// Events tagged with a stale turn id (the turn was cancelled or a
    /// new one started) are dropped without touching the session.
    pub fn apply(&mut self, session: &mut Session, turn_id: Uuid, event: &CliEvent) -> Vec<TurnEffect> {
        let Some(turn) = self.turns.get(&session.id) else {
            tracing::debug!(session_id = %session.id, "event for session without active turn, dropping");
            return Vec::new();
        };
        if turn.turn_id != turn_id {
            tracing::debug!(session_id = %session.id, %turn_id, "event for stale turn, dropping");
            return Vec::new();
        }

        match event {
            CliEvent::System(init) => {
                let mut effects = Vec::new();
                if let Some(token) = &init.session_id {
                    session.resume_token = Some(token.clone());
                    effects.push(TurnEffect::ResumeToken(token.clone()));
                }
                effects
            }
            CliEvent::Assistant { message } => {
                let text = extract_assistant_text(message);
                if text.is_empty() {
                    return Vec::new();
                }
                self.in_flight(session).append_chunk(&text);
                vec![TurnEffect::MessageUpdated]
            }
            CliEvent::Text { text } => {
                self.in_flight(session).append_chunk(text);
                vec![TurnEffect::MessageUpdated]
            }
            CliEvent::ContentBlockDelta { delta, .. } => match delta {
                ContentDelta::TextDelta { text } => {
                    self.in_flight(session).append_delta(text);
                    vec![TurnEffect::MessageUpdated]
                }
                _ => Vec::new(),
            },
            CliEvent::ToolUse(tool_use) => self.handle_tool_use(session, tool_use),
            CliEvent::ToolResult(result) => self.handle_tool_result(session, result),
            CliEvent::InputRequest { questions } => self.handle_input_request(session, questions),
            CliEvent::Error(err) => self.handle_error(session, err),
            CliEvent::Result(result) => {
                let mut effects = Vec::new();
                if let Some(token) = &result.session_id {
                    session.resume_token = Some(token.clone());
                    effects.push(TurnEffect::ResumeToken(token.clone()));
                }
                if let Some(text) = &result.result {
                    let message = self.in_flight(session);
                    if message.content.is_empty() {
                        message.append_chunk(text);
                        effects.push(TurnEffect::MessageUpdated);
                    }
                }
                effects.push(TurnEffect::Completed {
                    usage: UsageStats {
                        cost_usd: result.cost_usd,
                        duration_ms: result.duration_ms,
                        num_turns: result.num_turns,
                    },
                    is_error: result.is_error,
                });
                effects
            }
            CliEvent::Unknown => {
                tracing::debug!(session_id = %session.id, "ignoring unknown event kind");
                Vec::new()
            }
        }
    }

    fn handle_tool_use(&mut self, session: &mut Session, tool_use: &ToolUseEvent) -> Vec<TurnEffect> {
        if tool_use.name == ASK_USER_TOOL {
            return match parse_ask_user_input(&tool_use.input) {
                Some(request) => {
                    self.in_flight(session).ask_user = Some(request.clone());
                    vec![TurnEffect::MessageUpdated, TurnEffect::AskUser(request)]
                }
                None => {
                    // Missing questions payload: log and continue the turn.
                    tracing::warn!(session_id = %session.id, "ask-user tool without questions, ignoring");
                    Vec::new()
                }
            };
        }

        let mut effects = vec![TurnEffect::MessageUpdated];
        if FILE_EDIT_TOOLS.contains(&tool_use.name.as_str()) {
            if let Some(path) = file_path_from_input(&tool_use.input) {
                effects.push(TurnEffect::FileWillEdit(path));
            }
        }
        self.in_flight(session).tool_actions.push(ToolAction::running(
            tool_use.id.clone(),
            tool_use.name.clone(),
            tool_use.input.clone(),
        ));
        tracing::debug!(session_id = %session.id, tool = %tool_use.name, "tool action opened");
        effects
    }

    fn handle_tool_result(&mut self, session: &mut Session, result: &ToolResultEvent) -> Vec<TurnEffect> {
        let message = self.in_flight(session);
        let idx = message
            .tool_actions
            .iter()
            .position(|a| a.id == result.tool_use_id)
            .or_else(|| {
                // Fall back to the oldest open action when ids do not line up.
                message
                    .tool_actions
                    .iter()
                    .position(|a| a.status == crate::session::ToolStatus::Running)
            });

        let Some(idx) = idx else {
            tracing::warn!(
                session_id = %session.id,
                tool_use_id = %result.tool_use_id,
                "tool result without matching action, ignoring"
            );
            return Vec::new();
        };

        let action = &mut message.tool_actions[idx];
        action.close(result.content.clone(), result.is_error);
        let mut effects = vec![TurnEffect::MessageUpdated];
        if FILE_EDIT_TOOLS.contains(&action.name.as_str()) && !result.is_error {
            if let Some(path) = file_path_from_input(&action.input) {
                effects.push(TurnEffect::FileEdited(path));
            }
        }
        effects
    }

    fn handle_input_request(&mut self, session: &mut Session, questions: &[QuestionEvent]) -> Vec<TurnEffect> {
        if questions.is_empty() {
            tracing::warn!(session_id = %session.id, "input_request without questions, ignoring");
            return Vec::new();
        }
        let request = AskUserRequest::new(
            questions
                .iter()
                .map(|q| Question {
                    text: q.text.clone(),
                    header: q.header.clone(),
                    options: q.options.clone(),
                    multi_select: q.multi_select,
                })
                .collect(),
        );
        self.in_flight(session).ask_user = Some(request.clone());
        vec![TurnEffect::MessageUpdated, TurnEffect::AskUser(request)]
    }

    fn handle_error(&mut self, session: &mut Session, err: &ErrorEvent) -> Vec<TurnEffect> {
        if err.is_rate_limit() {
            return vec![TurnEffect::RateLimited {
                message: err.message.clone(),
                retry_after: err.retry_after_secs.map(Duration::from_secs),
            }];
        }
        if let Some(signal) = ratelimit::detect(&err.message) {
            return vec![TurnEffect::RateLimited {
                message: err.message.clone(),
                retry_after: signal.retry_after,
            }];
        }
        tracing::warn!(session_id = %session.id, error = %err.message, "CLI reported error");
        let message = self.in_flight(session);
        message.is_error = true;
        vec![TurnEffect::Failed(err.message.clone())]
    }

    /// The in-flight assistant message, created on first use.
    ///
    /// The assistant message only comes into existence when the first
    /// streamed event of the turn needs it.
    fn in_flight<'a>(&mut self, session: &'a mut Session) -> &'a mut Message {
        let turn = self.turns.entry(session.id).or_insert_with(|| ActiveTurn {
            turn_id: Uuid::new_v4(),
            message_id: None,
        });
        let id = match turn.message_id {
            Some(id) if session.messages.iter().any(|m| m.id == id) => id,
            _ => {
                let message = Message::assistant_streaming();
                let id = message.id;
                turn.message_id = Some(id);
                session.messages.push(message);
                id
            }
        };
        let idx = session
            .messages
            .iter()
            .position(|m| m.id == id)
            .unwrap_or(session.messages.len() - 1);
        &mut session.messages[idx]
    }
}

/// Pull concatenated text blocks out of an assistant message value.
fn extract_assistant_text(message: &serde_json::Value) -> String {
    match message.get("content") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Array(blocks)) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(serde_json::Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(serde_json::Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Parse the ask-user tool input into a request.
fn parse_ask_user_input(input: &serde_json::Value) -> Option<AskUserRequest> {
    let questions = input.get("questions")?.as_array()?;
    if questions.is_empty() {
        return None;
    }
    let parsed: Vec<Question> = questions
        .iter()
        .filter_map(|q| {
            let text = q.get("question").or_else(|| q.get("text"))?.as_str()?;
            let options = q
                .get("options")?
                .as_array()?
                .iter()
                .filter_map(|o| {
                    o.as_str()
                        .map(String::from)
                        .or_else(|| o.get("label").and_then(serde_json::Value::as_str).map(String::from))
                })
                .collect::<Vec<_>>();
            Some(Question {
                text: text.to_string(),
                header: q
                    .get("header")
                    .and_then(serde_json::Value::as_str)
                    .map(String::from),
                options,
                multi_select: q
                    .get("multiSelect")
                    .or_else(|| q.get("multi_select"))
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false),
            })
        })
        .collect();
    if parsed.is_empty() {
        None
    } else {
        Some(AskUserRequest::new(parsed))
    }
}

/// Extract a file path from tool input.
fn file_path_from_input(input: &serde_json::Value) -> Option<PathBuf> {
    for key in ["file_path", "path", "notebook_path"] {
        if let Some(path) = input.get(key).and_then(serde_json::Value::as_str) {
            return Some(PathBuf::from(path));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{ResultEvent, SystemInit};
    use crate::session::ToolStatus;

    fn setup() -> (EventHandler, Session, Uuid) {
        let mut handler = EventHandler::new();
        let session = Session::new();
        let turn_id = handler.begin_turn(session.id);
        (handler, session, turn_id)
    }

    #[test]
    fn text_chunks_are_newline_joined() {
        let (mut handler, mut session, turn) = setup();
        handler.apply(&mut session, turn, &CliEvent::Text { text: "a".into() });
        handler.apply(&mut session, turn, &CliEvent::Text { text: "b".into() });
        assert_eq!(session.last_message().unwrap().content, "a\nb");
        assert!(session.last_message().unwrap().is_streaming);
    }

    #[test]
    fn deltas_are_raw_concatenated() {
        let (mut handler, mut session, turn) = setup();
        for text in ["Hel", "lo"] {
            handler.apply(
                &mut session,
                turn,
                &CliEvent::ContentBlockDelta {
                    index: 0,
                    delta: ContentDelta::TextDelta { text: text.into() },
                },
            );
        }
        assert_eq!(session.last_message().unwrap().content, "Hello");
    }

    #[test]
    fn system_event_records_resume_token_without_message() {
        let (mut handler, mut session, turn) = setup();
        let effects = handler.apply(
            &mut session,
            turn,
            &CliEvent::System(SystemInit {
                session_id: Some("tok-1".into()),
                ..Default::default()
            }),
        );
        assert_eq!(session.resume_token.as_deref(), Some("tok-1"));
        assert!(effects.contains(&TurnEffect::ResumeToken("tok-1".into())));
        assert!(session.messages.is_empty());
    }

    #[test]
    fn tool_use_then_result_closes_exactly_one_action() {
        let (mut handler, mut session, turn) = setup();
        handler.apply(
            &mut session,
            turn,
            &CliEvent::ToolUse(ToolUseEvent {
                id: "t1".into(),
                name: "Read".into(),
                input: serde_json::json!({"file_path": "/a.rs"}),
            }),
        );
        assert_eq!(
            session.last_message().unwrap().tool_actions[0].status,
            ToolStatus::Running
        );

        handler.apply(
            &mut session,
            turn,
            &CliEvent::ToolResult(ToolResultEvent {
                tool_use_id: "t1".into(),
                content: "contents".into(),
                is_error: false,
            }),
        );
        let actions = &session.last_message().unwrap().tool_actions;
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].status, ToolStatus::Completed);
        assert_eq!(actions[0].output.as_deref(), Some("contents"));
    }

    #[test]
    fn errored_tool_result_marks_action() {
        let (mut handler, mut session, turn) = setup();
        handler.apply(
            &mut session,
            turn,
            &CliEvent::ToolUse(ToolUseEvent {
                id: "t1".into(),
                name: "Bash".into(),
                input: serde_json::json!({}),
            }),
        );
        handler.apply(
            &mut session,
            turn,
            &CliEvent::ToolResult(ToolResultEvent {
                tool_use_id: "t1".into(),
                content: "boom".into(),
                is_error: true,
            }),
        );
        assert_eq!(
            session.last_message().unwrap().tool_actions[0].status,
            ToolStatus::Error
        );
    }

    #[test]
    fn mismatched_result_id_closes_oldest_running_action() {
        let (mut handler, mut session, turn) = setup();
        for id in ["t1", "t2"] {
            handler.apply(
                &mut session,
                turn,
                &CliEvent::ToolUse(ToolUseEvent {
                    id: id.into(),
                    name: "Bash".into(),
                    input: serde_json::json!({}),
                }),
            );
        }
        handler.apply(
            &mut session,
            turn,
            &CliEvent::ToolResult(ToolResultEvent {
                tool_use_id: "unknown".into(),
                content: "done".into(),
                is_error: false,
            }),
        );
        let actions = &session.last_message().unwrap().tool_actions;
        assert_eq!(actions[0].status, ToolStatus::Completed);
        assert_eq!(actions[1].status, ToolStatus::Running);
    }

    #[test]
    fn edit_tool_emits_file_capture_effects() {
        let (mut handler, mut session, turn) = setup();
        let effects = handler.apply(
            &mut session,
            turn,
            &CliEvent::ToolUse(ToolUseEvent {
                id: "t1".into(),
                name: "Edit".into(),
                input: serde_json::json!({"file_path": "/src/main.rs"}),
            }),
        );
        assert!(effects.contains(&TurnEffect::FileWillEdit(PathBuf::from("/src/main.rs"))));

        let effects = handler.apply(
            &mut session,
            turn,
            &CliEvent::ToolResult(ToolResultEvent {
                tool_use_id: "t1".into(),
                content: String::new(),
                is_error: false,
            }),
        );
        assert!(effects.contains(&TurnEffect::FileEdited(PathBuf::from("/src/main.rs"))));
    }

    #[test]
    fn ask_user_tool_routes_to_ask_user_path() {
        let (mut handler, mut session, turn) = setup();
        let effects = handler.apply(
            &mut session,
            turn,
            &CliEvent::ToolUse(ToolUseEvent {
                id: "t1".into(),
                name: ASK_USER_TOOL.into(),
                input: serde_json::json!({
                    "questions": [{"question": "Pick", "options": ["A", "B"]}]
                }),
            }),
        );
        let ask = effects.iter().find_map(|e| match e {
            TurnEffect::AskUser(req) => Some(req),
            _ => None,
        });
        assert_eq!(ask.unwrap().first_option(), Some("A"));
        assert!(session.last_message().unwrap().ask_user.is_some());
        // No tool action is opened for the interactive-question tool.
        assert!(session.last_message().unwrap().tool_actions.is_empty());
    }

    #[test]
    fn input_request_without_questions_is_ignored() {
        let (mut handler, mut session, turn) = setup();
        let effects = handler.apply(&mut session, turn, &CliEvent::InputRequest { questions: vec![] });
        assert!(effects.is_empty());
        assert!(session.messages.is_empty());
    }

    #[test]
    fn structured_rate_limit_is_delegated() {
        let (mut handler, mut session, turn) = setup();
        let effects = handler.apply(
            &mut session,
            turn,
            &CliEvent::Error(ErrorEvent {
                subtype: Some("rate_limit".into()),
                message: "slow down".into(),
                retry_after_secs: Some(30),
            }),
        );
        assert_eq!(
            effects,
            vec![TurnEffect::RateLimited {
                message: "slow down".into(),
                retry_after: Some(Duration::from_secs(30)),
            }]
        );
    }

    #[test]
    fn free_text_rate_limit_is_delegated() {
        let (mut handler, mut session, turn) = setup();
        let effects = handler.apply(
            &mut session,
            turn,
            &CliEvent::Error(ErrorEvent {
                subtype: None,
                message: "429 too many requests, retry in 2 minutes".into(),
                retry_after_secs: None,
            }),
        );
        assert!(matches!(
            effects.as_slice(),
            [TurnEffect::RateLimited {
                retry_after: Some(d),
                ..
            }] if *d == Duration::from_secs(120)
        ));
    }

    #[test]
    fn plain_error_fails_the_turn() {
        let (mut handler, mut session, turn) = setup();
        let effects = handler.apply(
            &mut session,
            turn,
            &CliEvent::Error(ErrorEvent {
                subtype: None,
                message: "process unreachable".into(),
                retry_after_secs: None,
            }),
        );
        assert_eq!(effects, vec![TurnEffect::Failed("process unreachable".into())]);
        assert!(session.last_message().unwrap().is_error);
    }

    #[test]
    fn result_event_completes_with_usage() {
        let (mut handler, mut session, turn) = setup();
        handler.apply(&mut session, turn, &CliEvent::Text { text: "answer".into() });
        let effects = handler.apply(
            &mut session,
            turn,
            &CliEvent::Result(ResultEvent {
                cost_usd: Some(0.03),
                num_turns: Some(2),
                ..Default::default()
            }),
        );
        assert!(matches!(
            effects.last(),
            Some(TurnEffect::Completed { usage, is_error: false }) if usage.cost_usd == Some(0.03)
        ));
    }

    #[test]
    fn stale_turn_events_are_dropped() {
        let (mut handler, mut session, old_turn) = setup();
        handler.cancel_turn(session.id);
        let effects = handler.apply(&mut session, old_turn, &CliEvent::Text { text: "late".into() });
        assert!(effects.is_empty());
        assert!(session.messages.is_empty());

        // A new turn's id also shields against the old turn's events.
        let _new_turn = handler.begin_turn(session.id);
        let effects = handler.apply(&mut session, old_turn, &CliEvent::Text { text: "late".into() });
        assert!(effects.is_empty());
        assert!(session.messages.is_empty());
    }

    #[test]
    fn assistant_value_text_blocks_extracted() {
        let (mut handler, mut session, turn) = setup();
        handler.apply(
            &mut session,
            turn,
            &CliEvent::Assistant {
                message: serde_json::json!({
                    "content": [
                        {"type": "text", "text": "part one"},
                        {"type": "tool_use", "id": "x"},
                        {"type": "text", "text": "part two"}
                    ]
                }),
            },
        );
        assert_eq!(session.last_message().unwrap().content, "part one\npart two");
    }
}
