//! Core data model for conversation sessions.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::QueuedContext;
use crate::session::MessageQueue;

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// Status of a tool invocation within a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    #[default]
    Running,
    Completed,
    Error,
}

/// One tool invocation recorded in arrival order within a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolAction {
    /// CLI-assigned tool use identifier.
    pub id: String,
    /// Name of the tool being invoked.
    pub name: String,
    /// Current status.
    pub status: ToolStatus,
    /// Tool input parameters.
    pub input: serde_json::Value,
    /// Output content once the matching result arrives.
    pub output: Option<String>,
}

impl ToolAction {
    /// Create a running action from a tool invocation event.
    #[must_use]
    pub fn running(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: ToolStatus::Running,
            input,
            output: None,
        }
    }

    /// Close this action with the matching result.
    pub fn close(&mut self, output: impl Into<String>, is_error: bool) {
        self.status = if is_error {
            ToolStatus::Error
        } else {
            ToolStatus::Completed
        };
        self.output = Some(output.into());
    }
}

/// One question inside an ask-user request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    /// Question text shown to the user.
    pub text: String,
    /// Optional header above the question.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    /// Ordered answer options.
    pub options: Vec<String>,
    /// Whether multiple options may be selected.
    #[serde(default)]
    pub multi_select: bool,
}

/// An interactive pause waiting for a human (or auto-accept) decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskUserRequest {
    /// Request identifier.
    pub id: Uuid,
    /// Questions to answer, in order.
    pub questions: Vec<Question>,
    /// Set when the auto-accept policy answered this request.
    #[serde(default)]
    pub auto_accepted: bool,
}

impl AskUserRequest {
    /// Build a request from parsed questions.
    #[must_use]
    pub fn new(questions: Vec<Question>) -> Self {
        Self {
            id: Uuid::new_v4(),
            questions,
            auto_accepted: false,
        }
    }

    /// First option of the first question, used by the auto-accept policy.
    #[must_use]
    pub fn first_option(&self) -> Option<&str> {
        self.questions
            .first()
            .and_then(|q| q.options.first())
            .map(String::as_str)
    }
}

/// Usage and cost statistics for a completed turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    /// Total cost in USD, when the CLI reports it.
    pub cost_usd: Option<f64>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: Option<u64>,
    /// Number of API turns consumed.
    pub num_turns: Option<u32>,
}

/// Kind of change made to a file during a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// Before/after record for one file touched by the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    /// Absolute path of the file.
    pub path: PathBuf,
    /// Short display name (file name component).
    pub display_name: String,
    /// Derived change kind.
    pub kind: ChangeKind,
    /// Approximate added line count (display only).
    pub added_lines: usize,
    /// Approximate removed line count (display only).
    pub removed_lines: usize,
    /// Content before the edit (empty for created files).
    pub original: String,
    /// Content after the edit (empty for deleted files).
    pub modified: String,
}

/// Aggregated file changes attached to the assistant message of a turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileChangesSummary {
    /// Files created this turn.
    pub created: usize,
    /// Files modified this turn.
    pub modified: usize,
    /// Files deleted this turn.
    pub deleted: usize,
    /// Per-file changes.
    pub changes: Vec<FileChange>,
}

impl FileChangesSummary {
    /// Build a summary from a list of changes.
    #[must_use]
    pub fn from_changes(changes: Vec<FileChange>) -> Self {
        let mut summary = Self {
            changes,
            ..Self::default()
        };
        for change in &summary.changes {
            match change.kind {
                ChangeKind::Created => summary.created += 1,
                ChangeKind::Modified => summary.modified += 1,
                ChangeKind::Deleted => summary.deleted += 1,
            }
        }
        summary
    }

    /// True when no files changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// One conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message identifier.
    pub id: Uuid,
    /// Author role.
    pub role: Role,
    /// Text content. Mutable while streaming, fixed once sealed.
    pub content: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// True while the assistant turn is still producing events.
    #[serde(default)]
    pub is_streaming: bool,
    /// Tool invocations recorded during this turn, in arrival order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_actions: Vec<ToolAction>,
    /// Pending interactive question, cleared once answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask_user: Option<AskUserRequest>,
    /// File changes produced by this turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_changes: Option<FileChangesSummary>,
    /// Usage stats from the terminal result event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageStats>,
    /// Set when the turn ended in an error.
    #[serde(default)]
    pub is_error: bool,
}

impl Message {
    /// Create a finalized user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            is_streaming: false,
            tool_actions: Vec::new(),
            ask_user: None,
            file_changes: None,
            usage: None,
            is_error: false,
        }
    }

    /// Create an empty streaming assistant message for a new turn.
    #[must_use]
    pub fn assistant_streaming() -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::Assistant,
            content: String::new(),
            timestamp: Utc::now(),
            is_streaming: true,
            tool_actions: Vec::new(),
            ask_user: None,
            file_changes: None,
            usage: None,
            is_error: false,
        }
    }

    /// Append a discrete text chunk, newline-joined with existing content.
    pub fn append_chunk(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if !self.content.is_empty() {
            self.content.push('\n');
        }
        self.content.push_str(text);
    }

    /// Append a raw streaming delta without separator.
    pub fn append_delta(&mut self, text: &str) {
        self.content.push_str(text);
    }

    /// Seal the message at turn completion.
    pub fn seal(&mut self) {
        self.is_streaming = false;
        // A sealed turn must not leave any action dangling.
        for action in &mut self.tool_actions {
            if action.status == ToolStatus::Running {
                action.status = ToolStatus::Error;
            }
        }
    }

    /// The currently open tool action, if any.
    pub fn open_tool_action(&mut self) -> Option<&mut ToolAction> {
        self.tool_actions
            .iter_mut()
            .rev()
            .find(|a| a.status == ToolStatus::Running)
    }
}

/// Options attached to an outgoing prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptOptions {
    /// Model selection passed to the CLI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Working directory for the CLI process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// System prompt override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Maximum number of agent turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    /// Tools the CLI is allowed to use.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    /// Tools the CLI must not use.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disallowed_tools: Vec<String>,
    /// Resume token continuing a previous CLI run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<String>,
}

/// A message waiting in a session's queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Queue entry identifier.
    pub id: Uuid,
    /// Message content to send once the session is free.
    pub content: String,
    /// Prompt options captured at enqueue time.
    #[serde(default)]
    pub options: PromptOptions,
    /// Editor context to fold into the prompt when the entry is dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<QueuedContext>,
    /// When the entry was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedMessage {
    /// Create a queue entry.
    #[must_use]
    pub fn new(content: impl Into<String>, options: PromptOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            options,
            context: None,
            enqueued_at: Utc::now(),
        }
    }

    /// Attach editor context to the entry.
    #[must_use]
    pub fn with_context(mut self, context: QueuedContext) -> Self {
        self.context = Some(context);
        self
    }
}

/// One independent conversation thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier.
    pub id: Uuid,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Optional user-visible title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Ordered message history.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Pending messages waiting for the session to go idle.
    #[serde(default, skip)]
    pub queue: MessageQueue,
    /// CLI resume token for continuing the last turn's context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
}

impl Session {
    /// Create an empty session.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            title: None,
            messages: Vec::new(),
            queue: MessageQueue::default(),
            resume_token: None,
        }
    }

    /// Find a message by id.
    pub fn message_mut(&mut self, id: Uuid) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// The most recent message, if any.
    #[must_use]
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_chunk_joins_with_newline() {
        let mut msg = Message::assistant_streaming();
        msg.append_chunk("first");
        msg.append_chunk("second");
        assert_eq!(msg.content, "first\nsecond");
    }

    #[test]
    fn append_delta_concatenates_raw() {
        let mut msg = Message::assistant_streaming();
        msg.append_delta("Hel");
        msg.append_delta("lo");
        assert_eq!(msg.content, "Hello");
    }

    #[test]
    fn seal_closes_dangling_tool_actions() {
        let mut msg = Message::assistant_streaming();
        msg.tool_actions
            .push(ToolAction::running("t1", "Edit", serde_json::json!({})));
        msg.seal();
        assert!(!msg.is_streaming);
        assert_eq!(msg.tool_actions[0].status, ToolStatus::Error);
    }

    #[test]
    fn ask_user_first_option() {
        let req = AskUserRequest::new(vec![Question {
            text: "Pick one".to_string(),
            header: None,
            options: vec!["A".to_string(), "B".to_string()],
            multi_select: false,
        }]);
        assert_eq!(req.first_option(), Some("A"));
    }

    #[test]
    fn summary_counts_kinds() {
        let change = |kind| FileChange {
            path: PathBuf::from("/tmp/x"),
            display_name: "x".to_string(),
            kind,
            added_lines: 0,
            removed_lines: 0,
            original: String::new(),
            modified: String::new(),
        };
        let summary = FileChangesSummary::from_changes(vec![
            change(ChangeKind::Created),
            change(ChangeKind::Modified),
            change(ChangeKind::Modified),
        ]);
        assert_eq!(summary.created, 1);
        assert_eq!(summary.modified, 2);
        assert_eq!(summary.deleted, 0);
    }
}
