//! Outgoing prompt assembly.
//!
//! Pure string building: conversation history tail, selected code, and
//! attachments folded into one prompt. No state is kept here.

use serde::{Deserialize, Serialize};

use crate::session::{Message, Role};

/// Maximum number of history messages included in an assembled prompt.
const MAX_HISTORY_MESSAGES: usize = 20;

/// A block of code the user selected in the editor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSelection {
    /// Path of the file the selection came from.
    pub file: String,
    /// The selected text.
    pub text: String,
    /// Language hint for fencing, when known.
    pub language: Option<String>,
}

/// An attachment included with the prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Display name.
    pub name: String,
    /// Attachment content.
    pub content: String,
}

/// Editor context captured when a message is sent or queued. Folded
/// into the outgoing prompt at dispatch time, not at enqueue time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedContext {
    /// Code selection active when the message was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<CodeSelection>,
    /// Files or notes attached to the message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl QueuedContext {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.selection.is_none() && self.attachments.is_empty()
    }

    /// Fold this context around the user's message.
    #[must_use]
    pub fn assemble(&self, user_message: &str) -> String {
        let mut builder = ContextBuilder::new();
        if let Some(selection) = &self.selection {
            builder = builder.with_selection(selection.clone());
        }
        for attachment in &self.attachments {
            builder = builder.with_attachment(attachment.clone());
        }
        builder.build(user_message)
    }
}

/// Builder assembling one outgoing prompt string.
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    history: Vec<(Role, String)>,
    selection: Option<CodeSelection>,
    attachments: Vec<Attachment>,
}

impl ContextBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Include the tail of the conversation history.
    #[must_use]
    pub fn with_history(mut self, messages: &[Message]) -> Self {
        self.history = messages
            .iter()
            .rev()
            .take(MAX_HISTORY_MESSAGES)
            .rev()
            .map(|m| (m.role, m.content.clone()))
            .collect();
        self
    }

    /// Include a code selection.
    #[must_use]
    pub fn with_selection(mut self, selection: CodeSelection) -> Self {
        self.selection = Some(selection);
        self
    }

    /// Include an attachment.
    #[must_use]
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Assemble the final prompt around the user's message.
    #[must_use]
    pub fn build(self, user_message: &str) -> String {
        let mut out = String::new();

        if !self.history.is_empty() {
            out.push_str("## Conversation so far\n\n");
            for (role, content) in &self.history {
                let label = match role {
                    Role::User => "User",
                    Role::Assistant => "Assistant",
                };
                if !content.is_empty() {
                    out.push_str(label);
                    out.push_str(": ");
                    out.push_str(content);
                    out.push('\n');
                }
            }
            out.push('\n');
        }

        if let Some(selection) = &self.selection {
            out.push_str("## Selected code (");
            out.push_str(&selection.file);
            out.push_str(")\n\n```");
            if let Some(lang) = &selection.language {
                out.push_str(lang);
            }
            out.push('\n');
            out.push_str(&selection.text);
            if !selection.text.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("```\n\n");
        }

        for attachment in &self.attachments {
            out.push_str("## Attachment: ");
            out.push_str(&attachment.name);
            out.push_str("\n\n");
            out.push_str(&attachment.content);
            out.push_str("\n\n");
        }

        out.push_str(user_message);
        out
    }
}
