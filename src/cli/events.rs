//! Event types from the assistant CLI stream-json output.
//!
//! One ordered stream of these events is emitted per session as the
//! assistant turn progresses.

use serde::{Deserialize, Serialize};

/// System initialization event data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInit {
    /// Event subtype (e.g., "init").
    #[serde(default)]
    pub subtype: Option<String>,
    /// CLI-assigned session identifier, usable as a resume token.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Current working directory.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Model serving this session.
    #[serde(default)]
    pub model: Option<String>,
    /// Available tools for this session.
    #[serde(default)]
    pub tools: Vec<String>,
}

/// Tool use request data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseEvent {
    /// Unique identifier for this tool use.
    pub id: String,
    /// Name of the tool being invoked.
    pub name: String,
    /// Tool input parameters.
    pub input: serde_json::Value,
}

/// Tool execution result data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultEvent {
    /// Identifier matching the original tool use.
    pub tool_use_id: String,
    /// Result content from tool execution.
    #[serde(default)]
    pub content: String,
    /// Whether the tool reported an error.
    #[serde(default)]
    pub is_error: bool,
}

/// One question carried by an `input_request` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionEvent {
    /// Question text.
    pub text: String,
    /// Optional header above the question.
    #[serde(default)]
    pub header: Option<String>,
    /// Ordered answer options.
    #[serde(default)]
    pub options: Vec<String>,
    /// Whether multiple options may be selected.
    #[serde(default)]
    pub multi_select: bool,
}

/// Content delta types for streaming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    /// Text content delta.
    TextDelta {
        /// The text fragment.
        text: String,
    },
    /// JSON input delta (for tool inputs).
    InputJsonDelta {
        /// Partial JSON string.
        partial_json: String,
    },
    /// Catch-all for unknown delta types.
    #[serde(other)]
    Unknown,
}

/// Error event data. Rate-limit-flavored errors are redirected to the
/// rate limit manager instead of terminating the turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Error subtype (e.g., "rate_limit").
    #[serde(default)]
    pub subtype: Option<String>,
    /// Human-readable error message.
    #[serde(default)]
    pub message: String,
    /// Structured retry-after hint in seconds, when provided.
    #[serde(default)]
    pub retry_after_secs: Option<u64>,
}

impl ErrorEvent {
    /// Whether the CLI tagged this error as a rate limit.
    #[must_use]
    pub fn is_rate_limit(&self) -> bool {
        self.subtype.as_deref() == Some("rate_limit")
    }
}

/// Final result event data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultEvent {
    /// Result subtype (e.g., "success", "error").
    #[serde(default)]
    pub subtype: Option<String>,
    /// Session identifier.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Final result text, if any.
    #[serde(default)]
    pub result: Option<String>,
    /// Whether an error occurred.
    #[serde(default)]
    pub is_error: bool,
    /// Total cost in USD.
    #[serde(default)]
    pub cost_usd: Option<f64>,
    /// Total duration in milliseconds.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Number of conversation turns.
    #[serde(default)]
    pub num_turns: Option<u32>,
}

/// Events emitted by the CLI in stream-json format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CliEvent {
    /// System initialization event.
    System(SystemInit),
    /// Assistant message event (flexible nested structure).
    Assistant {
        /// Message content as emitted by the CLI.
        message: serde_json::Value,
    },
    /// Discrete text chunk.
    Text {
        /// The chunk content.
        text: String,
    },
    /// Streaming content delta.
    ContentBlockDelta {
        /// Block index.
        #[serde(default)]
        index: usize,
        /// Delta content.
        delta: ContentDelta,
    },
    /// Tool use request.
    ToolUse(ToolUseEvent),
    /// Tool execution result.
    ToolResult(ToolResultEvent),
    /// Direct ask-user form: the assistant needs a choice to continue.
    InputRequest {
        /// Questions to present.
        #[serde(default)]
        questions: Vec<QuestionEvent>,
    },
    /// Channel or CLI-reported error.
    Error(ErrorEvent),
    /// Final result event, terminal for the turn.
    Result(ResultEvent),
    /// Catch-all for unknown event types.
    #[serde(other)]
    Unknown,
}

impl CliEvent {
    /// Returns true if this is a terminal event for the turn.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result(_))
    }

    /// Returns the resume token if this event carries one.
    #[must_use]
    pub fn resume_token(&self) -> Option<&str> {
        match self {
            Self::System(init) => init.session_id.as_deref(),
            Self::Result(result) => result.session_id.as_deref(),
            _ => None,
        }
    }

    /// Returns the tool name if this is a `ToolUse` event.
    #[must_use]
    pub fn tool_name(&self) -> Option<&str> {
        match self {
            Self::ToolUse(tool_use) => Some(&tool_use.name),
            _ => None,
        }
    }
}
