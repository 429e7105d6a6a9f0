use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One unit of streamed task output. Events for a job form a totally ordered
/// append-only sequence; the session log is the source of truth for the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    /// Emitting source: a provider name, `user`, or `system`.
    pub source: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Thinking {
        text: String,
    },
    Text {
        text: String,
    },
    ToolCall {
        tool_call_id: String,
        tool: String,
        arguments: Value,
    },
    ToolResult {
        tool_call_id: String,
        tool: String,
        output: String,
        #[serde(default)]
        is_error: bool,
    },
    Error {
        message: String,
        #[serde(default)]
        is_auth_error: bool,
        #[serde(default)]
        is_quota_error: bool,
        #[serde(default)]
        is_circuit_open: bool,
    },
    Done {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_cost_usd: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        num_turns: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_tokens: Option<u64>,
    },
    Steering {
        message: String,
        author: String,
        channel: String,
    },
}

impl Event {
    pub fn now(source: impl Into<String>, kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            source: source.into(),
            kind,
        }
    }

    pub fn text(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self::now(source, EventKind::Text { text: text.into() })
    }

    pub fn error(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::now(
            source,
            EventKind::Error {
                message: message.into(),
                is_auth_error: false,
                is_quota_error: false,
                is_circuit_open: false,
            },
        )
    }

    pub fn done(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self::now(
            source,
            EventKind::Done {
                text: text.into(),
                total_cost_usd: None,
                num_turns: None,
                total_tokens: None,
            },
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Done { .. } | EventKind::Error { .. })
    }

    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            EventKind::Thinking { .. } => "thinking",
            EventKind::Text { .. } => "text",
            EventKind::ToolCall { .. } => "tool_call",
            EventKind::ToolResult { .. } => "tool_result",
            EventKind::Error { .. } => "error",
            EventKind::Done { .. } => "done",
            EventKind::Steering { .. } => "steering",
        }
    }
}
