//! Classification of inbound session traffic
//!
//! Pure view over an [`Envelope`]; never mutates and tolerates missing
//! nested fields (absent chunk text classifies as an empty string).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::Envelope;

/// Status of an agent tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    /// Tool call announced or still running
    Pending,
    /// Tool call finished successfully
    Completed,
    /// Tool call finished with an error
    Failed,
}

impl ToolStatus {
    /// Parse a wire status string, defaulting unknown values to pending
    pub fn parse(value: &str) -> Self {
        match value {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// Whether the status ends the tool call's lifetime
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One classified inbound protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A chunk of agent response text
    Text { text: String },
    /// A chunk of agent reasoning; ephemeral, never stored
    Thought { text: String },
    /// A tool call started
    ToolCall {
        id: String,
        title: String,
        status: ToolStatus,
    },
    /// An update to a previously announced tool call
    ToolUpdate {
        id: String,
        status: Option<ToolStatus>,
        content: Option<Value>,
    },
    /// The remote wants an operator decision before running a tool
    PermissionRequest { params: Value },
    /// Anything else; dropped by consumers
    Unknown,
}

/// Classify an inbound envelope into a [`SessionEvent`].
pub fn classify(envelope: &Envelope) -> SessionEvent {
    match envelope.method.as_deref() {
        Some("session/update") => classify_update(envelope.params.as_ref()),
        Some("request_permission") => SessionEvent::PermissionRequest {
            params: envelope.params.clone().unwrap_or(Value::Null),
        },
        _ => SessionEvent::Unknown,
    }
}

fn classify_update(params: Option<&Value>) -> SessionEvent {
    let update = match params.and_then(|p| p.get("update")) {
        Some(update) => update,
        None => return SessionEvent::Unknown,
    };

    match update.get("sessionUpdate").and_then(Value::as_str) {
        Some("agent_message_chunk") => SessionEvent::Text {
            text: chunk_text(update),
        },
        Some("agent_thought_chunk") => SessionEvent::Thought {
            text: chunk_text(update),
        },
        Some("tool_call") => SessionEvent::ToolCall {
            id: str_field(update, "id"),
            title: str_field(update, "title"),
            status: ToolStatus::parse(
                update
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("pending"),
            ),
        },
        Some("tool_call_update") => {
            // Updated fields ride under `fields`; some agents flatten them
            // onto the update itself.
            let fields = update.get("fields").unwrap_or(update);
            SessionEvent::ToolUpdate {
                id: str_field(update, "id"),
                status: fields
                    .get("status")
                    .and_then(Value::as_str)
                    .map(ToolStatus::parse),
                content: fields.get("content").cloned(),
            }
        }
        _ => SessionEvent::Unknown,
    }
}

fn chunk_text(update: &Value) -> String {
    update
        .get("content")
        .and_then(|c| c.get("text"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
