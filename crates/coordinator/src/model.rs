//! Workstream model definitions

use std::path::PathBuf;

use acp_client::ToolStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Maximum length of a sanitized workstream name
const MAX_NAME_LEN: usize = 50;

/// Lifecycle state of a workstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkstreamState {
    /// Provisioning the working copy and connecting to the remote
    Starting,
    /// The agent session is live
    Running,
    /// Blocked on an operator permission decision
    Waiting,
    /// Operator is inspecting the workstream's changes
    Reviewing,
    /// Operator paused the workstream; prompts are refused
    Paused,
    /// Work finished; record kept until explicitly stopped
    Completed,
    /// Transport or handshake failure; record kept until explicitly stopped
    Error,
}

impl WorkstreamState {
    /// Check if the state is terminal (record retained, session gone)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Role of a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    Operator,
    Agent,
    System,
}

/// One entry in a workstream's conversation history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn operator(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Operator, content)
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Agent, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Kind of notification surfaced to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ActionRequired,
    ReviewReady,
    Error,
    Info,
}

/// A notification owned by a workstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    pub workstream_id: Uuid,
}

impl Notification {
    pub fn new(
        workstream_id: Uuid,
        kind: NotificationKind,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            title: title.into(),
            body: body.into(),
            timestamp: Utc::now(),
            read: false,
            workstream_id,
        }
    }
}

/// An in-flight agent tool call. Kept only while pending; terminal statuses
/// remove the entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub title: String,
    pub status: ToolStatus,
}

/// One option offered by a permission request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionOption {
    pub id: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
}

/// A permission request awaiting an operator decision
#[derive(Debug, Clone)]
pub struct PendingPermission {
    /// Request id assigned by the remote; echoed on the response envelope
    pub request_id: Value,
    /// Full request params, for UI rendering
    pub params: Value,
    /// Title of the tool asking for permission
    pub tool_title: String,
    /// Choices the operator can pick from
    pub options: Vec<PermissionOption>,
}

impl PendingPermission {
    /// Build from the raw request params, tolerating missing fields.
    pub fn from_params(request_id: Value, params: Value) -> Self {
        let tool_title = params
            .get("toolCallUpdate")
            .and_then(|u| u.get("fields"))
            .and_then(|f| f.get("title"))
            .or_else(|| params.get("toolCall").and_then(|t| t.get("title")))
            .and_then(Value::as_str)
            .unwrap_or("tool")
            .to_string();

        let options = params
            .get("options")
            .cloned()
            .map(|o| serde_json::from_value(o).unwrap_or_default())
            .unwrap_or_default();

        Self {
            request_id,
            params,
            tool_title,
            options,
        }
    }
}

/// Sanitize a workstream name: lower-case, `[a-z0-9-]` only, at most 50
/// characters. Anything else becomes `-`; an empty result becomes
/// `workstream`.
pub fn sanitize_name(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .take(MAX_NAME_LEN)
        .collect();

    if sanitized.is_empty() {
        "workstream".to_string()
    } else {
        sanitized
    }
}

/// An independent agent task with its own session, branch, and working copy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workstream {
    pub id: Uuid,
    pub name: String,
    pub task: String,
    pub state: WorkstreamState,
    pub worktree_path: Option<PathBuf>,
    pub branch_name: Option<String>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub activity: String,
    pub notifications: Vec<Notification>,
    pub message_history: Vec<ConversationMessage>,
}

impl Workstream {
    /// Create a workstream record in the `starting` state
    pub fn new(name: impl Into<String>, task: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            task: task.into(),
            state: WorkstreamState::Starting,
            worktree_path: None,
            branch_name: None,
            session_id: None,
            created_at: now,
            last_activity: now,
            activity: "Starting...".to_string(),
            notifications: Vec::new(),
            message_history: Vec::new(),
        }
    }

    /// Record activity now
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Append an agent text chunk, coalescing into the trailing agent
    /// message. Returns true when a new message was started.
    pub fn append_agent_text(&mut self, text: &str) -> bool {
        if let Some(last) = self.message_history.last_mut() {
            if last.role == MessageRole::Agent {
                last.content.push_str(text);
                return false;
            }
        }
        self.message_history
            .push(ConversationMessage::agent(text.to_string()));
        true
    }

    /// Append a notification and return a copy for event fan-out
    pub fn notify(
        &mut self,
        kind: NotificationKind,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Notification {
        let notification = Notification::new(self.id, kind, title, body);
        self.notifications.push(notification.clone());
        notification
    }
}
