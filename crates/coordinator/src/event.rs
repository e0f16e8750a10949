//! Observer events emitted by the coordinator
//!
//! Events are delivered synchronously, in the order their triggering inbound
//! messages were processed. Nothing is buffered: late subscribers pull state
//! through the coordinator's read APIs instead.

use serde::Serialize;
use serde_json::Value;

use acp_client::ToolStatus;

use crate::model::{ConversationMessage, Notification, ToolCall, WorkstreamState};

/// One coordinator event, always paired with the owning workstream's id
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkstreamEvent {
    /// Lifecycle state changed
    StateChanged { state: WorkstreamState },

    /// A message was appended to the conversation history. Agent chunks that
    /// coalesce into an existing message do not re-emit this.
    Message { message: ConversationMessage },

    /// The human-readable activity string changed
    Activity { activity: String },

    /// The agent started a tool call
    ToolCallStarted { tool: ToolCall },

    /// A tool call's status changed; terminal statuses also remove it from
    /// the active set
    ToolCallUpdated { id: String, status: ToolStatus },

    /// A notification was appended
    Notified { notification: Notification },

    /// The remote is blocked on an operator permission decision
    PermissionRequested { request_id: Value, params: Value },

    /// The workstream hit a transport or handshake failure
    Error { message: String },

    /// The workstream was stopped and its record removed
    Removed,
}
