//! Workstream coordinator for parallel agent sessions
//!
//! The coordinator multiplexes many concurrent agent sessions over a
//! bidirectional request/response + notification protocol, correlates
//! server-initiated permission prompts with operator decisions, drives each
//! workstream through its lifecycle state machine, provisions isolated
//! working copies, and fans streaming updates out to observers in order.

mod coordinator;
mod error;
mod event;
mod model;

pub use coordinator::{Coordinator, CoordinatorConfig, ObserverHandle};
pub use error::{CoordinatorError, Result};
pub use event::WorkstreamEvent;
pub use model::{
    sanitize_name, ConversationMessage, MessageRole, Notification, NotificationKind,
    PendingPermission, PermissionOption, ToolCall, Workstream, WorkstreamState,
};
