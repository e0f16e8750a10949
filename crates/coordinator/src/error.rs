//! Error types for the coordinator

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Errors that can occur while orchestrating workstreams
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// No workstream with the given id
    #[error("Workstream not found: {id}")]
    WorkstreamNotFound { id: Uuid },

    /// `respond_to_permission` without a pending request
    #[error("no pending permission request")]
    NoPendingPermission,

    /// Prompts cannot be dispatched to a paused workstream
    #[error("Workstream {id} is paused")]
    WorkstreamPaused { id: Uuid },

    /// Transport-level failure
    #[error("Transport error: {0}")]
    Client(#[from] acp_client::ClientError),

    /// `initialize` or `session/new` did not produce a usable session
    #[error("Handshake failed: {message}")]
    HandshakeFailed { message: String },
}

impl CoordinatorError {
    /// Create a HandshakeFailed error
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::HandshakeFailed {
            message: message.into(),
        }
    }
}
