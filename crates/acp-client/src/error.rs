//! Error types for the transport client

use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur on the agent transport
#[derive(Debug, Error)]
pub enum ClientError {
    /// Operation requires an established session
    #[error("not connected")]
    NotConnected,

    /// HTTP-level failure (non-2xx response)
    #[error("HTTP request failed: {status}")]
    Http { status: String },

    /// Network failure
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Malformed payload
    #[error("Failed to parse envelope: {0}")]
    Parse(#[from] serde_json::Error),

    /// The remote answered a request with an error envelope
    #[error("Remote error: {message}")]
    Rpc { message: String },
}

impl ClientError {
    /// Create an Http error from a status code
    pub fn http(status: reqwest::StatusCode) -> Self {
        Self::Http {
            status: status.to_string(),
        }
    }

    /// Create an Rpc error
    pub fn rpc(message: impl Into<String>) -> Self {
        Self::Rpc {
            message: message.into(),
        }
    }
}
