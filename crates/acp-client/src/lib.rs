//! Bidirectional JSON-RPC client for remote agent sessions
//!
//! The transport is an HTTP + server-sent-events framing of a JSON-RPC-like
//! envelope: the remote pushes requests and notifications over an SSE
//! stream, and the client posts its own requests, notifications, and
//! responses back over HTTP.

mod client;
mod envelope;
mod error;
mod session;

pub use client::AcpClient;
pub use envelope::{Envelope, EnvelopeError, HANDLER_ERROR_CODE};
pub use error::{ClientError, Result};
pub use session::{classify, SessionEvent, ToolStatus};
