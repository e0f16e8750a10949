//! In-process mock agent endpoint for coordinator tests.
//!
//! Serves the same three routes as the real agent and answers the handshake
//! automatically; tests drive everything else by pushing envelopes onto the
//! event stream.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Sse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

pub const SESSION_ID: &str = "agent-session-1";

pub struct MockAgent {
    events_tx: mpsc::Sender<String>,
    events_rx: Mutex<Option<mpsc::Receiver<String>>>,
    pub received: Mutex<Vec<Value>>,
}

impl MockAgent {
    /// Push one raw envelope to the connected client.
    pub async fn push(&self, envelope: Value) {
        self.events_tx
            .send(envelope.to_string())
            .await
            .expect("client stream closed");
    }

    /// Push a `session/update` notification with the given update payload.
    pub async fn push_update(&self, update: Value) {
        self.push(json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": { "update": update },
        }))
        .await;
    }

    /// Wait (up to 2s) for a posted envelope matching the predicate.
    pub async fn wait_for<F>(&self, predicate: F) -> Value
    where
        F: Fn(&Value) -> bool,
    {
        for _ in 0..200 {
            {
                let received = self.received.lock().await;
                if let Some(found) = received.iter().find(|v| predicate(v)) {
                    return found.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected envelope never arrived");
    }

    /// Recorded client requests for a method, in arrival order.
    pub async fn requests(&self, method: &str) -> Vec<Value> {
        self.received
            .lock()
            .await
            .iter()
            .filter(|v| v.get("method").and_then(Value::as_str) == Some(method))
            .cloned()
            .collect()
    }
}

async fn create_session(State(_state): State<Arc<MockAgent>>) -> Json<Value> {
    Json(json!({ "session_id": "mock-transport-session" }))
}

async fn receive_message(
    State(state): State<Arc<MockAgent>>,
    Path(_session_id): Path<String>,
    Json(envelope): Json<Value>,
) -> StatusCode {
    let method = envelope.get("method").and_then(Value::as_str);
    let id = envelope.get("id").cloned();

    // Handshake and prompt replies mirror the real agent's happy path.
    if let Some(id) = id {
        let result = match method {
            Some("initialize") => Some(json!({ "protocolVersion": "2025-01-01" })),
            Some("session/new") => Some(json!({ "sessionId": SESSION_ID })),
            Some("session/prompt") => Some(json!({ "stopReason": "end_turn" })),
            _ => None,
        };
        if let Some(result) = result {
            state
                .push(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
                .await;
        }
    }

    state.received.lock().await.push(envelope);
    StatusCode::ACCEPTED
}

async fn stream_events(
    State(state): State<Arc<MockAgent>>,
    Path(_session_id): Path<String>,
) -> Sse<impl futures::Stream<Item = Result<axum::response::sse::Event, Infallible>>> {
    let mut rx = state
        .events_rx
        .lock()
        .await
        .take()
        .expect("stream opened twice");
    let stream = async_stream::stream! {
        while let Some(msg) = rx.recv().await {
            yield Ok(axum::response::sse::Event::default().data(msg));
        }
    };
    Sse::new(stream)
}

/// Spawn the mock agent on an OS-assigned port; returns it with its base URL.
pub async fn spawn_mock_agent() -> (Arc<MockAgent>, String) {
    let (events_tx, events_rx) = mpsc::channel(64);
    let state = Arc::new(MockAgent {
        events_tx,
        events_rx: Mutex::new(Some(events_rx)),
        received: Mutex::new(Vec::new()),
    });

    let router = Router::new()
        .route("/acp/session", post(create_session))
        .route("/acp/session/{session_id}/message", post(receive_message))
        .route("/acp/session/{session_id}/stream", get(stream_events))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (state, format!("http://{}", addr))
}
