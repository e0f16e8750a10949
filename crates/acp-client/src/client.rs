//! Transport client for one remote agent session
//!
//! Opens a session against the remote, pumps the inbound SSE stream, sends
//! outbound requests and notifications, matches responses to callers, and
//! dispatches peer-initiated requests to registered handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::envelope::{Envelope, HANDLER_ERROR_CODE};
use crate::error::{ClientError, Result};

type MessageHandler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(String) + Send + Sync>;
type RequestHandler = Arc<
    dyn Fn(Value, Value) -> BoxFuture<'static, std::result::Result<Value, String>> + Send + Sync,
>;

struct Inner {
    http: reqwest::Client,
    base_url: String,
    session_id: RwLock<Option<String>>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
    request_handlers: RwLock<HashMap<String, RequestHandler>>,
    message_handlers: RwLock<Vec<MessageHandler>>,
    error_handlers: RwLock<Vec<ErrorHandler>>,
    abort_tx: Mutex<Option<oneshot::Sender<()>>>,
}

/// Client for a bidirectional JSON-RPC session carried on HTTP + SSE
#[derive(Clone)]
pub struct AcpClient {
    inner: Arc<Inner>,
}

impl AcpClient {
    /// Create a client against the given base URL (no connection yet)
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            inner: Arc::new(Inner {
                http: reqwest::Client::new(),
                base_url,
                session_id: RwLock::new(None),
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                request_handlers: RwLock::new(HashMap::new()),
                message_handlers: RwLock::new(Vec::new()),
                error_handlers: RwLock::new(Vec::new()),
                abort_tx: Mutex::new(None),
            }),
        }
    }

    /// Register a handler for inbound envelopes that are neither responses
    /// nor requests with a dedicated handler. Handlers run in registration
    /// order and are awaited one at a time, so per-envelope processing is
    /// applied atomically.
    pub async fn on_message<F, Fut>(&self, handler: F)
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(move |envelope| Box::pin(handler(envelope)));
        self.inner.message_handlers.write().await.push(handler);
    }

    /// Register a handler for transport-level failures
    pub async fn on_error<F>(&self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.inner.error_handlers.write().await.push(Arc::new(handler));
    }

    /// Register a handler for peer-initiated requests of `method`. The
    /// handler receives the peer's request id and the request params.
    ///
    /// The handler's returned future may stay pending indefinitely (a
    /// permission prompt waiting for the operator); the response envelope is
    /// posted back to the remote once it settles.
    pub async fn register_request_handler<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<Value, String>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |id, params| Box::pin(handler(id, params)));
        self.inner
            .request_handlers
            .write()
            .await
            .insert(method.into(), handler);
    }

    /// Open a session against the remote and start the inbound event pump.
    ///
    /// Returns the transport session id issued by the remote.
    pub async fn connect(&self) -> Result<String> {
        let response = self
            .inner
            .http
            .post(format!("{}/acp/session", self.inner.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ClientError::http(response.status()));
        }

        let body: Value = response.json().await?;
        let session_id = body
            .get("session_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::rpc("session response missing session_id"))?
            .to_string();

        let stream_response = self
            .inner
            .http
            .get(format!(
                "{}/acp/session/{}/stream",
                self.inner.base_url, session_id
            ))
            .header("Accept", "text/event-stream")
            .send()
            .await?;
        if !stream_response.status().is_success() {
            return Err(ClientError::http(stream_response.status()));
        }

        *self.inner.session_id.write().await = Some(session_id.clone());

        let (abort_tx, abort_rx) = oneshot::channel();
        *self.inner.abort_tx.lock().await = Some(abort_tx);

        let inner = Arc::clone(&self.inner);
        let stream = stream_response.bytes_stream();
        tokio::spawn(pump(inner, stream, abort_rx));

        info!(session_id = %session_id, "Connected to agent transport");
        Ok(session_id)
    }

    /// Send a request and wait for the matching response.
    pub async fn send_request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        let envelope = Envelope::request(id, method, params);
        if let Err(e) = post_envelope(&self.inner, &envelope).await {
            self.inner.pending.lock().await.remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(outcome) => outcome,
            // Resolver dropped without an answer: the session was torn down.
            Err(_) => Err(ClientError::NotConnected),
        }
    }

    /// Send a notification (no response expected).
    pub async fn send_notification(&self, method: &str, params: Value) -> Result<()> {
        post_envelope(&self.inner, &Envelope::notification(method, params)).await
    }

    /// Close the event stream. Pending calls are abandoned; they fail with
    /// `not connected` rather than being answered.
    pub async fn disconnect(&self) {
        if let Some(abort) = self.inner.abort_tx.lock().await.take() {
            let _ = abort.send(());
        }
        *self.inner.session_id.write().await = None;
        self.inner.pending.lock().await.clear();
        info!("Disconnected from agent transport");
    }
}

async fn post_envelope(inner: &Arc<Inner>, envelope: &Envelope) -> Result<()> {
    let session_id = inner
        .session_id
        .read()
        .await
        .clone()
        .ok_or(ClientError::NotConnected)?;

    let response = inner
        .http
        .post(format!(
            "{}/acp/session/{}/message",
            inner.base_url, session_id
        ))
        .json(envelope)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(ClientError::http(response.status()));
    }
    Ok(())
}

async fn notify_error(inner: &Arc<Inner>, message: String) {
    warn!("Transport error: {}", message);
    let handlers: Vec<ErrorHandler> = inner.error_handlers.read().await.clone();
    for handler in handlers {
        handler(message.clone());
    }
}

/// Inbound event pump: frames `data:` lines off the SSE stream and routes
/// each envelope. Runs until the stream ends, fails, or the client aborts it.
async fn pump<S>(inner: Arc<Inner>, stream: S, mut abort_rx: oneshot::Receiver<()>)
where
    S: Stream<Item = reqwest::Result<bytes::Bytes>>,
{
    let mut stream = Box::pin(stream);
    let mut buffer = String::new();

    loop {
        tokio::select! {
            _ = &mut abort_rx => {
                debug!("Event pump aborted");
                break;
            }
            chunk = stream.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(pos) = buffer.find('\n') {
                            let line = buffer[..pos].trim_end_matches('\r').to_string();
                            buffer.drain(..=pos);
                            handle_line(&inner, &line).await;
                        }
                    }
                    Some(Err(e)) => {
                        notify_error(&inner, format!("Event stream error: {}", e)).await;
                        break;
                    }
                    None => {
                        notify_error(&inner, "event stream ended".to_string()).await;
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_line(inner: &Arc<Inner>, line: &str) {
    // Keep-alive comments and blank separators carry no envelope.
    let data = match line.strip_prefix("data:") {
        Some(data) => data.trim(),
        None => return,
    };
    if data.is_empty() {
        return;
    }

    match serde_json::from_str::<Envelope>(data) {
        Ok(envelope) => dispatch(inner, envelope).await,
        Err(e) => notify_error(inner, format!("Failed to parse envelope: {}", e)).await,
    }
}

async fn dispatch(inner: &Arc<Inner>, envelope: Envelope) {
    // A response to one of our requests: settle the pending call.
    if envelope.is_response() {
        if let Some(id) = envelope.id.as_ref().and_then(Value::as_u64) {
            if let Some(tx) = inner.pending.lock().await.remove(&id) {
                let outcome = match envelope.error {
                    Some(error) => Err(ClientError::rpc(error.message)),
                    None => Ok(envelope.result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
                return;
            }
        }
        warn!("Dropping response with unmatched id: {:?}", envelope.id);
        return;
    }

    // A peer-initiated request: answer it through the registered handler.
    if envelope.is_request() {
        let method = envelope.method.clone().unwrap_or_default();
        let handler = inner.request_handlers.read().await.get(&method).cloned();
        if let Some(handler) = handler {
            let id = envelope.id.clone().unwrap_or(Value::Null);
            let params = envelope.params.clone().unwrap_or(Value::Null);
            let inner = Arc::clone(inner);
            // The handler may block on an operator decision; answering must
            // not stall the pump.
            tokio::spawn(async move {
                let reply = match handler(id.clone(), params).await {
                    Ok(result) => Envelope::response(id, result),
                    Err(message) => Envelope::error_response(id, HANDLER_ERROR_CODE, message),
                };
                if let Err(e) = post_envelope(&inner, &reply).await {
                    notify_error(&inner, format!("Failed to answer peer request: {}", e)).await;
                }
            });
            return;
        }
    }

    // Notification, or a request nobody claims: hand to the message handlers.
    let handlers: Vec<MessageHandler> = inner.message_handlers.read().await.clone();
    for handler in handlers {
        handler(envelope.clone()).await;
    }
}
