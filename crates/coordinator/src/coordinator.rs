//! Workstream coordinator
//!
//! Owns the workstream table, one transport client per workstream, the
//! lifecycle state machine, the pending-permission table, and the event
//! fan-out to observers. All mutation funnels through the shared state here;
//! per-workstream inbound events are applied sequentially by that
//! workstream's transport pump, which gives the per-session ordering
//! guarantee.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use acp_client::{classify, AcpClient, Envelope, SessionEvent, ToolStatus};
use git_worktree::WorktreeProvider;

use crate::error::{CoordinatorError, Result};
use crate::event::WorkstreamEvent;
use crate::model::{
    sanitize_name, ConversationMessage, Notification, NotificationKind, PendingPermission,
    ToolCall, Workstream, WorkstreamState,
};

/// Protocol version sent during the initialize handshake
const PROTOCOL_VERSION: &str = "2025-01-01";
/// Client name sent during the initialize handshake
const CLIENT_NAME: &str = "goose-swarm";
/// Activity shown while a prompt is in flight
const ACTIVITY_PROCESSING: &str = "Processing...";
/// Activity shown once a prompt returns and nothing else is going on
const ACTIVITY_IDLE: &str = "Idle - awaiting next instruction";
/// Activity strings are clipped to this many characters
const ACTIVITY_LIMIT: usize = 100;

type ObserverCallback = Arc<dyn Fn(Uuid, &WorkstreamEvent) + Send + Sync>;

/// Configuration inputs to the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Base URL of the remote agent endpoint
    pub server_base_url: String,
    /// Root of the source repository
    pub repo_path: PathBuf,
    /// Whether to isolate workstreams in dedicated worktrees
    pub use_worktrees: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            server_base_url: "http://127.0.0.1:3284".to_string(),
            repo_path: PathBuf::from("."),
            use_worktrees: true,
        }
    }
}

/// Handle returned by [`Coordinator::subscribe`]; pass it back to
/// [`Coordinator::unsubscribe`] to deregister the observer.
#[derive(Debug)]
#[must_use = "dropping the handle does not unsubscribe the observer"]
pub struct ObserverHandle(u64);

struct Shared {
    config: CoordinatorConfig,
    worktrees: Option<WorktreeProvider>,
    workstreams: RwLock<HashMap<Uuid, Workstream>>,
    clients: RwLock<HashMap<Uuid, AcpClient>>,
    active_tools: RwLock<HashMap<Uuid, HashMap<String, ToolCall>>>,
    pending_permissions: RwLock<HashMap<Uuid, PendingPermission>>,
    permission_resolvers: RwLock<HashMap<Uuid, oneshot::Sender<Value>>>,
    observers: RwLock<HashMap<u64, ObserverCallback>>,
    next_observer_id: AtomicU64,
}

/// Orchestrator for parallel agent workstreams
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    /// Create a coordinator. No connections are opened until a workstream is
    /// created.
    pub fn new(config: CoordinatorConfig) -> Self {
        let worktrees = config
            .use_worktrees
            .then(|| WorktreeProvider::new(&config.repo_path));

        Self {
            shared: Arc::new(Shared {
                config,
                worktrees,
                workstreams: RwLock::new(HashMap::new()),
                clients: RwLock::new(HashMap::new()),
                active_tools: RwLock::new(HashMap::new()),
                pending_permissions: RwLock::new(HashMap::new()),
                permission_resolvers: RwLock::new(HashMap::new()),
                observers: RwLock::new(HashMap::new()),
                next_observer_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register an observer callback. Callbacks run on the coordinator's
    /// executor and must not block; a UI layer should forward to its own
    /// event loop.
    pub async fn subscribe<F>(&self, callback: F) -> ObserverHandle
    where
        F: Fn(Uuid, &WorkstreamEvent) + Send + Sync + 'static,
    {
        let id = self.shared.next_observer_id.fetch_add(1, Ordering::SeqCst);
        self.shared
            .observers
            .write()
            .await
            .insert(id, Arc::new(callback));
        ObserverHandle(id)
    }

    /// Deregister an observer
    pub async fn unsubscribe(&self, handle: ObserverHandle) {
        self.shared.observers.write().await.remove(&handle.0);
    }

    /// Create a workstream: provision a working copy when possible, connect
    /// to the remote, and run the session handshake. Connect failures leave
    /// the record in the `error` state and are re-raised.
    pub async fn create_workstream(&self, name: &str, task: &str) -> Result<Workstream> {
        let mut workstream = Workstream::new(sanitize_name(name), task);
        let id = workstream.id;
        info!(workstream_id = %id, name = %workstream.name, "Creating workstream");

        let mut worktree_notification = None;
        if let Some(provider) = &self.shared.worktrees {
            if provider.is_available().await {
                match provider.create(&workstream.name, None).await {
                    Ok(info) => {
                        workstream.worktree_path = Some(info.path);
                        workstream.branch_name = Some(info.branch);
                    }
                    Err(e) => {
                        warn!(workstream_id = %id, "Worktree creation failed: {}", e);
                        worktree_notification = Some(workstream.notify(
                            NotificationKind::Error,
                            "Worktree creation failed",
                            format!("Continuing in the shared checkout: {}", e),
                        ));
                    }
                }
            } else {
                debug!("Repository is not managed; skipping worktree isolation");
            }
        }

        self.shared.workstreams.write().await.insert(id, workstream);
        if let Some(notification) = worktree_notification {
            self.shared
                .emit(id, &WorkstreamEvent::Notified { notification })
                .await;
        }

        if let Err(e) = self.shared.connect_workstream(id).await {
            self.shared.fail_workstream(id, e.to_string()).await;
            return Err(e);
        }

        self.get_workstream(id)
            .await
            .ok_or(CoordinatorError::WorkstreamNotFound { id })
    }

    /// Send an operator prompt to a workstream's session.
    pub async fn send_prompt(&self, id: Uuid, text: &str) -> Result<()> {
        self.shared.send_prompt(id, text).await
    }

    /// Kick off the workstream's task. When a working copy exists the task is
    /// prefixed with a framing paragraph announcing the worktree path and
    /// branch; otherwise the raw task is sent.
    pub async fn start_task(&self, id: Uuid) -> Result<()> {
        let prompt = {
            let workstreams = self.shared.workstreams.read().await;
            let workstream = workstreams
                .get(&id)
                .ok_or(CoordinatorError::WorkstreamNotFound { id })?;
            match (&workstream.worktree_path, &workstream.branch_name) {
                (Some(path), Some(branch)) => format!(
                    "You are working in a git worktree at: {}\n\
                     Your branch is: {}\n\
                     Make all changes inside this directory.\n\n{}",
                    path.display(),
                    branch,
                    workstream.task
                ),
                _ => workstream.task.clone(),
            }
        };
        self.shared.send_prompt(id, &prompt).await
    }

    /// Resolve the workstream's pending permission request with the chosen
    /// option. The transport answers the remote's original request with
    /// `{outcome: {selected: {optionId}}}`.
    pub async fn respond_to_permission(&self, id: Uuid, option_id: &str) -> Result<()> {
        let resolver = {
            let mut pendings = self.shared.pending_permissions.write().await;
            let mut resolvers = self.shared.permission_resolvers.write().await;
            let resolver = resolvers
                .remove(&id)
                .ok_or(CoordinatorError::NoPendingPermission)?;
            pendings.remove(&id);
            resolver
        };

        let _ = resolver.send(json!({
            "outcome": { "selected": { "optionId": option_id } }
        }));
        info!(workstream_id = %id, option_id, "Permission resolved");

        self.shared
            .set_state(id, WorkstreamState::Running, Some(ACTIVITY_PROCESSING))
            .await;
        Ok(())
    }

    /// Pause a running workstream. The transport stays open; new prompts are
    /// refused until resumed.
    pub async fn pause_workstream(&self, id: Uuid) -> Result<()> {
        self.shared
            .transition(id, WorkstreamState::Running, WorkstreamState::Paused)
            .await
    }

    /// Resume a paused workstream.
    pub async fn resume_workstream(&self, id: Uuid) -> Result<()> {
        self.shared
            .transition(id, WorkstreamState::Paused, WorkstreamState::Running)
            .await
    }

    /// Mark a workstream as ready for operator review.
    pub async fn mark_reviewing(&self, id: Uuid) -> Result<()> {
        {
            let mut workstreams = self.shared.workstreams.write().await;
            let workstream = workstreams
                .get_mut(&id)
                .ok_or(CoordinatorError::WorkstreamNotFound { id })?;
            workstream.state = WorkstreamState::Reviewing;
            workstream.touch();
            let notification = workstream.notify(
                NotificationKind::ReviewReady,
                "Ready for review",
                format!("{} has changes to review", workstream.name),
            );
            drop(workstreams);
            self.shared
                .emit(
                    id,
                    &WorkstreamEvent::StateChanged {
                        state: WorkstreamState::Reviewing,
                    },
                )
                .await;
            self.shared
                .emit(id, &WorkstreamEvent::Notified { notification })
                .await;
        }
        Ok(())
    }

    /// Mark a workstream as completed. The record is kept until the operator
    /// stops it.
    pub async fn mark_completed(&self, id: Uuid) -> Result<()> {
        {
            let mut workstreams = self.shared.workstreams.write().await;
            let workstream = workstreams
                .get_mut(&id)
                .ok_or(CoordinatorError::WorkstreamNotFound { id })?;
            workstream.state = WorkstreamState::Completed;
            workstream.activity = "Completed".to_string();
            workstream.touch();
        }
        self.shared
            .emit(
                id,
                &WorkstreamEvent::StateChanged {
                    state: WorkstreamState::Completed,
                },
            )
            .await;
        Ok(())
    }

    /// Stop a workstream: disconnect the transport, optionally reclaim its
    /// working copy, and drop the record. Calling this twice is a no-op.
    pub async fn stop_workstream(&self, id: Uuid, cleanup: bool) -> Result<()> {
        let workstream = match self.shared.workstreams.write().await.remove(&id) {
            Some(workstream) => workstream,
            None => return Ok(()),
        };
        info!(workstream_id = %id, name = %workstream.name, "Stopping workstream");

        if let Some(client) = self.shared.clients.write().await.remove(&id) {
            client.disconnect().await;
        }
        self.shared.active_tools.write().await.remove(&id);
        self.shared.pending_permissions.write().await.remove(&id);
        // Dropping the resolver abandons any blocked permission handler.
        self.shared.permission_resolvers.write().await.remove(&id);

        if cleanup && workstream.worktree_path.is_some() {
            if let Some(provider) = &self.shared.worktrees {
                if let Err(e) = provider.remove(&workstream.name).await {
                    warn!(workstream_id = %id, "Worktree cleanup failed: {}", e);
                }
            }
        }

        self.shared.emit(id, &WorkstreamEvent::Removed).await;
        Ok(())
    }

    /// Fetch one workstream by id.
    pub async fn get_workstream(&self, id: Uuid) -> Option<Workstream> {
        self.shared.workstreams.read().await.get(&id).cloned()
    }

    /// All workstreams, in creation order.
    pub async fn get_all_workstreams(&self) -> Vec<Workstream> {
        let mut all: Vec<Workstream> = self
            .shared
            .workstreams
            .read()
            .await
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    /// Tool calls currently pending for a workstream.
    pub async fn get_active_tools(&self, id: Uuid) -> Vec<ToolCall> {
        let tools = self.shared.active_tools.read().await;
        let mut active: Vec<ToolCall> = tools
            .get(&id)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }

    /// Unread notifications across all workstreams, oldest first.
    pub async fn get_unread_notifications(&self) -> Vec<Notification> {
        let workstreams = self.shared.workstreams.read().await;
        let mut unread: Vec<Notification> = workstreams
            .values()
            .flat_map(|w| w.notifications.iter().filter(|n| !n.read).cloned())
            .collect();
        unread.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        unread
    }

    /// Mark all of a workstream's notifications as read.
    pub async fn mark_notifications_read(&self, id: Uuid) -> Result<()> {
        let mut workstreams = self.shared.workstreams.write().await;
        let workstream = workstreams
            .get_mut(&id)
            .ok_or(CoordinatorError::WorkstreamNotFound { id })?;
        for notification in &mut workstream.notifications {
            notification.read = true;
        }
        Ok(())
    }

    /// The workstream's pending permission request, if any.
    pub async fn get_pending_permission(&self, id: Uuid) -> Option<PendingPermission> {
        self.shared
            .pending_permissions
            .read()
            .await
            .get(&id)
            .cloned()
    }

    /// Diff of the workstream's working copy; empty when there is no copy or
    /// the diff cannot be captured.
    pub async fn get_workstream_diff(&self, id: Uuid) -> String {
        match (&self.shared.worktrees, self.workstream_path(id).await) {
            (Some(provider), Some(path)) => provider.diff(&path).await,
            _ => String::new(),
        }
    }

    /// Porcelain status of the workstream's working copy; empty when there is
    /// no copy or the status cannot be captured.
    pub async fn get_workstream_status(&self, id: Uuid) -> String {
        match (&self.shared.worktrees, self.workstream_path(id).await) {
            (Some(provider), Some(path)) => provider.status(&path).await,
            _ => String::new(),
        }
    }

    /// Commit all changes in the workstream's working copy. Returns false
    /// when there is no copy or the commit fails.
    pub async fn commit_workstream_changes(&self, id: Uuid, message: &str) -> bool {
        match (&self.shared.worktrees, self.workstream_path(id).await) {
            (Some(provider), Some(path)) => provider.commit(&path, message).await,
            _ => false,
        }
    }

    async fn workstream_path(&self, id: Uuid) -> Option<PathBuf> {
        self.shared
            .workstreams
            .read()
            .await
            .get(&id)
            .and_then(|w| w.worktree_path.clone())
    }
}

impl Shared {
    async fn emit(&self, id: Uuid, event: &WorkstreamEvent) {
        let observers: Vec<ObserverCallback> =
            self.observers.read().await.values().cloned().collect();
        for callback in observers {
            callback(id, event);
        }
    }

    /// Instantiate the transport client for a workstream, wire its handlers,
    /// and run the session handshake. Handlers hold only the workstream id
    /// and a weak reference; the workstream is resolved lazily per event.
    async fn connect_workstream(self: &Arc<Self>, id: Uuid) -> Result<()> {
        let client = AcpClient::new(&self.config.server_base_url);

        let weak = Arc::downgrade(self);
        client
            .on_message(move |envelope| {
                let weak = weak.clone();
                async move {
                    if let Some(shared) = weak.upgrade() {
                        shared.handle_envelope(id, envelope).await;
                    }
                }
            })
            .await;

        let weak = Arc::downgrade(self);
        client
            .on_error(move |message| {
                let weak = weak.clone();
                tokio::spawn(async move {
                    if let Some(shared) = weak.upgrade() {
                        shared.fail_workstream(id, message).await;
                    }
                });
            })
            .await;

        let weak = Arc::downgrade(self);
        client
            .register_request_handler("request_permission", move |request_id, params| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(shared) => {
                            shared
                                .handle_permission_request(id, request_id, params)
                                .await
                        }
                        None => Err("coordinator shut down".to_string()),
                    }
                }
            })
            .await;

        client.connect().await?;

        let handshake = async {
            let cwd = {
                let workstreams = self.workstreams.read().await;
                let workstream = workstreams
                    .get(&id)
                    .ok_or(CoordinatorError::WorkstreamNotFound { id })?;
                workstream
                    .worktree_path
                    .clone()
                    .unwrap_or_else(|| self.config.repo_path.clone())
            };

            client
                .send_request(
                    "initialize",
                    json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "clientInfo": {
                            "name": CLIENT_NAME,
                            "version": env!("CARGO_PKG_VERSION"),
                        },
                    }),
                )
                .await?;

            let result = client
                .send_request("session/new", json!({ "cwd": cwd, "mcpServers": [] }))
                .await?;
            result
                .get("sessionId")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| CoordinatorError::handshake("session/new returned no sessionId"))
        };

        let session_id = match handshake.await {
            Ok(session_id) => session_id,
            Err(e) => {
                client.disconnect().await;
                return Err(e);
            }
        };

        self.clients.write().await.insert(id, client);

        {
            let mut workstreams = self.workstreams.write().await;
            let workstream = workstreams
                .get_mut(&id)
                .ok_or(CoordinatorError::WorkstreamNotFound { id })?;
            workstream.session_id = Some(session_id.clone());
            workstream.state = WorkstreamState::Running;
            workstream.activity = "Connected".to_string();
            workstream.touch();
        }
        info!(workstream_id = %id, session_id = %session_id, "Workstream connected");
        self.emit(
            id,
            &WorkstreamEvent::StateChanged {
                state: WorkstreamState::Running,
            },
        )
        .await;

        Ok(())
    }

    async fn send_prompt(&self, id: Uuid, text: &str) -> Result<()> {
        let session_id;
        {
            let mut workstreams = self.workstreams.write().await;
            let workstream = workstreams
                .get_mut(&id)
                .ok_or(CoordinatorError::WorkstreamNotFound { id })?;
            if workstream.state == WorkstreamState::Paused {
                return Err(CoordinatorError::WorkstreamPaused { id });
            }
            session_id = workstream
                .session_id
                .clone()
                .ok_or(CoordinatorError::Client(
                    acp_client::ClientError::NotConnected,
                ))?;

            let message = ConversationMessage::operator(text);
            workstream.message_history.push(message.clone());
            workstream.state = WorkstreamState::Running;
            workstream.activity = ACTIVITY_PROCESSING.to_string();
            workstream.touch();
            drop(workstreams);

            self.emit(id, &WorkstreamEvent::Message { message }).await;
            self.emit(
                id,
                &WorkstreamEvent::StateChanged {
                    state: WorkstreamState::Running,
                },
            )
            .await;
            self.emit(
                id,
                &WorkstreamEvent::Activity {
                    activity: ACTIVITY_PROCESSING.to_string(),
                },
            )
            .await;
        }

        let client = self
            .clients
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(CoordinatorError::Client(
                acp_client::ClientError::NotConnected,
            ))?;

        let outcome = client
            .send_request(
                "session/prompt",
                json!({
                    "sessionId": session_id,
                    "prompt": [{ "type": "text", "text": text }],
                }),
            )
            .await;

        match outcome {
            Ok(_) => {
                let mut idle = false;
                {
                    let mut workstreams = self.workstreams.write().await;
                    if let Some(workstream) = workstreams.get_mut(&id) {
                        if workstream.state == WorkstreamState::Running {
                            workstream.activity = ACTIVITY_IDLE.to_string();
                            workstream.touch();
                            idle = true;
                        }
                    }
                }
                if idle {
                    self.emit(
                        id,
                        &WorkstreamEvent::Activity {
                            activity: ACTIVITY_IDLE.to_string(),
                        },
                    )
                    .await;
                }
                Ok(())
            }
            Err(e) => {
                self.fail_workstream(id, e.to_string()).await;
                Err(e.into())
            }
        }
    }

    /// Route one inbound envelope for a workstream.
    async fn handle_envelope(&self, id: Uuid, envelope: Envelope) {
        self.handle_session_event(id, classify(&envelope)).await;
    }

    async fn handle_session_event(&self, id: Uuid, event: SessionEvent) {
        match event {
            SessionEvent::Text { text } => {
                let mut events = Vec::new();
                {
                    let mut workstreams = self.workstreams.write().await;
                    let Some(workstream) = workstreams.get_mut(&id) else {
                        return;
                    };
                    let started_new = workstream.append_agent_text(&text);
                    workstream.activity = clip_activity(&text);
                    workstream.touch();
                    if started_new {
                        if let Some(message) = workstream.message_history.last() {
                            events.push(WorkstreamEvent::Message {
                                message: message.clone(),
                            });
                        }
                    }
                    events.push(WorkstreamEvent::Activity {
                        activity: workstream.activity.clone(),
                    });
                }
                for event in &events {
                    self.emit(id, event).await;
                }
            }
            SessionEvent::Thought { text } => {
                // Thoughts are ephemeral: activity only, never stored.
                let activity = clip_activity(&text);
                {
                    let mut workstreams = self.workstreams.write().await;
                    let Some(workstream) = workstreams.get_mut(&id) else {
                        return;
                    };
                    workstream.activity = activity.clone();
                    workstream.touch();
                }
                self.emit(id, &WorkstreamEvent::Activity { activity }).await;
            }
            SessionEvent::ToolCall { id: tool_id, title, status } => {
                let tool = ToolCall {
                    id: tool_id,
                    title: title.clone(),
                    status: ToolStatus::Pending,
                };
                if !status.is_terminal() {
                    self.active_tools
                        .write()
                        .await
                        .entry(id)
                        .or_default()
                        .insert(tool.id.clone(), tool.clone());
                }
                let activity = clip_activity(&format!("Using tool: {}", title));
                {
                    let mut workstreams = self.workstreams.write().await;
                    let Some(workstream) = workstreams.get_mut(&id) else {
                        return;
                    };
                    workstream.activity = activity.clone();
                    workstream.touch();
                }
                self.emit(id, &WorkstreamEvent::ToolCallStarted { tool }).await;
                self.emit(id, &WorkstreamEvent::Activity { activity }).await;
            }
            SessionEvent::ToolUpdate { id: tool_id, status, content: _ } => {
                self.touch(id).await;
                let Some(status) = status else { return };
                {
                    let mut tools = self.active_tools.write().await;
                    match tools.get_mut(&id).and_then(|t| {
                        if status.is_terminal() {
                            t.remove(&tool_id)
                        } else {
                            t.get_mut(&tool_id).map(|tool| {
                                tool.status = status;
                                tool.clone()
                            })
                        }
                    }) {
                        Some(_) => {}
                        // Updates for unknown tool ids are absorbed.
                        None => {
                            debug!(workstream_id = %id, tool_id = %tool_id, "Update for unknown tool")
                        }
                    }
                }
                self.emit(id, &WorkstreamEvent::ToolCallUpdated { id: tool_id, status })
                    .await;
            }
            SessionEvent::PermissionRequest { .. } => {
                // Real permission requests arrive through the transport's
                // request-handler path; one without an id cannot be answered.
                warn!(workstream_id = %id, "Ignoring permission request with no request id");
                self.touch(id).await;
            }
            SessionEvent::Unknown => {
                self.touch(id).await;
            }
        }
    }

    /// Handle a peer-initiated permission request. Registers the pending
    /// record, notifies observers, then stays unresolved until the operator
    /// answers through `respond_to_permission`.
    async fn handle_permission_request(
        &self,
        id: Uuid,
        request_id: Value,
        params: Value,
    ) -> std::result::Result<Value, String> {
        let pending = PendingPermission::from_params(request_id.clone(), params.clone());
        let tool_title = pending.tool_title.clone();

        let rx = {
            let mut pendings = self.pending_permissions.write().await;
            let mut resolvers = self.permission_resolvers.write().await;
            if pendings.contains_key(&id) {
                // One pending permission per workstream; the newcomer is
                // answered with an error rather than displacing the original.
                warn!(workstream_id = %id, "Rejecting second concurrent permission request");
                return Err("a permission request is already pending".to_string());
            }
            let (tx, rx) = oneshot::channel();
            pendings.insert(id, pending);
            resolvers.insert(id, tx);
            rx
        };

        let mut events = Vec::new();
        {
            let mut workstreams = self.workstreams.write().await;
            if let Some(workstream) = workstreams.get_mut(&id) {
                workstream.state = WorkstreamState::Waiting;
                workstream.activity = format!("Permission needed: {}", tool_title);
                workstream.touch();
                let notification = workstream.notify(
                    NotificationKind::ActionRequired,
                    "Permission required",
                    format!("{} wants to run: {}", workstream.name, tool_title),
                );
                events.push(WorkstreamEvent::StateChanged {
                    state: WorkstreamState::Waiting,
                });
                events.push(WorkstreamEvent::Activity {
                    activity: workstream.activity.clone(),
                });
                events.push(WorkstreamEvent::Notified { notification });
            }
        }
        for event in &events {
            self.emit(id, event).await;
        }
        self.emit(id, &WorkstreamEvent::PermissionRequested { request_id, params })
            .await;

        // Blocked until the operator decides or the workstream is stopped.
        rx.await
            .map_err(|_| "permission request abandoned".to_string())
    }

    async fn fail_workstream(&self, id: Uuid, message: String) {
        let mut events = Vec::new();
        {
            let mut workstreams = self.workstreams.write().await;
            let Some(workstream) = workstreams.get_mut(&id) else {
                return;
            };
            if workstream.state == WorkstreamState::Error {
                return;
            }
            warn!(workstream_id = %id, "Workstream failed: {}", message);
            workstream.state = WorkstreamState::Error;
            workstream.activity = clip_activity(&format!("Error: {}", message));
            workstream.touch();
            let notification = workstream.notify(
                NotificationKind::Error,
                "Workstream error",
                message.clone(),
            );
            events.push(WorkstreamEvent::StateChanged {
                state: WorkstreamState::Error,
            });
            events.push(WorkstreamEvent::Notified { notification });
            events.push(WorkstreamEvent::Error { message });
        }
        for event in &events {
            self.emit(id, event).await;
        }
    }

    async fn set_state(&self, id: Uuid, state: WorkstreamState, activity: Option<&str>) {
        {
            let mut workstreams = self.workstreams.write().await;
            let Some(workstream) = workstreams.get_mut(&id) else {
                return;
            };
            workstream.state = state;
            if let Some(activity) = activity {
                workstream.activity = activity.to_string();
            }
            workstream.touch();
        }
        self.emit(id, &WorkstreamEvent::StateChanged { state }).await;
    }

    /// Transition `id` from `expected` to `next`; any other current state is
    /// left untouched.
    async fn transition(
        &self,
        id: Uuid,
        expected: WorkstreamState,
        next: WorkstreamState,
    ) -> Result<()> {
        let changed = {
            let mut workstreams = self.workstreams.write().await;
            let workstream = workstreams
                .get_mut(&id)
                .ok_or(CoordinatorError::WorkstreamNotFound { id })?;
            if workstream.state == expected {
                workstream.state = next;
                workstream.touch();
                true
            } else {
                debug!(
                    workstream_id = %id,
                    "Ignoring transition to {:?} from {:?}", next, workstream.state
                );
                false
            }
        };
        if changed {
            self.emit(id, &WorkstreamEvent::StateChanged { state: next })
                .await;
        }
        Ok(())
    }

    async fn touch(&self, id: Uuid) {
        if let Some(workstream) = self.workstreams.write().await.get_mut(&id) {
            workstream.touch();
        }
    }
}

fn clip_activity(text: &str) -> String {
    text.chars().take(ACTIVITY_LIMIT).collect()
}
