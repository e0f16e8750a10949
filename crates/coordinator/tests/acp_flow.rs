//! End-to-end coordinator tests against an in-process mock agent.

mod support;

use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use acp_client::ToolStatus;
use coordinator::{
    Coordinator, CoordinatorConfig, MessageRole, NotificationKind, WorkstreamEvent,
    WorkstreamState,
};
use serde_json::{json, Value};
use tempfile::TempDir;

use support::{spawn_mock_agent, SESSION_ID};

/// Poll a condition until it holds or two seconds elapse.
macro_rules! eventually {
    ($cond:expr) => {{
        let mut ok = false;
        for _ in 0..200 {
            if $cond {
                ok = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ok, "condition not met: {}", stringify!($cond));
    }};
}

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

fn init_test_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    git(dir.path(), &["init", "-b", "main"]);
    git(dir.path(), &["config", "user.email", "test@test.com"]);
    git(dir.path(), &["config", "user.name", "Test"]);
    std::fs::write(dir.path().join("test.txt"), "test").unwrap();
    git(dir.path(), &["add", "."]);
    git(dir.path(), &["commit", "-m", "Initial commit"]);
    dir
}

fn config(base_url: &str, repo: &Path, use_worktrees: bool) -> CoordinatorConfig {
    CoordinatorConfig {
        server_base_url: base_url.to_string(),
        repo_path: repo.to_path_buf(),
        use_worktrees,
    }
}

#[tokio::test]
async fn happy_path_with_worktree() {
    let repo = init_test_repo();
    let (agent, base_url) = spawn_mock_agent().await;
    let coordinator = Coordinator::new(config(&base_url, repo.path(), true));

    let workstream = coordinator
        .create_workstream("fix-x", "do it")
        .await
        .unwrap();
    assert_eq!(workstream.state, WorkstreamState::Running);
    assert_eq!(workstream.name, "fix-x");
    assert_eq!(workstream.session_id.as_deref(), Some(SESSION_ID));

    let worktree_path = repo.path().join(".goose-worktrees").join("fix-x");
    assert_eq!(
        workstream.worktree_path.as_deref(),
        Some(worktree_path.as_path())
    );
    assert_eq!(workstream.branch_name.as_deref(), Some("goose/fix-x"));
    assert!(worktree_path.is_dir());

    // Handshake calls, in order
    let methods: Vec<String> = agent
        .received
        .lock()
        .await
        .iter()
        .filter_map(|v| v.get("method").and_then(Value::as_str).map(str::to_string))
        .collect();
    assert_eq!(methods, vec!["initialize", "session/new"]);

    let session_new = agent.requests("session/new").await;
    assert_eq!(
        session_new[0]["params"]["cwd"],
        serde_json::to_value(&worktree_path).unwrap()
    );
    assert_eq!(session_new[0]["params"]["mcpServers"], json!([]));

    coordinator.start_task(workstream.id).await.unwrap();

    let prompts = agent.requests("session/prompt").await;
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0]["params"]["sessionId"], json!(SESSION_ID));
    let text = prompts[0]["params"]["prompt"][0]["text"].as_str().unwrap();
    assert!(text.starts_with("You are working in a git worktree at:"));
    assert!(text.contains("goose/fix-x"));
    assert!(text.ends_with("do it"));

    let current = coordinator.get_workstream(workstream.id).await.unwrap();
    assert_eq!(current.activity, "Idle - awaiting next instruction");
    assert_eq!(current.message_history.len(), 1);
    assert_eq!(current.message_history[0].role, MessageRole::Operator);
}

#[tokio::test]
async fn plain_directory_runs_in_shared_checkout() {
    let dir = TempDir::new().unwrap();
    let (agent, base_url) = spawn_mock_agent().await;
    let coordinator = Coordinator::new(config(&base_url, dir.path(), true));

    let workstream = coordinator
        .create_workstream("fix-x", "do it")
        .await
        .unwrap();
    assert_eq!(workstream.state, WorkstreamState::Running);
    assert!(workstream.worktree_path.is_none());
    assert!(workstream.branch_name.is_none());

    let session_new = agent.requests("session/new").await;
    assert_eq!(
        session_new[0]["params"]["cwd"],
        serde_json::to_value(dir.path()).unwrap()
    );

    coordinator.start_task(workstream.id).await.unwrap();
    let prompts = agent.requests("session/prompt").await;
    assert_eq!(prompts[0]["params"]["prompt"][0]["text"], json!("do it"));
}

#[tokio::test]
async fn permission_round_trip() {
    let dir = TempDir::new().unwrap();
    let (agent, base_url) = spawn_mock_agent().await;
    let coordinator = Coordinator::new(config(&base_url, dir.path(), false));
    let workstream = coordinator.create_workstream("perm", "task").await.unwrap();

    agent
        .push(json!({
            "jsonrpc": "2.0",
            "id": 42,
            "method": "request_permission",
            "params": {
                "sessionId": SESSION_ID,
                "toolCallUpdate": { "fields": { "title": "run tests" } },
                "options": [
                    { "id": "a", "kind": "allow_once" },
                    { "id": "r", "kind": "reject_once" },
                ],
            },
        }))
        .await;

    eventually!(
        coordinator.get_workstream(workstream.id).await.unwrap().state == WorkstreamState::Waiting
    );

    let pending = coordinator
        .get_pending_permission(workstream.id)
        .await
        .unwrap();
    assert_eq!(pending.request_id, json!(42));
    assert_eq!(pending.tool_title, "run tests");
    assert_eq!(pending.options.len(), 2);

    let current = coordinator.get_workstream(workstream.id).await.unwrap();
    assert_eq!(current.activity, "Permission needed: run tests");

    let unread = coordinator.get_unread_notifications().await;
    assert!(unread
        .iter()
        .any(|n| n.kind == NotificationKind::ActionRequired));

    coordinator
        .respond_to_permission(workstream.id, "a")
        .await
        .unwrap();

    let reply = agent
        .wait_for(|v| v.get("id") == Some(&json!(42)) && v.get("result").is_some())
        .await;
    assert_eq!(
        reply["result"],
        json!({ "outcome": { "selected": { "optionId": "a" } } })
    );

    assert!(coordinator
        .get_pending_permission(workstream.id)
        .await
        .is_none());
    assert_eq!(
        coordinator.get_workstream(workstream.id).await.unwrap().state,
        WorkstreamState::Running
    );

    let err = coordinator
        .respond_to_permission(workstream.id, "a")
        .await
        .expect_err("nothing pending anymore");
    assert_eq!(err.to_string(), "no pending permission request");
}

#[tokio::test]
async fn second_permission_request_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (agent, base_url) = spawn_mock_agent().await;
    let coordinator = Coordinator::new(config(&base_url, dir.path(), false));
    let workstream = coordinator.create_workstream("perm", "task").await.unwrap();

    agent
        .push(json!({
            "jsonrpc": "2.0",
            "id": 50,
            "method": "request_permission",
            "params": { "toolCallUpdate": { "fields": { "title": "first" } }, "options": [] },
        }))
        .await;
    eventually!(coordinator
        .get_pending_permission(workstream.id)
        .await
        .is_some());

    agent
        .push(json!({
            "jsonrpc": "2.0",
            "id": 51,
            "method": "request_permission",
            "params": { "toolCallUpdate": { "fields": { "title": "second" } }, "options": [] },
        }))
        .await;

    let reply = agent
        .wait_for(|v| v.get("id") == Some(&json!(51)) && v.get("error").is_some())
        .await;
    assert_eq!(reply["error"]["code"], json!(-32000));

    // The original request is still the pending one
    let pending = coordinator
        .get_pending_permission(workstream.id)
        .await
        .unwrap();
    assert_eq!(pending.request_id, json!(50));
    assert_eq!(pending.tool_title, "first");
}

#[tokio::test]
async fn agent_chunks_coalesce_into_one_message() {
    let dir = TempDir::new().unwrap();
    let (agent, base_url) = spawn_mock_agent().await;
    let coordinator = Coordinator::new(config(&base_url, dir.path(), false));
    let workstream = coordinator.create_workstream("chat", "task").await.unwrap();

    let events: Arc<Mutex<Vec<WorkstreamEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let _handle = coordinator
        .subscribe(move |_, event| sink.lock().unwrap().push(event.clone()))
        .await;

    for chunk in ["Hel", "lo ", "world"] {
        agent
            .push_update(json!({
                "sessionUpdate": "agent_message_chunk",
                "content": { "text": chunk },
            }))
            .await;
    }

    eventually!(coordinator
        .get_workstream(workstream.id)
        .await
        .unwrap()
        .message_history
        .last()
        .map(|m| m.content == "Hello world")
        .unwrap_or(false));

    let history = coordinator
        .get_workstream(workstream.id)
        .await
        .unwrap()
        .message_history;
    let agent_messages = history
        .iter()
        .filter(|m| m.role == MessageRole::Agent)
        .count();
    assert_eq!(agent_messages, 1);

    // Only the first chunk produced a message event
    let message_events = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| {
            matches!(e, WorkstreamEvent::Message { message } if message.role == MessageRole::Agent)
        })
        .count();
    assert_eq!(message_events, 1);
}

#[tokio::test]
async fn thoughts_update_activity_only() {
    let dir = TempDir::new().unwrap();
    let (agent, base_url) = spawn_mock_agent().await;
    let coordinator = Coordinator::new(config(&base_url, dir.path(), false));
    let workstream = coordinator
        .create_workstream("think", "task")
        .await
        .unwrap();

    agent
        .push_update(json!({
            "sessionUpdate": "agent_thought_chunk",
            "content": { "text": "mulling it over" },
        }))
        .await;

    eventually!(
        coordinator.get_workstream(workstream.id).await.unwrap().activity == "mulling it over"
    );
    assert!(coordinator
        .get_workstream(workstream.id)
        .await
        .unwrap()
        .message_history
        .is_empty());
}

#[tokio::test]
async fn tool_lifecycle_tracks_active_set() {
    let dir = TempDir::new().unwrap();
    let (agent, base_url) = spawn_mock_agent().await;
    let coordinator = Coordinator::new(config(&base_url, dir.path(), false));
    let workstream = coordinator.create_workstream("tools", "task").await.unwrap();

    assert!(coordinator.get_active_tools(workstream.id).await.is_empty());

    agent
        .push_update(json!({
            "sessionUpdate": "tool_call",
            "id": "t1",
            "title": "run",
            "status": "pending",
        }))
        .await;
    eventually!(coordinator.get_active_tools(workstream.id).await.len() == 1);

    let tools = coordinator.get_active_tools(workstream.id).await;
    assert_eq!(tools[0].id, "t1");
    assert_eq!(tools[0].title, "run");
    assert_eq!(tools[0].status, ToolStatus::Pending);

    agent
        .push_update(json!({
            "sessionUpdate": "tool_call_update",
            "id": "t1",
            "fields": { "status": "completed" },
        }))
        .await;
    eventually!(coordinator.get_active_tools(workstream.id).await.is_empty());
}

#[tokio::test]
async fn stop_with_cleanup_removes_worktree() {
    let repo = init_test_repo();
    let (_agent, base_url) = spawn_mock_agent().await;
    let coordinator = Coordinator::new(config(&base_url, repo.path(), true));

    let workstream = coordinator
        .create_workstream("cleanup-me", "task")
        .await
        .unwrap();
    let worktree_path = workstream.worktree_path.clone().unwrap();
    assert!(worktree_path.is_dir());

    coordinator
        .stop_workstream(workstream.id, true)
        .await
        .unwrap();
    assert!(coordinator.get_all_workstreams().await.is_empty());
    assert!(!worktree_path.exists());

    // Second stop is a silent no-op
    coordinator
        .stop_workstream(workstream.id, true)
        .await
        .unwrap();
}

#[tokio::test]
async fn connect_failure_leaves_error_record() {
    let dir = TempDir::new().unwrap();
    let coordinator = Coordinator::new(config("http://127.0.0.1:1", dir.path(), false));

    let events: Arc<Mutex<Vec<WorkstreamEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let _handle = coordinator
        .subscribe(move |_, event| sink.lock().unwrap().push(event.clone()))
        .await;

    coordinator
        .create_workstream("doomed", "task")
        .await
        .expect_err("connect must fail");

    let all = coordinator.get_all_workstreams().await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].state, WorkstreamState::Error);
    assert!(all[0].session_id.is_none());
    assert!(all[0]
        .notifications
        .iter()
        .any(|n| n.kind == NotificationKind::Error));
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, WorkstreamEvent::Error { .. })));
}

#[tokio::test]
async fn paused_workstream_refuses_prompts() {
    let dir = TempDir::new().unwrap();
    let (agent, base_url) = spawn_mock_agent().await;
    let coordinator = Coordinator::new(config(&base_url, dir.path(), false));
    let workstream = coordinator.create_workstream("pause", "task").await.unwrap();

    coordinator.pause_workstream(workstream.id).await.unwrap();
    assert_eq!(
        coordinator.get_workstream(workstream.id).await.unwrap().state,
        WorkstreamState::Paused
    );

    let err = coordinator
        .send_prompt(workstream.id, "hello")
        .await
        .expect_err("paused workstream must refuse prompts");
    assert!(err.to_string().contains("paused"));
    assert!(agent.requests("session/prompt").await.is_empty());

    coordinator.resume_workstream(workstream.id).await.unwrap();
    coordinator
        .send_prompt(workstream.id, "hello")
        .await
        .unwrap();
    assert_eq!(agent.requests("session/prompt").await.len(), 1);
}
