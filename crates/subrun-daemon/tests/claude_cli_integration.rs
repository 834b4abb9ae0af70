#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! `ClaudeCliEngine` against a shell script speaking the stream-json protocol.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use subrun_core::permissions::{PermissionAction, PermissionEngine, PermissionRule, RuleSource};
use subrun_daemon::engine::{ClaudeCliEngine, EngineError, EngineOptions, ExecutionEngine};
use subrun_daemon::orchestration::{RequestMeta, RunRequest};
use subrun_daemon::permission::{PermissionHandler, RuleDecider};

/// Reads the prompt, asks for one Bash call, reports the answer.
const APPROVAL_SCRIPT: &str = r#"#!/bin/sh
read -r prompt
echo '{"type":"system","subtype":"init","session_id":"s1","model":"test-model","cwd":"/tmp","mcp_servers":[]}'
echo 'not json'
echo '{"type":"control_request","request_id":"req-1","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"ls"}}}'
read -r answer
case "$answer" in
  *'"behavior":"allow"'*) verdict=allowed ;;
  *) verdict=denied ;;
esac
echo "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"tool $verdict\"}]}}"
echo "{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"tool $verdict\",\"is_error\":false,\"session_id\":\"s1\",\"num_turns\":1,\"duration_ms\":5}"
"#;

const FAILING_SCRIPT: &str = r#"#!/bin/sh
read -r prompt
echo 'invalid x-api-key' >&2
echo '{"type":"result","subtype":"error_during_execution","result":"authentication failed","session_id":"s1"}'
"#;

const HANGING_SCRIPT: &str = "#!/bin/sh\nread -r prompt\nsleep 30\n";

const SILENT_EXIT_SCRIPT: &str = "#!/bin/sh\nread -r prompt\necho 'boom' >&2\nexit 3\n";

fn script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-claude");
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn options(dir: &Path, permission: Option<PermissionHandler>) -> EngineOptions {
    EngineOptions {
        run_id: "run-1".to_string(),
        project_root: dir.to_path_buf(),
        prompt: "list files".to_string(),
        role: "backend".to_string(),
        system_prompt: None,
        skills: Vec::new(),
        tool_servers: BTreeMap::new(),
        max_iterations: 3,
        timeout: Duration::from_secs(30),
        permission,
        metadata: RequestMeta::default(),
    }
}

fn handler(action: PermissionAction) -> PermissionHandler {
    let engine = PermissionEngine::with_rules(vec![PermissionRule {
        id: "bash".to_string(),
        tool_pattern: "Bash".to_string(),
        path_pattern: None,
        role: None,
        action,
        priority: 1,
        description: Some("bash rule".to_string()),
        source: RuleSource::Project,
    }]);
    PermissionHandler::new(
        Arc::new(RuleDecider::new(engine)),
        Arc::new(RunRequest::new("run-1", "list files")),
    )
}

#[tokio::test]
async fn test_allowed_tool_call() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = ClaudeCliEngine::new(script(dir.path(), APPROVAL_SCRIPT));

    let output = engine
        .execute(
            options(dir.path(), Some(handler(PermissionAction::Allow))),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(output.text, "tool allowed");
}

#[tokio::test]
async fn test_denied_without_handler() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = ClaudeCliEngine::new(script(dir.path(), APPROVAL_SCRIPT));

    let output = engine
        .execute(options(dir.path(), None), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(output.text, "tool denied");
}

#[tokio::test]
async fn test_ask_rule_is_denied() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = ClaudeCliEngine::new(script(dir.path(), APPROVAL_SCRIPT));

    let output = engine
        .execute(
            options(dir.path(), Some(handler(PermissionAction::Ask))),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(output.text, "tool denied");
}

#[tokio::test]
async fn test_error_result_reports_message_and_stderr() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = ClaudeCliEngine::new(script(dir.path(), FAILING_SCRIPT));

    let err = engine
        .execute(options(dir.path(), None), CancellationToken::new())
        .await
        .unwrap_err();
    let EngineError::Failed { message } = err else {
        panic!("unexpected error: {err}");
    };
    assert!(message.starts_with("authentication failed"), "{message}");
    assert!(message.contains("invalid x-api-key"), "{message}");
}

#[tokio::test]
async fn test_exit_without_result() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = ClaudeCliEngine::new(script(dir.path(), SILENT_EXIT_SCRIPT));

    let err = engine
        .execute(options(dir.path(), None), CancellationToken::new())
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.starts_with("engine exited with"), "{message}");
    assert!(message.ends_with("boom"), "{message}");
}

#[tokio::test]
async fn test_cancel_terminates_process() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = ClaudeCliEngine::new(script(dir.path(), HANGING_SCRIPT))
        .with_terminate_timeout(Duration::from_secs(1));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = engine
        .execute(options(dir.path(), None), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_missing_binary_fails_to_spawn() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = ClaudeCliEngine::new(dir.path().join("does-not-exist"));

    let err = engine
        .execute(options(dir.path(), None), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Spawn(_)));
}
