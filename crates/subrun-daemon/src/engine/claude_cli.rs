//! Engine backed by the `claude` CLI in stream-json mode.
//!
//! One subprocess per run. The prompt goes in as a user message on stdin;
//! stdout is read as NDJSON until the `result` message. Tool approvals
//! arrive as `can_use_tool` control requests and are answered on stdin.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use subrun_core::agents::SkillDefinition;
use subrun_core::config::EngineConfig;
use subrun_core::ndjson::{self, ControlRequest, ControlRequestType, Message, SessionResult};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{EngineError, EngineOptions, EngineOutput, ExecutionEngine};
use crate::permission::{PermissionRequest, ToolApproval};
use crate::resolver::{ResolvedToolServer, Transport};

/// Grace period after SIGTERM before SIGKILL.
const GRACE_PERIOD_SECS: u64 = 5;

/// Stderr lines kept for error messages.
const STDERR_TAIL_LINES: usize = 20;

/// Subprocess engine running the `claude` binary.
#[derive(Debug, Clone)]
pub struct ClaudeCliEngine {
    claude_bin: PathBuf,
    model: Option<String>,
    extra_args: Vec<String>,
    terminate_timeout: Duration,
}

impl ClaudeCliEngine {
    pub fn new(claude_bin: impl Into<PathBuf>) -> Self {
        Self {
            claude_bin: claude_bin.into(),
            model: None,
            extra_args: Vec::new(),
            terminate_timeout: Duration::from_secs(GRACE_PERIOD_SECS),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            model: config.model_name(),
            extra_args: config.extra_args.clone(),
            ..Self::new(&config.claude_bin)
        }
    }

    #[must_use]
    pub fn with_bin(mut self, claude_bin: PathBuf) -> Self {
        self.claude_bin = claude_bin;
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    #[must_use]
    pub const fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    /// Command-line arguments for one run.
    pub(crate) fn args(&self, options: &EngineOptions) -> Vec<String> {
        let mut args: Vec<String> = [
            "--print",
            "--output-format",
            "stream-json",
            "--input-format",
            "stream-json",
            "--verbose",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();

        args.push("--max-turns".to_string());
        args.push(options.max_iterations.max(1).to_string());

        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        let system_prompt = [
            options
                .system_prompt
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from),
            skills_prompt(&options.skills),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join("\n\n");
        if !system_prompt.is_empty() {
            args.push("--append-system-prompt".to_string());
            args.push(system_prompt);
        }

        if let Some(mcp) = mcp_config_json(&options.tool_servers) {
            args.push("--mcp-config".to_string());
            args.push(mcp);
        }

        if options.permission.is_some() {
            args.push("--permission-prompt-tool".to_string());
            args.push("stdio".to_string());
        }

        args.extend(self.extra_args.iter().cloned());
        args
    }

    fn command(&self, options: &EngineOptions) -> Command {
        let mut cmd = Command::new(&self.claude_bin);
        cmd.current_dir(&options.project_root)
            .args(self.args(options))
            .env("SUBRUN_RUN_ID", &options.run_id)
            .env("SUBRUN_ROLE", &options.role)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let meta = &options.metadata;
        for (key, value) in [
            ("SUBRUN_SESSION_KEY", &meta.session_key),
            ("SUBRUN_AGENT_ID", &meta.agent_id),
            ("SUBRUN_CHANNEL", &meta.channel),
            ("SUBRUN_ACCOUNT_ID", &meta.account_id),
            ("SUBRUN_CHAT_ID", &meta.chat_id),
        ] {
            if !value.is_empty() {
                cmd.env(key, value);
            }
        }
        cmd
    }

    /// Read stdout until the result message, answering control requests.
    async fn drive(
        &self,
        stdout: ChildStdout,
        stdin_tx: mpsc::Sender<String>,
        options: &EngineOptions,
    ) -> Result<Option<(SessionResult, String)>, EngineError> {
        let mut stdin_tx = Some(stdin_tx);
        let mut last_text = String::new();
        let mut lines = BufReader::new(stdout).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let message = match ndjson::parse_line(&line) {
                Ok(message) => message,
                Err(e) => {
                    debug!(run_id = %options.run_id, error = %e, "Skipping unparseable engine line");
                    continue;
                }
            };

            match message {
                Message::SystemInit(init) => {
                    debug!(
                        run_id = %options.run_id,
                        session_id = %init.session_id,
                        model = %init.model,
                        mcp_servers = ?init.mcp_servers,
                        "Engine session started"
                    );
                }
                Message::Assistant(msg) => {
                    let text = msg.text();
                    if !text.trim().is_empty() {
                        last_text = text;
                    }
                }
                Message::ControlRequest(request) => {
                    let Some(tx) = &stdin_tx else { continue };
                    if let Some(response) = answer_control_request(request, options).await {
                        tx.send(response).await.map_err(|_| {
                            EngineError::Protocol("engine stdin closed".to_string())
                        })?;
                    }
                }
                Message::Result(result) => {
                    // Closing stdin lets the CLI exit.
                    stdin_tx.take();
                    return Ok(Some((result, last_text)));
                }
                Message::Unknown { msg_type, .. } => {
                    debug!(run_id = %options.run_id, msg_type = %msg_type, "Ignoring engine message");
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl ExecutionEngine for ClaudeCliEngine {
    fn name(&self) -> &str {
        "claude-cli"
    }

    async fn execute(
        &self,
        options: EngineOptions,
        cancel: CancellationToken,
    ) -> Result<EngineOutput, EngineError> {
        info!(
            run_id = %options.run_id,
            bin = %self.claude_bin.display(),
            project_root = %options.project_root.display(),
            model = ?self.model,
            tool_servers = options.tool_servers.len(),
            skills = options.skills.len(),
            "Spawning engine subprocess"
        );
        let mut child = self.command(&options).spawn().map_err(EngineError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Protocol("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Protocol("failed to capture stdout".to_string()))?;
        let stderr_tail = child.stderr.take().map(|stderr| {
            let run_id = options.run_id.clone();
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(run_id = %run_id, "stderr: {}", line);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tail.into_iter().collect::<Vec<_>>().join("\n")
            })
        });

        let stdin_tx = spawn_stdin_writer(stdin);
        stdin_tx
            .send(user_message(&options.prompt))
            .await
            .map_err(|_| EngineError::Protocol("engine stdin closed".to_string()))?;

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.terminate(&mut child, &options.run_id).await;
                return Err(EngineError::Cancelled);
            }
            outcome = self.drive(stdout, stdin_tx, &options) => outcome,
        };

        let status = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.terminate(&mut child, &options.run_id).await;
                return Err(EngineError::Cancelled);
            }
            status = tokio::time::timeout(self.terminate_timeout, child.wait()) => status,
        };
        let status = match status {
            Ok(status) => Some(status?),
            Err(_) => {
                warn!(run_id = %options.run_id, "Engine did not exit after result, terminating");
                self.terminate(&mut child, &options.run_id).await;
                None
            }
        };

        let stderr = match stderr_tail {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        finish(outcome?, status, &stderr)
    }
}

impl ClaudeCliEngine {
    /// SIGTERM, wait for the grace period, then SIGKILL.
    async fn terminate(&self, child: &mut Child, run_id: &str) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: pid comes from our own Child handle; kill(2) with
            // SIGTERM has no memory-safety requirements.
            #[allow(unsafe_code, clippy::cast_possible_wrap)]
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                warn!(run_id, pid, error = %err, "Failed to send SIGTERM");
            }
        }

        match tokio::time::timeout(self.terminate_timeout, child.wait()).await {
            Ok(Ok(status)) => debug!(run_id, ?status, "Engine exited after SIGTERM"),
            Ok(Err(e)) => {
                warn!(run_id, error = %e, "Error waiting for engine");
                child.kill().await.ok();
            }
            Err(_) => {
                warn!(run_id, "Engine ignored SIGTERM, killing");
                child.kill().await.ok();
            }
        }
    }
}

fn spawn_stdin_writer(stdin: tokio::process::ChildStdin) -> mpsc::Sender<String> {
    let (tx, mut rx) = mpsc::channel::<String>(32);
    tokio::spawn(async move {
        let mut stdin = stdin;
        while let Some(line) = rx.recv().await {
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                error!("Failed to write to engine stdin: {}", e);
                break;
            }
            if let Err(e) = stdin.write_all(b"\n").await {
                error!("Failed to write newline: {}", e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                error!("Failed to flush engine stdin: {}", e);
                break;
            }
        }
    });
    tx
}

fn finish(
    outcome: Option<(SessionResult, String)>,
    status: Option<ExitStatus>,
    stderr: &str,
) -> Result<EngineOutput, EngineError> {
    let Some((result, last_text)) = outcome else {
        let message = match status {
            Some(status) if !status.success() => format!("engine exited with {status}"),
            _ => "engine exited without a result".to_string(),
        };
        return Err(EngineError::Failed {
            message: with_stderr(message, stderr),
        });
    };

    if result.is_error {
        let message = if result.result.trim().is_empty() {
            format!("engine run failed ({:?})", result.subtype)
        } else {
            result.result.trim().to_string()
        };
        return Err(EngineError::Failed {
            message: with_stderr(message, stderr),
        });
    }
    if let Some(status) = status
        && !status.success()
    {
        return Err(EngineError::Failed {
            message: with_stderr(format!("engine exited with {status}"), stderr),
        });
    }

    let text = if result.result.trim().is_empty() {
        last_text
    } else {
        result.result
    };
    Ok(EngineOutput {
        text,
        structured: None,
    })
}

fn with_stderr(message: String, stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        message
    } else {
        format!("{message}: {stderr}")
    }
}

async fn answer_control_request(request: ControlRequest, options: &EngineOptions) -> Option<String> {
    let ControlRequestType::CanUseTool { tool_name, input } = request.request else {
        debug!(run_id = %options.run_id, request_id = %request.request_id, "Ignoring control request");
        return None;
    };

    let approval = match &options.permission {
        Some(handler) => {
            handler
                .approve(&PermissionRequest {
                    request_id: request.request_id.clone(),
                    tool_name: tool_name.clone(),
                    input: input.clone(),
                })
                .await
        }
        None => ToolApproval::Denied {
            reason: format!("tool {tool_name} requires approval"),
        },
    };
    info!(run_id = %options.run_id, tool = %tool_name, ?approval, "Tool permission answered");
    Some(permission_response_json(&request.request_id, &approval, &input))
}

/// `control_response` line answering a `can_use_tool` request.
pub(crate) fn permission_response_json(
    request_id: &str,
    approval: &ToolApproval,
    original_input: &Value,
) -> String {
    let response = match approval {
        ToolApproval::Allowed => json!({
            "behavior": "allow",
            "updatedInput": original_input
        }),
        ToolApproval::Denied { reason } => json!({
            "behavior": "deny",
            "message": reason
        }),
    };
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": response
        }
    })
    .to_string()
}

fn user_message(prompt: &str) -> String {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": prompt,
        },
        "session_id": "default",
        "parent_tool_use_id": null,
    })
    .to_string()
}

/// `--mcp-config` document for the effective tool servers, if any.
pub fn mcp_config_json(servers: &BTreeMap<String, ResolvedToolServer>) -> Option<String> {
    if servers.is_empty() {
        return None;
    }
    let entries: serde_json::Map<String, Value> = servers
        .iter()
        .map(|(name, server)| (name.clone(), mcp_server_json(server)))
        .collect();
    Some(json!({ "mcpServers": entries }).to_string())
}

fn mcp_server_json(server: &ResolvedToolServer) -> Value {
    match server.transport {
        Transport::Stdio => {
            let mut entry = json!({
                "type": "stdio",
                "command": server.command,
                "args": server.args,
            });
            if !server.env.is_empty() {
                entry["env"] = json!(server.env);
            }
            entry
        }
        Transport::Http | Transport::Sse => {
            let mut headers = server.http_headers.clone();
            if let Some(var) = &server.bearer_token_env_var
                && let Ok(token) = std::env::var(var)
            {
                headers.insert("Authorization".to_string(), format!("Bearer {token}"));
            }
            let mut entry = json!({
                "type": server.transport.as_str(),
                "url": server.url,
            });
            if !headers.is_empty() {
                entry["headers"] = json!(headers);
            }
            entry
        }
    }
}

/// System-prompt section listing the available skills.
pub fn skills_prompt(skills: &[SkillDefinition]) -> Option<String> {
    if skills.is_empty() {
        return None;
    }
    let mut out = String::from(
        "# Skills\n\nRead a skill's file before following it. Available skills:\n",
    );
    for skill in skills {
        out.push_str(&format!(
            "\n- {}: {} ({})",
            skill.name,
            skill.description,
            skill.source.display()
        ));
    }
    Some(out)
}
