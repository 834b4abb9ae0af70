//! Run request and result values.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use subrun_core::FailoverReason;
use subrun_core::role::{normalize_role, parse_role};

/// Who asked for a run. Forwarded to the engine as metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chat_id: String,
}

/// Parameters of one subagent run, fixed at spawn time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRequest {
    pub run_id: String,
    pub task: String,
    /// Empty means "take it from a `[role]` marker on the task, else the default".
    pub role: String,
    /// Home directory of the host agent; base layer when no role pack applies.
    pub host_dir: Option<PathBuf>,
    /// Role pack directory; replaces the host layer when it carries `.agents/`.
    pub role_dir: Option<PathBuf>,
    /// Project the run works in.
    pub repo_dir: Option<PathBuf>,
    /// Used as the project when `repo_dir` is unset.
    pub work_dir: Option<PathBuf>,
    /// Parent workspace; last-resort base layer.
    pub workspace_dir: Option<PathBuf>,
    /// Explicit tool-server document; supersedes layered resolution.
    pub config_path: Option<PathBuf>,
    pub system_prompt: Option<String>,
    /// Run budget. `None` or zero selects the manager default.
    pub timeout: Option<Duration>,
    pub meta: RequestMeta,
}

impl RunRequest {
    pub fn new(run_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            task: task.into(),
            ..Self::default()
        }
    }

    /// Directory the engine runs in: `repo_dir`, else `work_dir`.
    pub fn project_dir(&self) -> Option<&Path> {
        non_empty(self.repo_dir.as_deref()).or_else(|| non_empty(self.work_dir.as_deref()))
    }

    /// Explicit role, else the task's `[role]` marker, else the default.
    pub fn effective_role(&self) -> String {
        if self.role.trim().is_empty() {
            parse_role(&self.task, "")
        } else {
            normalize_role(&self.role)
        }
    }
}

/// Treat unset and blank paths alike.
pub fn non_empty(path: Option<&Path>) -> Option<&Path> {
    path.filter(|p| !p.as_os_str().to_string_lossy().trim().is_empty())
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Error,
    /// The run budget ran out.
    Timeout,
}

impl RunStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a run, produced once by its execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub status: RunStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failover_reason: Option<FailoverReason>,
    /// Configuration problems found while preparing the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl RunResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self::new(RunStatus::Ok, output.into(), String::new())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(RunStatus::Error, String::new(), message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RunStatus::Timeout, String::new(), message.into())
    }

    const fn new(status: RunStatus, output: String, error_message: String) -> Self {
        Self {
            status,
            output,
            error_message,
            failover_reason: None,
            warnings: Vec::new(),
        }
    }

    #[must_use]
    pub const fn with_failover_reason(mut self, reason: FailoverReason) -> Self {
        self.failover_reason = Some(reason);
        self
    }

    #[must_use]
    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == RunStatus::Ok
    }
}
