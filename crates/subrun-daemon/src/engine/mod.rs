//! Execution engine boundary.
//!
//! An [`ExecutionEngine`] runs one subagent task to completion with the
//! options the orchestrator resolved for it. Engines must stop promptly when
//! their cancellation token fires.

mod circuit;
mod claude_cli;
mod failover;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use subrun_core::agents::SkillDefinition;
use tokio_util::sync::CancellationToken;

use crate::orchestration::types::RequestMeta;
use crate::permission::PermissionHandler;
use crate::resolver::ResolvedToolServer;

pub use circuit::{CircuitBreaker, CircuitState};
pub use claude_cli::{ClaudeCliEngine, mcp_config_json, skills_prompt};
pub use failover::FailoverEngine;

/// Everything an engine needs for one run.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub run_id: String,
    pub project_root: PathBuf,
    /// Task text with any `[role]` marker removed.
    pub prompt: String,
    pub role: String,
    pub system_prompt: Option<String>,
    pub skills: Vec<SkillDefinition>,
    pub tool_servers: BTreeMap<String, ResolvedToolServer>,
    pub max_iterations: u32,
    pub timeout: Duration,
    /// Present only when the host installed a decider.
    pub permission: Option<PermissionHandler>,
    pub metadata: RequestMeta,
}

/// What a finished engine run produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineOutput {
    pub text: String,
    /// Structured output, used when there is no text.
    pub structured: Option<Value>,
}

impl EngineOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            structured: None,
        }
    }

    /// Trimmed text, else the structured output rendered as text.
    pub fn normalized(&self) -> String {
        let text = self.text.trim();
        if !text.is_empty() {
            return text.to_string();
        }
        match &self.structured {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.trim().to_string(),
            Some(other) => other.to_string().trim().to_string(),
        }
    }
}

/// Engine failures.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to start engine: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine reported a failed run.
    #[error("{message}")]
    Failed { message: String },

    #[error("engine protocol error: {0}")]
    Protocol(String),

    #[error("engine run canceled")]
    Cancelled,

    #[error("{0}")]
    Unavailable(String),
}

/// Runs one subagent task.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn execute(
        &self,
        options: EngineOptions,
        cancel: CancellationToken,
    ) -> Result<EngineOutput, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_prefers_text() {
        let out = EngineOutput {
            text: "  done \n".to_string(),
            structured: Some(serde_json::json!({"ignored": true})),
        };
        assert_eq!(out.normalized(), "done");
    }

    #[test]
    fn normalized_renders_structured() {
        let out = EngineOutput {
            text: " ".to_string(),
            structured: Some(serde_json::json!(" plain ")),
        };
        assert_eq!(out.normalized(), "plain");

        let out = EngineOutput {
            text: String::new(),
            structured: Some(serde_json::json!({"files": 2})),
        };
        assert_eq!(out.normalized(), r#"{"files":2}"#);

        assert_eq!(EngineOutput::default().normalized(), "");
    }
}
