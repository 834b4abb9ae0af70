//! Permission bridge between a running engine and the host.
//!
//! The engine raises a [`PermissionRequest`] when a tool call needs approval.
//! The host's [`PermissionDecider`] answers it; an `Ask` answer cannot be
//! put to anyone from inside a subagent, so the bridge fails the tool call
//! instead of blocking.

mod rules;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::orchestration::types::RunRequest;

pub use rules::RuleDecider;

/// A tool call awaiting approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRequest {
    /// Engine-side request id.
    pub request_id: String,
    pub tool_name: String,
    pub input: Value,
}

/// Answer of a [`PermissionDecider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Deny { reason: String },
    /// No answer; the tool call fails as needing approval.
    Ask,
}

/// Host callback deciding tool approvals for subagent runs.
#[async_trait]
pub trait PermissionDecider: Send + Sync {
    async fn decide(
        &self,
        run: &RunRequest,
        request: &PermissionRequest,
    ) -> Result<PermissionDecision, PermissionError>;
}

/// Final answer handed back to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolApproval {
    Allowed,
    Denied { reason: String },
}

/// Permission errors. Each one fails the tool call that triggered it.
#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("tool {tool_name} requires approval")]
    ApprovalRequired { tool_name: String },

    #[error("permission decider failed: {0}")]
    Decider(String),
}

/// A decider bound to one run.
#[derive(Clone)]
pub struct PermissionHandler {
    decider: Arc<dyn PermissionDecider>,
    run: Arc<RunRequest>,
}

impl PermissionHandler {
    pub fn new(decider: Arc<dyn PermissionDecider>, run: Arc<RunRequest>) -> Self {
        Self { decider, run }
    }

    /// Ask the decider about `request`.
    pub async fn check(&self, request: &PermissionRequest) -> Result<ToolApproval, PermissionError> {
        let decision = self.decider.decide(&self.run, request).await?;
        debug!(
            run_id = %self.run.run_id,
            tool = %request.tool_name,
            ?decision,
            "Permission decided"
        );
        match decision {
            PermissionDecision::Allow => Ok(ToolApproval::Allowed),
            PermissionDecision::Deny { reason } => Ok(ToolApproval::Denied { reason }),
            PermissionDecision::Ask => Err(PermissionError::ApprovalRequired {
                tool_name: request.tool_name.clone(),
            }),
        }
    }

    /// Like [`Self::check`], with every failure turned into a denial.
    pub async fn approve(&self, request: &PermissionRequest) -> ToolApproval {
        self.check(request)
            .await
            .unwrap_or_else(|e| ToolApproval::Denied {
                reason: e.to_string(),
            })
    }
}

impl std::fmt::Debug for PermissionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionHandler")
            .field("run_id", &self.run.run_id)
            .finish_non_exhaustive()
    }
}
