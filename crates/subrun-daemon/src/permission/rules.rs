//! Rule-engine backed decider.

use async_trait::async_trait;
use subrun_core::permissions::{PermissionAction, PermissionEngine, ToolQuery, input_path};

use super::{PermissionDecider, PermissionDecision, PermissionError, PermissionRequest};
use crate::orchestration::types::RunRequest;

/// Answers approvals from a [`PermissionEngine`].
#[derive(Debug, Default)]
pub struct RuleDecider {
    engine: PermissionEngine,
}

impl RuleDecider {
    pub const fn new(engine: PermissionEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl PermissionDecider for RuleDecider {
    async fn decide(
        &self,
        run: &RunRequest,
        request: &PermissionRequest,
    ) -> Result<PermissionDecision, PermissionError> {
        let role = run.effective_role();
        let verdict = self.engine.evaluate(ToolQuery {
            tool_name: &request.tool_name,
            path: input_path(&request.input),
            role: &role,
        });
        Ok(match verdict.action {
            PermissionAction::Allow => PermissionDecision::Allow,
            PermissionAction::Deny => PermissionDecision::Deny {
                reason: verdict
                    .reason
                    .or_else(|| verdict.rule_id.map(|id| format!("denied by rule {id}")))
                    .unwrap_or_else(|| "denied".to_string()),
            },
            PermissionAction::Ask => PermissionDecision::Ask,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use subrun_core::permissions::{PermissionRule, RuleSource};

    fn request(tool: &str, input: serde_json::Value) -> PermissionRequest {
        PermissionRequest {
            request_id: "r".to_string(),
            tool_name: tool.to_string(),
            input,
        }
    }

    #[tokio::test]
    async fn builtin_rules() {
        let decider = RuleDecider::new(PermissionEngine::new());
        let run = RunRequest::new("run", "task");
        assert_eq!(
            decider
                .decide(&run, &request("Read", serde_json::json!({})))
                .await
                .unwrap(),
            PermissionDecision::Allow
        );
        assert_eq!(
            decider
                .decide(&run, &request("Bash", serde_json::json!({"command": "ls"})))
                .await
                .unwrap(),
            PermissionDecision::Ask
        );
    }

    #[tokio::test]
    async fn role_from_task_marker_selects_rules() {
        let mut engine = PermissionEngine::new();
        engine.add_rules(vec![PermissionRule {
            id: "fe-no-write".to_string(),
            tool_pattern: "Write".to_string(),
            path_pattern: None,
            role: Some("frontend".to_string()),
            action: PermissionAction::Deny,
            priority: 1,
            description: None,
            source: RuleSource::Project,
        }]);
        let decider = RuleDecider::new(engine);
        let run = RunRequest::new("run", "[frontend] restyle");

        let decision = decider
            .decide(&run, &request("Write", serde_json::json!({"file_path": "/a"})))
            .await
            .unwrap();
        assert_eq!(
            decision,
            PermissionDecision::Deny {
                reason: "denied by rule fe-no-write".to_string()
            }
        );
    }
}
