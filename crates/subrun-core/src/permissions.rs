//! Permission rule matching engine.
//!
//! Evaluates tool-approval requests raised by a subagent run against
//! configured rules. Rules are matched in priority order (first match wins).

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Permission rule definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    /// Rule identifier.
    pub id: String,
    /// Tool name pattern (supports glob: "Bash", "mcp__*", "*").
    pub tool_pattern: String,
    /// Path pattern for file operations (supports glob).
    #[serde(default)]
    pub path_pattern: Option<String>,
    /// Restrict the rule to runs of one role.
    #[serde(default)]
    pub role: Option<String>,
    /// Action to take when matched.
    pub action: PermissionAction,
    /// Priority (lower = higher priority).
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub source: RuleSource,
}

/// Permission action to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PermissionAction {
    Allow,
    Deny,
    /// Defer to the host; a subagent cannot prompt on its own.
    #[default]
    Ask,
}

/// Source of a permission rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleSource {
    #[default]
    Builtin,
    Global,
    Project,
}

/// Permission engine for evaluating tool requests.
#[derive(Debug, Clone, Default)]
pub struct PermissionEngine {
    rules: Vec<PermissionRule>,
}

/// A tool call to evaluate.
#[derive(Debug, Clone, Copy)]
pub struct ToolQuery<'a> {
    pub tool_name: &'a str,
    pub path: Option<&'a Path>,
    pub role: &'a str,
}

impl PermissionEngine {
    /// Create a new permission engine with default rules.
    pub fn new() -> Self {
        Self::with_rules(default_rules())
    }

    /// Create an engine with custom rules.
    pub fn with_rules(mut rules: Vec<PermissionRule>) -> Self {
        rules.sort_by_key(|r| r.priority);
        Self { rules }
    }

    /// Add rules from a source (merges with existing).
    pub fn add_rules(&mut self, rules: Vec<PermissionRule>) {
        self.rules.extend(rules);
        self.rules.sort_by_key(|r| r.priority);
    }

    /// Evaluate a tool request against rules.
    pub fn evaluate(&self, query: ToolQuery<'_>) -> RuleVerdict {
        self.rules
            .iter()
            .find(|rule| rule_applies(rule, query))
            .map_or_else(RuleVerdict::default, |rule| RuleVerdict {
                action: rule.action,
                rule_id: Some(rule.id.clone()),
                reason: rule.description.clone(),
            })
    }
}

fn rule_applies(rule: &PermissionRule, query: ToolQuery<'_>) -> bool {
    if !matches_tool(&rule.tool_pattern, query.tool_name) {
        return false;
    }
    if let Some(role) = &rule.role
        && !role.trim().eq_ignore_ascii_case(query.role)
    {
        return false;
    }
    match (&rule.path_pattern, query.path) {
        (None, _) => true,
        (Some(pattern), Some(path)) => matches_path(pattern, path),
        (Some(_), None) => false,
    }
}

/// Result of rule evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleVerdict {
    pub action: PermissionAction,
    /// ID of the rule that matched (if any).
    pub rule_id: Option<String>,
    pub reason: Option<String>,
}

/// Pull the file path a tool call targets out of its JSON input.
pub fn input_path(input: &serde_json::Value) -> Option<&Path> {
    ["file_path", "path", "notebook_path"]
        .iter()
        .find_map(|key| input.get(key).and_then(serde_json::Value::as_str))
        .filter(|p| !p.is_empty())
        .map(Path::new)
}

/// Check if a tool name matches a pattern.
fn matches_tool(pattern: &str, tool_name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return tool_name.starts_with(prefix);
    }
    pattern == tool_name
}

/// Check if a path matches a glob pattern.
fn matches_path(pattern: &str, path: &Path) -> bool {
    let path_str = path.to_string_lossy();
    if pattern == "*" || pattern == "**" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/**") {
        return path_str.starts_with(prefix);
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return path
            .parent()
            .is_some_and(|parent| parent.to_string_lossy() == prefix);
    }
    path_str == pattern
}

fn builtin(id: &str, tool: &str, action: PermissionAction, priority: u32, desc: &str) -> PermissionRule {
    PermissionRule {
        id: format!("builtin-{id}"),
        tool_pattern: tool.to_string(),
        path_pattern: None,
        role: None,
        action,
        priority,
        description: Some(desc.to_string()),
        source: RuleSource::Builtin,
    }
}

/// Built-in default permission rules.
fn default_rules() -> Vec<PermissionRule> {
    use PermissionAction::{Allow, Ask};
    vec![
        builtin("read-allow", "Read", Allow, 100, "Allow reading files"),
        builtin("glob-allow", "Glob", Allow, 100, "Allow file globbing"),
        builtin("grep-allow", "Grep", Allow, 100, "Allow grep search"),
        builtin("bash-ask", "Bash", Ask, 200, "Ask for bash commands"),
        builtin("write-ask", "Write", Ask, 200, "Ask for file writes"),
        builtin("edit-ask", "Edit", Ask, 200, "Ask for file edits"),
    ]
}
