//! Settings resolution for subrun.
//!
//! Implements hierarchical settings resolution:
//! 1. Built-in defaults
//! 2. Global settings (~/.config/subrun/settings.json)
//! 3. Project settings (.subrun/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! File layers are merged key by key, so a project file only needs the keys
//! it changes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::permissions::PermissionRule;
use crate::role::normalize_role;

/// Complete subrun settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Extra permission rules evaluated before the built-in ones.
    #[serde(default)]
    pub permissions: Vec<PermissionRule>,
}

/// Run admission and budget settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Concurrency ceiling for roles without an explicit limit.
    pub default_limit: usize,
    pub role_limits: BTreeMap<String, usize>,
    /// Budget for runs that carry no timeout of their own.
    pub default_timeout_secs: u64,
    /// Turn budget handed to the engine.
    pub max_iterations: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_limit: 8,
            role_limits: BTreeMap::from([("frontend".to_string(), 5), ("backend".to_string(), 4)]),
            default_timeout_secs: 900,
            max_iterations: 15,
        }
    }
}

impl OrchestratorConfig {
    /// Role limits with normalized keys and non-positive entries removed.
    pub fn normalized_role_limits(&self) -> BTreeMap<String, usize> {
        self.role_limits
            .iter()
            .filter(|(_, limit)| **limit > 0)
            .map(|(role, limit)| (normalize_role(role), *limit))
            .collect()
    }
}

/// Engine process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub claude_bin: String,
    pub model: Option<String>,
    pub extra_args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            claude_bin: "claude".to_string(),
            model: None,
            extra_args: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Model name with any provider or path prefix removed.
    pub fn model_name(&self) -> Option<String> {
        self.model.as_deref().and_then(normalize_model)
    }
}

/// Strip provider (`anthropic:`) and path (`openrouter/anthropic/`) prefixes.
pub fn normalize_model(model: &str) -> Option<String> {
    let model = model.trim();
    let model = model.rsplit_once(':').map_or(model, |(_, m)| m);
    let model = model.rsplit_once('/').map_or(model, |(_, m)| m).trim();
    if model.is_empty() {
        None
    } else {
        Some(model.to_string())
    }
}

/// Load settings with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut layers = Vec::new();
    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        layers.push(load_config_file(&global_path)?);
    }
    if let Some(dir) = project_dir {
        let project_path = project_config_path(dir);
        if project_path.exists() {
            layers.push(load_config_file(&project_path)?);
        }
    }

    let mut config = resolve_layers(layers)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Project settings file under `dir`.
pub fn project_config_path(dir: &Path) -> PathBuf {
    dir.join(".subrun").join("settings.json")
}

/// Get the global settings file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".subrun").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/subrun/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("subrun").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    if !value.is_object() {
        return Err(Error::Config(format!(
            "Config file {} must contain a JSON object",
            path.display()
        )));
    }
    Ok(value)
}

/// Merge file layers (lowest first) over the defaults and decode the result.
fn resolve_layers(layers: Vec<Value>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;
    for layer in layers {
        merge_config(&mut merged, layer);
    }
    serde_json::from_value(merged).map_err(|e| Error::Config(format!("Invalid settings: {e}")))
}

/// Objects merge recursively; anything else is replaced by the overlay.
fn merge_config(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_config(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(n) = var("SUBRUN_DEFAULT_LIMIT").and_then(|v| v.trim().parse().ok()) {
        config.orchestrator.default_limit = n;
    }
    if let Some(n) = var("SUBRUN_DEFAULT_TIMEOUT_SECS").and_then(|v| v.trim().parse().ok()) {
        config.orchestrator.default_timeout_secs = n;
    }
    if let Some(n) = var("SUBRUN_MAX_ITERATIONS").and_then(|v| v.trim().parse().ok()) {
        config.orchestrator.max_iterations = n;
    }
    if let Some(bin) = var("SUBRUN_CLAUDE_BIN").filter(|v| !v.trim().is_empty()) {
        config.engine.claude_bin = bin;
    }
    if let Some(model) = var("SUBRUN_MODEL").filter(|v| !v.trim().is_empty()) {
        config.engine.model = Some(model);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.orchestrator.default_limit, 8);
        assert_eq!(config.orchestrator.role_limits["frontend"], 5);
        assert_eq!(config.orchestrator.role_limits["backend"], 4);
        assert_eq!(config.orchestrator.default_timeout_secs, 900);
        assert_eq!(config.orchestrator.max_iterations, 15);
        assert_eq!(config.engine.claude_bin, "claude");
    }

    #[test]
    fn project_layer_overrides_only_its_keys() {
        let global = json!({"orchestrator": {"default_limit": 2}, "engine": {"model": "opus"}});
        let project = json!({"orchestrator": {"role_limits": {"review": 1}}});
        let config = resolve_layers(vec![global, project]).unwrap();

        assert_eq!(config.orchestrator.default_limit, 2);
        assert_eq!(config.orchestrator.role_limits.get("review"), Some(&1));
        assert_eq!(config.orchestrator.role_limits.get("frontend"), Some(&5));
        assert_eq!(config.orchestrator.default_timeout_secs, 900);
        assert_eq!(config.engine.model.as_deref(), Some("opus"));
    }

    #[test]
    fn invalid_layer_is_an_error() {
        let bad = json!({"orchestrator": {"default_limit": "many"}});
        assert!(resolve_layers(vec![bad]).is_err());
    }

    #[test]
    fn non_object_file_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(load_config_file(&path).is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("SUBRUN_DEFAULT_LIMIT", "3"),
            ("SUBRUN_DEFAULT_TIMEOUT_SECS", "60"),
            ("SUBRUN_MAX_ITERATIONS", "oops"),
            ("SUBRUN_MODEL", "anthropic:claude-sonnet"),
        ]);
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| vars.get(k).map(ToString::to_string));

        assert_eq!(config.orchestrator.default_limit, 3);
        assert_eq!(config.orchestrator.default_timeout_secs, 60);
        assert_eq!(config.orchestrator.max_iterations, 15);
        assert_eq!(config.engine.model_name().as_deref(), Some("claude-sonnet"));
    }

    #[test]
    fn model_prefixes_are_stripped() {
        assert_eq!(normalize_model("opus").as_deref(), Some("opus"));
        assert_eq!(normalize_model("anthropic:opus").as_deref(), Some("opus"));
        assert_eq!(
            normalize_model("openrouter/anthropic/claude-sonnet").as_deref(),
            Some("claude-sonnet")
        );
        assert_eq!(normalize_model("  "), None);
    }

    #[test]
    fn role_limits_normalized() {
        let cfg = OrchestratorConfig {
            role_limits: BTreeMap::from([(" Review ".to_string(), 2), ("qa".to_string(), 0)]),
            ..OrchestratorConfig::default()
        };
        let limits = cfg.normalized_role_limits();
        assert_eq!(limits.get("review"), Some(&2));
        assert!(!limits.contains_key("qa"));
    }

    #[test]
    fn project_path_layout() {
        assert_eq!(
            project_config_path(Path::new("/repo")),
            PathBuf::from("/repo/.subrun/settings.json")
        );
    }
}
