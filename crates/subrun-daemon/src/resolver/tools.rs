//! Tool-server (MCP) layering and validation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use subrun_core::agents::{AgentsConfig, ToolServerConfig, agents_config_path};

/// How the engine reaches a tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Stdio,
    Http,
    Sse,
}

impl Transport {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "stdio" => Some(Self::Stdio),
            "http" => Some(Self::Http),
            "sse" => Some(Self::Sse),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Sse => "sse",
        }
    }
}

/// A validated, enabled tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedToolServer {
    pub transport: Transport,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub http_headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearer_token_env_var: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub enabled_tools: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub disabled_tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_timeout: Option<Duration>,
}

/// Where tool-server entries come from, highest priority first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolSource {
    /// A request-supplied document used on its own.
    Explicit(PathBuf),
    /// Base layer overlaid by an optional repo-local document.
    Layered {
        base: Option<PathBuf>,
        repo: Option<PathBuf>,
    },
}

impl ToolSource {
    /// Layer documents for a base root and a project directory. The repo layer
    /// is only used when its file exists.
    pub fn layered(base_root: Option<&Path>, project_dir: Option<&Path>) -> Self {
        Self::Layered {
            base: base_root.map(agents_config_path),
            repo: project_dir
                .map(agents_config_path)
                .filter(|p| p.is_file()),
        }
    }
}

/// Resolve the effective tool servers, collecting warnings.
pub fn resolve_tool_servers(
    source: &ToolSource,
    warnings: &mut Vec<String>,
) -> BTreeMap<String, ResolvedToolServer> {
    let merged = match source {
        ToolSource::Explicit(path) => {
            if !path.is_file() {
                warnings.push(format!("agents config {} not found", path.display()));
                return BTreeMap::new();
            }
            match AgentsConfig::load(path) {
                Ok(cfg) => cfg.mcp_servers,
                Err(e) => {
                    warnings.push(format!("load agents config: {e}"));
                    return BTreeMap::new();
                }
            }
        }
        ToolSource::Layered { base, repo } => {
            let lower = base.as_deref().map(|p| load_layer(p, warnings)).unwrap_or_default();
            let higher = repo.as_deref().map(|p| load_layer(p, warnings)).unwrap_or_default();
            merge_servers(lower, higher)
        }
    };
    validate_servers(merged, warnings)
}

fn load_layer(path: &Path, warnings: &mut Vec<String>) -> BTreeMap<String, ToolServerConfig> {
    match AgentsConfig::load(path) {
        Ok(cfg) => cfg.mcp_servers,
        Err(e) => {
            warnings.push(format!("load agents config: {e}"));
            BTreeMap::new()
        }
    }
}

/// Overlay `higher` on `lower` by trimmed name. Same-name entries replace whole.
pub fn merge_servers(
    lower: BTreeMap<String, ToolServerConfig>,
    higher: BTreeMap<String, ToolServerConfig>,
) -> BTreeMap<String, ToolServerConfig> {
    let mut merged = BTreeMap::new();
    for (name, entry) in lower {
        let name = name.trim();
        if !name.is_empty() {
            merged.entry(name.to_string()).or_insert(entry);
        }
    }
    for (name, entry) in higher {
        let name = name.trim();
        if !name.is_empty() {
            merged.insert(name.to_string(), entry);
        }
    }
    merged
}

fn validate_servers(
    servers: BTreeMap<String, ToolServerConfig>,
    warnings: &mut Vec<String>,
) -> BTreeMap<String, ResolvedToolServer> {
    let mut out = BTreeMap::new();
    for (name, server) in servers {
        let name = name.trim().to_string();
        if name.is_empty() || !server.is_enabled() {
            continue;
        }
        match resolve_server(&name, server) {
            Ok(resolved) => {
                out.insert(name, resolved);
            }
            Err(warning) => warnings.push(warning),
        }
    }
    out
}

fn resolve_server(name: &str, server: ToolServerConfig) -> Result<ResolvedToolServer, String> {
    let declared = server.transport_type().unwrap_or_default();
    let transport = Transport::parse(&declared)
        .ok_or_else(|| format!("mcp server {name}: unsupported type {declared:?}"))?;

    let command = trimmed(server.command);
    let url = trimmed(server.url);
    match transport {
        Transport::Stdio if command.is_empty() => {
            return Err(format!("mcp server {name}: command is required for stdio"));
        }
        Transport::Http | Transport::Sse if url.is_empty() => {
            return Err(format!(
                "mcp server {name}: url is required for {}",
                transport.as_str()
            ));
        }
        _ => {}
    }

    Ok(ResolvedToolServer {
        transport,
        command,
        args: server.args,
        url,
        env: server.env,
        http_headers: server.http_headers,
        bearer_token_env_var: server
            .bearer_token_env_var
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty()),
        enabled_tools: server.enabled_tools,
        disabled_tools: server.disabled_tools,
        startup_timeout: server
            .startup_timeout_sec
            .filter(|s| *s > 0)
            .map(Duration::from_secs),
        tool_timeout: server
            .tool_timeout_sec
            .filter(|s| *s > 0)
            .map(Duration::from_secs),
    })
}

fn trimmed(value: Option<String>) -> String {
    value.map(|v| v.trim().to_string()).unwrap_or_default()
}
