//! `.agents/config.toml` document.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tool-server definitions stored in `.agents/config.toml`.
///
/// ```toml
/// [mcp_servers.time]
/// type = "stdio"
/// command = "uvx"
/// args = ["mcp-server-time"]
///
/// [mcp_servers.search]
/// enabled = false
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, ToolServerConfig>,
}

/// One tool-server entry.
///
/// Optional fields distinguish "unset" from "set to zero" so that a layer can
/// carry a bare `enabled = false` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// `stdio`, `http` or `sse`; inferred from `command`/`url` when unset.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub http_headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token_env_var: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enabled_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_timeout_sec: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_timeout_sec: Option<u64>,
}

impl ToolServerConfig {
    /// Entries are enabled unless explicitly disabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Declared transport (lowercased), or the one implied by the fields set.
    pub fn transport_type(&self) -> Option<String> {
        if let Some(t) = self.transport.as_deref().map(str::trim)
            && !t.is_empty()
        {
            return Some(t.to_lowercase());
        }
        if non_blank(self.command.as_deref()) {
            return Some("stdio".to_string());
        }
        if non_blank(self.url.as_deref()) {
            return Some("http".to_string());
        }
        None
    }
}

fn non_blank(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.trim().is_empty())
}

impl AgentsConfig {
    /// Load a config document. Missing or empty files yield an empty document.
    pub fn load(path: &Path) -> Result<Self> {
        if path.as_os_str().is_empty() {
            return Err(Error::Config("agents config path is empty".to_string()));
        }
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(Error::AgentsConfig {
                    path: path.to_path_buf(),
                    reason: format!("read: {e}"),
                });
            }
        };
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        toml::from_str(&content).map_err(|e| Error::AgentsConfig {
            path: path.to_path_buf(),
            reason: format!("decode toml: {e}"),
        })
    }

    /// Write the document, creating parent directories and replacing the file
    /// through a temporary sibling.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut content = toml::to_string_pretty(self).map_err(|e| Error::AgentsConfig {
            path: path.to_path_buf(),
            reason: format!("encode toml: {e}"),
        })?;
        if !content.ends_with('\n') {
            content.push('\n');
        }
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, content)?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let cfg = AgentsConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert!(cfg.mcp_servers.is_empty());
    }

    #[test]
    fn empty_path_is_an_error() {
        assert!(AgentsConfig::load(Path::new("")).is_err());
    }

    #[test]
    fn parses_server_tables() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[mcp_servers.time]
type = "stdio"
command = "uvx"
args = ["mcp-server-time"]
startup_timeout_sec = 10

[mcp_servers.search]
url = "http://localhost:9000/mcp"
http_headers = { Authorization = "Bearer x" }

[mcp_servers.off]
enabled = false
"#,
        )
        .unwrap();

        let cfg = AgentsConfig::load(&path).unwrap();
        assert_eq!(cfg.mcp_servers.len(), 3);
        let time = &cfg.mcp_servers["time"];
        assert_eq!(time.command.as_deref(), Some("uvx"));
        assert_eq!(time.startup_timeout_sec, Some(10));
        assert!(time.is_enabled());

        let search = &cfg.mcp_servers["search"];
        assert_eq!(search.transport_type().as_deref(), Some("http"));
        assert_eq!(search.http_headers["Authorization"], "Bearer x");

        assert!(!cfg.mcp_servers["off"].is_enabled());
        assert_eq!(cfg.mcp_servers["off"].transport_type(), None);
    }

    #[test]
    fn invalid_toml_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[mcp_servers.x\n").unwrap();
        let err = AgentsConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut cfg = AgentsConfig::default();
        cfg.mcp_servers.insert(
            "time".to_string(),
            ToolServerConfig {
                transport: Some("stdio".to_string()),
                command: Some("uvx".to_string()),
                ..Default::default()
            },
        );
        cfg.save(&path).unwrap();
        assert_eq!(AgentsConfig::load(&path).unwrap(), cfg);
    }

    #[test]
    fn explicit_type_is_lowercased() {
        let server = ToolServerConfig {
            transport: Some(" SSE ".to_string()),
            ..Default::default()
        };
        assert_eq!(server.transport_type().as_deref(), Some("sse"));
    }
}
