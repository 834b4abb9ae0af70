//! On-disk agent documents.
//!
//! Every configuration root (host home, role pack, repository) may carry an
//! `.agents/` directory:
//!
//! ```text
//! <root>/.agents/config.toml          tool-server (MCP) definitions
//! <root>/.agents/skills/<name>/SKILL.md
//! <root>/.agents/skills/<name>/.disabled
//! ```

mod config;
mod skill;

use std::path::{Path, PathBuf};

pub use config::{AgentsConfig, ToolServerConfig};
pub use skill::{
    SkillDefinition, SkillDirEntry, SkillFrontMatter, is_valid_skill_name, load_skills_from_dir,
    parse_front_matter,
};

/// Marker file that disables a skill directory.
pub const DISABLED_MARKER: &str = ".disabled";

/// The `.agents` directory under `root`.
pub fn agents_dir(root: &Path) -> PathBuf {
    root.join(".agents")
}

/// The `.agents/config.toml` path under `root`.
pub fn agents_config_path(root: &Path) -> PathBuf {
    agents_dir(root).join("config.toml")
}

/// The `.agents/skills` directory under `root`.
pub fn agents_skills_dir(root: &Path) -> PathBuf {
    agents_dir(root).join("skills")
}

/// A root is a usable configuration layer if it carries a config file or a
/// skills directory.
pub fn is_agents_root(root: &Path) -> bool {
    if root.as_os_str().is_empty() {
        return false;
    }
    agents_config_path(root).is_file() || agents_skills_dir(root).is_dir()
}
