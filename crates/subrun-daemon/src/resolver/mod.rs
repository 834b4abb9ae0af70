//! Layered configuration resolution for a run.
//!
//! Sources, highest priority first:
//!
//! 1. the request's explicit config path (tool servers only, used alone)
//! 2. the project's `.agents/` directory
//! 3. the base root: a role pack with `.agents/`, else the host agent home,
//!    else the parent workspace
//!
//! Resolution never fails. Anything wrong with a source is reported as a
//! warning and the source contributes nothing.

mod layers;
mod skills;
mod tools;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use subrun_core::agents::SkillDefinition;

use crate::orchestration::types::{RunRequest, non_empty};

pub use layers::base_root;
pub use skills::{NO_SKILLS_WARNING, resolve_skills};
pub use tools::{ResolvedToolServer, ToolSource, Transport, merge_servers, resolve_tool_servers};

/// Options a run gets from its configuration layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EffectiveConfig {
    pub base_root: Option<PathBuf>,
    pub tool_servers: BTreeMap<String, ResolvedToolServer>,
    pub skills: Vec<SkillDefinition>,
    pub warnings: Vec<String>,
}

/// Resolve the effective configuration of a run.
pub fn resolve(request: &RunRequest) -> EffectiveConfig {
    let base_root = base_root(request);
    let project_dir = request.project_dir();
    let mut warnings = Vec::new();

    let source = match non_empty(request.config_path.as_deref()) {
        Some(explicit) => ToolSource::Explicit(explicit.to_path_buf()),
        None => ToolSource::layered(base_root.as_deref(), project_dir),
    };
    let tool_servers = resolve_tool_servers(&source, &mut warnings);
    let skills = resolve_skills(base_root.as_deref(), project_dir, &mut warnings);

    EffectiveConfig {
        base_root,
        tool_servers,
        skills,
        warnings,
    }
}
