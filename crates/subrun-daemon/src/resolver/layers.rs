//! Choice of the base configuration root.

use std::path::{Path, PathBuf};

use subrun_core::agents::is_agents_root;

use crate::orchestration::types::{RunRequest, non_empty};

/// Pick the base layer root for a run.
///
/// A role pack that carries `.agents/` wins outright; otherwise the host
/// agent home, then the parent workspace.
pub fn base_root(request: &RunRequest) -> Option<PathBuf> {
    if let Some(role_dir) = non_empty(request.role_dir.as_deref())
        && is_agents_root(role_dir)
    {
        return Some(role_dir.to_path_buf());
    }
    non_empty(request.host_dir.as_deref())
        .or_else(|| non_empty(request.workspace_dir.as_deref()))
        .map(Path::to_path_buf)
}
