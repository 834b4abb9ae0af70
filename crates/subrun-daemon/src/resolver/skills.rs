//! Skill layering over `.agents/skills` directories.

use std::collections::BTreeMap;
use std::path::Path;

use subrun_core::agents::{SkillDefinition, agents_skills_dir, load_skills_from_dir};

pub const NO_SKILLS_WARNING: &str = "no skills loaded from layered .agents/skills directories";

/// Resolve enabled skills from the base root and then the project, sorted
/// by name.
///
/// A project entry replaces a base entry of the same name, disabled state
/// included.
pub fn resolve_skills(
    base_root: Option<&Path>,
    project_dir: Option<&Path>,
    warnings: &mut Vec<String>,
) -> Vec<SkillDefinition> {
    let mut merged = BTreeMap::new();
    for root in [base_root, project_dir].into_iter().flatten() {
        let (entries, layer_warnings) = load_skills_from_dir(&agents_skills_dir(root));
        warnings.extend(layer_warnings);
        merged.extend(entries);
    }

    let skills: Vec<SkillDefinition> = merged
        .into_values()
        .filter_map(|entry| entry.definition().cloned())
        .collect();
    if skills.is_empty() {
        warnings.push(NO_SKILLS_WARNING.to_string());
    }
    skills
}
