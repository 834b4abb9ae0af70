//! Skill directories and `SKILL.md` parsing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::DISABLED_MARKER;
use crate::error::{Error, Result};

static SKILL_NAME_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9](?:[a-z0-9-]{0,62}[a-z0-9])?$").ok());

const SKILL_FILES: &[&str] = &["SKILL.md", "skill.md"];

/// YAML front matter of a `SKILL.md` file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SkillFrontMatter {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, rename = "allowed-tools")]
    allowed_tools: Option<ToolList>,
}

impl SkillFrontMatter {
    /// Tools listed under `allowed-tools`, trimmed and de-duplicated in order.
    pub fn allowed_tools(&self) -> Vec<String> {
        let raw: Vec<String> = match &self.allowed_tools {
            None => Vec::new(),
            Some(ToolList::Csv(s)) => s.split(',').map(str::to_string).collect(),
            Some(ToolList::Seq(items)) => items.clone(),
        };
        let mut out: Vec<String> = Vec::with_capacity(raw.len());
        for tool in raw {
            let tool = tool.trim();
            if !tool.is_empty() && !out.iter().any(|t| t == tool) {
                out.push(tool.to_string());
            }
        }
        out
    }
}

/// `allowed-tools` accepts either `"Read, Grep"` or `[Read, Grep]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum ToolList {
    Csv(String),
    Seq(Vec<String>),
}

/// A loaded, enabled skill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkillDefinition {
    pub name: String,
    pub description: String,
    pub metadata: BTreeMap<String, String>,
    pub allowed_tools: Vec<String>,
    /// Markdown body of the skill file.
    pub body: String,
    /// Path of the skill file the definition was read from.
    pub source: PathBuf,
}

/// One named entry of a skills directory.
///
/// Disabled entries are kept so a higher-priority layer can mask a skill a
/// lower layer enables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkillDirEntry {
    Enabled(SkillDefinition),
    Disabled { dir: PathBuf },
}

impl SkillDirEntry {
    pub const fn definition(&self) -> Option<&SkillDefinition> {
        match self {
            Self::Enabled(def) => Some(def),
            Self::Disabled { .. } => None,
        }
    }
}

/// Whether `name` is an acceptable skill directory name.
pub fn is_valid_skill_name(name: &str) -> bool {
    SKILL_NAME_RE.as_ref().is_some_and(|re| re.is_match(name))
}

/// Split `content` into its YAML front matter and markdown body.
pub fn parse_front_matter(content: &str) -> std::result::Result<(SkillFrontMatter, String), String> {
    let content = content.trim_start_matches('\u{feff}');
    let mut lines = content.lines();
    if lines.next().map(str::trim) != Some("---") {
        return Err("missing YAML frontmatter".to_string());
    }

    let mut yaml = Vec::new();
    let mut closed = false;
    for line in lines.by_ref() {
        if line.trim() == "---" {
            closed = true;
            break;
        }
        yaml.push(line);
    }
    if !closed {
        return Err("missing closing frontmatter separator".to_string());
    }

    let yaml = yaml.join("\n");
    let meta = if yaml.trim().is_empty() {
        SkillFrontMatter::default()
    } else {
        serde_yml::from_str(&yaml).map_err(|e| format!("decode YAML: {e}"))?
    };
    let body = lines.collect::<Vec<_>>().join("\n");
    Ok((meta, body))
}

/// Load every skill under `skills_dir`.
///
/// Problems with individual skills are returned as warnings; a missing
/// directory is simply empty.
pub fn load_skills_from_dir(skills_dir: &Path) -> (BTreeMap<String, SkillDirEntry>, Vec<String>) {
    let mut out = BTreeMap::new();
    let mut warnings = Vec::new();

    if skills_dir.as_os_str().is_empty() {
        return (out, warnings);
    }
    let entries = match std::fs::read_dir(skills_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return (out, warnings),
        Err(e) => {
            warnings.push(format!("read skills dir {}: {e}", skills_dir.display()));
            return (out, warnings);
        }
    };

    let mut dirs: Vec<(String, PathBuf)> = entries
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .filter_map(|e| {
            let name = e.file_name().to_str()?.trim().to_string();
            Some((name, e.path()))
        })
        .filter(|(name, _)| !name.is_empty() && !name.starts_with('.'))
        .collect();
    dirs.sort();

    for (dir_name, skill_dir) in dirs {
        if !is_valid_skill_name(&dir_name) {
            warnings.push(format!("skip skill {dir_name}: invalid directory name"));
            continue;
        }
        if skill_dir.join(DISABLED_MARKER).is_file() {
            out.insert(dir_name, SkillDirEntry::Disabled { dir: skill_dir });
            continue;
        }
        let Some(skill_file) = SKILL_FILES
            .iter()
            .map(|f| skill_dir.join(f))
            .find(|p| p.is_file())
        else {
            continue;
        };

        match load_skill_file(&skill_file, &dir_name) {
            Ok(def) => {
                out.insert(dir_name, SkillDirEntry::Enabled(def));
            }
            Err(e) => warnings.push(e.to_string()),
        }
    }

    (out, warnings)
}

fn load_skill_file(skill_file: &Path, dir_name: &str) -> Result<SkillDefinition> {
    let skill_err = |reason: String| Error::Skill {
        path: skill_file.to_path_buf(),
        reason,
    };
    let content = std::fs::read_to_string(skill_file).map_err(|e| skill_err(format!("read: {e}")))?;
    let (meta, body) = parse_front_matter(&content).map_err(skill_err)?;

    let name = match meta.name.trim() {
        "" => dir_name.to_string(),
        n => n.to_string(),
    };
    if name != dir_name {
        return Err(skill_err(format!(
            "frontmatter name {name:?} does not match directory name {dir_name:?}"
        )));
    }

    let mut metadata: BTreeMap<String, String> = meta
        .metadata
        .iter()
        .filter(|(k, _)| !k.trim().is_empty())
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    metadata.insert("source".to_string(), skill_file.display().to_string());

    Ok(SkillDefinition {
        allowed_tools: meta.allowed_tools(),
        name,
        description: meta.description.trim().to_string(),
        metadata,
        body: body.trim().to_string(),
        source: skill_file.to_path_buf(),
    })
}
