//! Role names for subagent runs.
//!
//! A role is a free-form, case-insensitive label naming a class of work
//! (`frontend`, `backend`, `review`, ...). Each role gets its own admission
//! gate in the daemon's role pool.

/// Role used when a request carries no role.
pub const DEFAULT_ROLE: &str = "backend";

/// Normalize a role name: trim and lowercase, empty falls back to
/// [`DEFAULT_ROLE`].
pub fn normalize_role(role: &str) -> String {
    let trimmed = role.trim();
    if trimmed.is_empty() {
        return DEFAULT_ROLE.to_string();
    }
    trimmed.to_lowercase()
}

/// Resolve a role from a `[role]` marker, label first and task second.
pub fn parse_role(task: &str, label: &str) -> String {
    role_marker(label)
        .or_else(|| role_marker(task))
        .map_or_else(|| DEFAULT_ROLE.to_string(), normalize_role)
}

/// Remove a leading `[role]` marker so it is not forwarded to the engine.
///
/// Returns the task unchanged when there is no marker or nothing follows it.
pub fn strip_role_prefix(task: &str) -> &str {
    let trimmed = task.trim_start();
    match split_marker(trimmed) {
        Some((_, rest)) if !rest.trim().is_empty() => rest.trim(),
        _ => task,
    }
}

fn role_marker(text: &str) -> Option<&str> {
    split_marker(text.trim_start()).map(|(role, _)| role)
}

/// Split `[role] rest` into `(role, rest)`.
fn split_marker(text: &str) -> Option<(&str, &str)> {
    let inner = text.strip_prefix('[')?;
    let end = inner.find(']')?;
    let role = inner[..end].trim();
    if role.is_empty() || role.contains(char::is_whitespace) {
        return None;
    }
    Some((role, &inner[end + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_lowercases_and_trims() {
        assert_eq!(normalize_role("  FrontEnd "), "frontend");
        assert_eq!(normalize_role("data-eng"), "data-eng");
    }

    #[test]
    fn normalize_empty_uses_default() {
        assert_eq!(normalize_role(""), DEFAULT_ROLE);
        assert_eq!(normalize_role("   "), DEFAULT_ROLE);
    }

    #[test]
    fn parse_role_prefers_label() {
        assert_eq!(parse_role("[backend] fix api", "[Frontend]"), "frontend");
        assert_eq!(parse_role("[review] check diff", ""), "review");
        assert_eq!(parse_role("no marker", "plain label"), DEFAULT_ROLE);
    }

    #[test]
    fn marker_with_spaces_is_not_a_role() {
        assert_eq!(parse_role("[not a role] task", ""), DEFAULT_ROLE);
    }

    #[test]
    fn strip_removes_marker() {
        assert_eq!(strip_role_prefix("[frontend]  build the page"), "build the page");
        assert_eq!(strip_role_prefix("build the page"), "build the page");
    }

    #[test]
    fn strip_keeps_bare_marker() {
        assert_eq!(strip_role_prefix("[frontend]"), "[frontend]");
    }
}
