//! Recursive `{{file:...}}` include resolution for workflow Markdown.
//!
//! Includes are expanded by textual substitution before any section
//! extraction happens. Paths resolve relative to the including file.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::DefinitionError;

/// Maximum nesting depth for `{{file:...}}` includes.
pub const MAX_INCLUDE_DEPTH: usize = 10;

fn include_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{file:([^}]+)\}\}").expect("valid include regex"))
}

/// Expand all includes in `content`, where `content` was read from
/// `origin`. Fails on missing targets, cycles, and chains deeper than
/// [`MAX_INCLUDE_DEPTH`].
pub fn resolve_includes(
    content: &str,
    origin: &Path,
    base_dir: &Path,
) -> Result<String, DefinitionError> {
    let mut visited = vec![origin.to_path_buf()];
    resolve_recursive(content, base_dir, &mut visited, 0)
}

fn resolve_recursive(
    content: &str,
    base_dir: &Path,
    visited: &mut Vec<PathBuf>,
    depth: usize,
) -> Result<String, DefinitionError> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(DefinitionError::parsing(
            format!(
                "maximum include depth ({}) exceeded; include chain: {}",
                MAX_INCLUDE_DEPTH,
                format_chain(visited)
            ),
            visited.last().cloned(),
        ));
    }

    let mut resolved = content.to_string();
    // Substitute from the end so earlier match offsets stay valid.
    let matches: Vec<_> = include_pattern()
        .captures_iter(&resolved)
        .map(|c| {
            let m = c.get(0).expect("whole match");
            (m.start(), m.end(), c[1].trim().to_string())
        })
        .collect();

    for (start, end, relative) in matches.into_iter().rev() {
        if relative.is_empty() {
            continue;
        }

        let target = base_dir.join(&relative);
        if !target.is_file() {
            return Err(DefinitionError::parsing(
                format!(
                    "included file not found: {} (referenced from {})",
                    target.display(),
                    visited
                        .last()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| base_dir.display().to_string())
                ),
                Some(target),
            ));
        }
        let target = target.canonicalize().map_err(|e| {
            DefinitionError::parsing(
                format!("cannot resolve include path '{}': {}", relative, e),
                Some(base_dir.join(&relative)),
            )
        })?;

        if visited.contains(&target) {
            return Err(DefinitionError::parsing(
                format!(
                    "circular include detected: {} already on include chain {}",
                    target.display(),
                    format_chain(visited)
                ),
                Some(target),
            ));
        }

        let included = std::fs::read_to_string(&target).map_err(|e| {
            DefinitionError::parsing(
                format!("error reading included file {}: {}", target.display(), e),
                Some(target.clone()),
            )
        })?;

        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| base_dir.to_path_buf());
        visited.push(target);
        let expanded = resolve_recursive(&included, &parent, visited, depth + 1)?;
        visited.pop();

        resolved.replace_range(start..end, &expanded);
    }

    Ok(resolved)
}

fn format_chain(visited: &[PathBuf]) -> String {
    visited
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}
