//! Parsing of workflow `index.md` files and per-step Markdown files.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::DefinitionError;

/// The two mandatory H1 sections of a step file, plus the fully resolved
/// step text used for the definition blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStep {
    pub orchestrator_guidance: String,
    pub client_instructions: String,
    pub full_content: String,
}

/// Matches ordered (`1.`) or unordered (`-`, `*`, `+`) list items whose
/// body is a Markdown link to a step file.
fn step_link_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[ \t]*(?:\d+\.|[-*+])[ \t]*\[([^\]]+)\]\(([^)]+\.md)\)")
            .expect("valid step link regex")
    })
}

fn plan_heading_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^##[ \t]+High-Level Plan[ \t]*$").expect("valid plan heading regex")
    })
}

/// Extract the ordered `(step_id, relative_path)` pairs from an index
/// file. The step list is the link list of the `## High-Level Plan`
/// section when one exists, otherwise the first link list in the file.
pub fn parse_index(
    content: &str,
    index_path: &Path,
) -> Result<Vec<(String, String)>, DefinitionError> {
    let scan_region = plan_section(content).unwrap_or(content);

    let mut steps: Vec<(String, String)> = Vec::new();
    for line in scan_region.lines() {
        let Some(caps) = step_link_pattern().captures(line) else {
            continue;
        };
        let step_name = caps[1].trim().to_string();
        let relative_path = caps[2].trim().to_string();
        if step_name.is_empty() || relative_path.is_empty() {
            continue;
        }

        if steps.iter().any(|(name, _)| name == &step_name) {
            return Err(DefinitionError::parsing(
                format!(
                    "duplicate step name '{}' in workflow index file: {}",
                    step_name,
                    index_path.display()
                ),
                Some(index_path.to_path_buf()),
            ));
        }
        steps.push((step_name, relative_path));
    }

    if steps.is_empty() {
        return Err(DefinitionError::parsing(
            format!(
                "no steps found in workflow index file: {}; steps must be listed as Markdown links",
                index_path.display()
            ),
            Some(index_path.to_path_buf()),
        ));
    }

    Ok(steps)
}

/// Slice out the body of the `## High-Level Plan` section, up to the
/// next `##` heading.
fn plan_section(content: &str) -> Option<&str> {
    let heading = plan_heading_pattern().find(content)?;
    let body = &content[heading.end()..];

    static NEXT_HEADING: OnceLock<Regex> = OnceLock::new();
    let next = NEXT_HEADING
        .get_or_init(|| Regex::new(r"(?m)^##[ \t]").expect("valid heading regex"))
        .find(body);

    Some(match next {
        Some(m) => &body[..m.start()],
        None => body,
    })
}

/// Extract the `# Orchestrator Guidance` and `# Client Instructions`
/// section bodies. Markers are matched case-insensitively at the start
/// of a line with surrounding whitespace tolerated.
pub fn extract_step_sections(content: &str) -> (Option<String>, Option<String>) {
    static GUIDANCE: OnceLock<Regex> = OnceLock::new();
    static INSTRUCTIONS: OnceLock<Regex> = OnceLock::new();
    let markers: [(&Regex, usize); 2] = [
        (
            GUIDANCE.get_or_init(|| {
                Regex::new(r"(?im)^[ \t]*#[ \t]*Orchestrator Guidance[ \t]*$")
                    .expect("valid guidance regex")
            }),
            0,
        ),
        (
            INSTRUCTIONS.get_or_init(|| {
                Regex::new(r"(?im)^[ \t]*#[ \t]*Client Instructions[ \t]*$")
                    .expect("valid instructions regex")
            }),
            1,
        ),
    ];

    // Collect marker line positions, then take the text between each
    // marker and the next one (or end of file).
    let mut found: Vec<(usize, usize, usize)> = Vec::new();
    for (pattern, key) in markers {
        for m in pattern.find_iter(content) {
            found.push((m.start(), m.end(), key));
        }
    }
    found.sort_by_key(|(start, _, _)| *start);

    let mut sections: [Option<String>; 2] = [None, None];
    for (i, (_, marker_end, key)) in found.iter().enumerate() {
        let body_end = found
            .get(i + 1)
            .map(|(next_start, _, _)| *next_start)
            .unwrap_or(content.len());
        sections[*key] = Some(content[*marker_end..body_end].trim().to_string());
    }

    let [guidance, instructions] = sections;
    (guidance, instructions)
}

/// Parse one step file's (include-resolved) content, validating that
/// both mandatory sections are present and non-empty.
pub fn parse_step_content(content: &str, path: &Path) -> Result<ParsedStep, DefinitionError> {
    let (guidance, instructions) = extract_step_sections(content);

    let orchestrator_guidance = match guidance {
        Some(text) if !text.is_empty() => text,
        _ => {
            return Err(DefinitionError::parsing(
                format!(
                    "mandatory '# Orchestrator Guidance' section not found or empty in step file: {}",
                    path.display()
                ),
                Some(path.to_path_buf()),
            ))
        }
    };
    let client_instructions = match instructions {
        Some(text) if !text.is_empty() => text,
        _ => {
            return Err(DefinitionError::parsing(
                format!(
                    "mandatory '# Client Instructions' section not found or empty in step file: {}",
                    path.display()
                ),
                Some(path.to_path_buf()),
            ))
        }
    };

    Ok(ParsedStep {
        orchestrator_guidance,
        client_instructions,
        full_content: content.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn index_path() -> PathBuf {
        PathBuf::from("/tmp/wf/index.md")
    }

    #[test]
    fn test_parse_index_unordered_list() {
        let content = "# My Workflow\n\n- [Greet](steps/greet.md)\n- [Farewell](steps/farewell.md)\n";
        let steps = parse_index(content, &index_path()).unwrap();
        assert_eq!(
            steps,
            vec![
                ("Greet".to_string(), "steps/greet.md".to_string()),
                ("Farewell".to_string(), "steps/farewell.md".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_index_ordered_list() {
        let content = "1. [First](steps/first.md)\n2. [Second](steps/second.md)\n";
        let steps = parse_index(content, &index_path()).unwrap();
        assert_eq!(steps[0].0, "First");
        assert_eq!(steps[1].0, "Second");
    }

    #[test]
    fn test_parse_index_prefers_high_level_plan_section() {
        let content = "\
# Workflow

Some prose with a stray link list:

- [Ignored](steps/ignored.md)

## High-Level Plan

1. [Real](steps/real.md)

## Notes

- [AlsoIgnored](steps/also.md)
";
        let steps = parse_index(content, &index_path()).unwrap();
        assert_eq!(steps, vec![("Real".to_string(), "steps/real.md".to_string())]);
    }

    #[test]
    fn test_parse_index_duplicate_step_rejected() {
        let content = "- [Greet](steps/greet.md)\n- [Greet](steps/greet2.md)\n";
        let err = parse_index(content, &index_path()).unwrap_err();
        assert!(err.to_string().contains("duplicate step name 'Greet'"));
    }

    #[test]
    fn test_parse_index_no_steps_rejected() {
        let err = parse_index("# Empty\n\njust prose\n", &index_path()).unwrap_err();
        assert!(err.to_string().contains("no steps found"));
    }

    #[test]
    fn test_extract_sections_basic() {
        let content = "\
# Goal

Say hello.

# Orchestrator Guidance

Move to Farewell on success.

# Client Instructions

Greet the user warmly.
";
        let (guidance, instructions) = extract_step_sections(content);
        assert_eq!(guidance.as_deref(), Some("Move to Farewell on success."));
        assert_eq!(instructions.as_deref(), Some("Greet the user warmly."));
    }

    #[test]
    fn test_extract_sections_header_variants() {
        let content = "# orchestrator guidance\nG\n\n  #   Client Instructions  \nC\n";
        let (guidance, instructions) = extract_step_sections(content);
        assert_eq!(guidance.as_deref(), Some("G"));
        assert_eq!(instructions.as_deref(), Some("C"));
    }

    #[test]
    fn test_parse_step_missing_instructions_fails() {
        let content = "# Orchestrator Guidance\nOnly guidance here.\n";
        let err = parse_step_content(content, &index_path()).unwrap_err();
        assert!(err.to_string().contains("# Client Instructions"));
    }

    #[test]
    fn test_parse_step_empty_guidance_fails() {
        let content = "# Orchestrator Guidance\n\n# Client Instructions\nDo it.\n";
        let err = parse_step_content(content, &index_path()).unwrap_err();
        assert!(err.to_string().contains("# Orchestrator Guidance"));
    }

    #[test]
    fn test_parse_step_preserves_extra_sections_in_full_content() {
        let content = "# Goal\nG\n\n# Orchestrator Guidance\nOG\n\n# Client Instructions\nCI\n";
        let step = parse_step_content(content, &index_path()).unwrap();
        assert_eq!(step.orchestrator_guidance, "OG");
        assert_eq!(step.client_instructions, "CI");
        assert!(step.full_content.contains("# Goal"));
    }
}
