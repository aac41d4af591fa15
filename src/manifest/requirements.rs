use crate::error::{PkgupError, Result};
use crate::manifest::{Constraint, Dependency, ManifestKind, normalize_name};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;

static REQUIREMENT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?P<name>[A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?)(?P<extras>\s*\[[^\]]*\])?\s*(?:(?P<op>===|==|>=|<=|~=|!=|>|<)\s*(?P<version>[A-Za-z0-9.*+!_-]+))?(?P<rest>.*)$",
    )
    .expect("requirement pattern is valid")
});

/// Lines that carry no requirement of their own.
fn is_passthrough(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('-') || trimmed.contains("://")
}

fn match_line(line: &str, line_no: usize) -> Result<Captures<'_>> {
    let caps = REQUIREMENT_LINE.captures(line).ok_or_else(|| {
        PkgupError::ManifestParse(format!(
            "requirements.txt line {line_no}: cannot parse '{}'",
            line.trim()
        ))
    })?;

    let rest = caps.name("rest").map_or("", |m| m.as_str()).trim_start();
    let rest_ok = rest.is_empty() || rest.starts_with([',', ';', '#', '@']);
    if !rest_ok {
        return Err(PkgupError::ManifestParse(format!(
            "requirements.txt line {line_no}: unexpected '{rest}'"
        )));
    }

    Ok(caps)
}

pub fn parse(content: &str) -> Result<Vec<Dependency>> {
    let mut dependencies = Vec::new();

    for (index, line) in content.lines().enumerate() {
        if is_passthrough(line) {
            continue;
        }

        let caps = match_line(line, index + 1)?;
        let rest = caps.name("rest").map_or("", |m| m.as_str()).trim_end();

        let current_constraint = match (caps.name("op"), caps.name("version")) {
            (Some(op), Some(version)) => Constraint {
                operator: Some(op.as_str().to_string()),
                version: Some(version.as_str().to_string()),
                trailing: rest.to_string(),
            },
            _ => Constraint {
                trailing: rest.trim().to_string(),
                ..Constraint::unpinned()
            },
        };

        dependencies.push(Dependency {
            name: caps["name"].to_string(),
            current_constraint,
            source: ManifestKind::Requirements,
        });
    }

    Ok(dependencies)
}

/// Rewrite pinned versions in place. Only the operator and version of a
/// matching line change; comments, markers and line endings are kept.
pub fn rewrite(content: &str, pins: &BTreeMap<String, String>) -> Result<String> {
    let mut output = String::with_capacity(content.len());

    for (index, raw_line) in content.split_inclusive('\n').enumerate() {
        let (line, ending) = split_line_ending(raw_line);
        if is_passthrough(line) {
            output.push_str(raw_line);
            continue;
        }

        let caps = match_line(line, index + 1)?;
        let new_version = pins.get(&normalize_name(&caps["name"]));

        match (new_version, caps.name("op"), caps.name("version")) {
            (Some(new_version), Some(op), Some(version)) => {
                let constraint = Constraint {
                    operator: Some(op.as_str().to_string()),
                    version: Some(version.as_str().to_string()),
                    trailing: String::new(),
                };
                let mut rewritten = line.to_string();
                rewritten.replace_range(version.range(), new_version);
                rewritten.replace_range(op.range(), constraint.rewrite_operator());
                output.push_str(&rewritten);
                output.push_str(ending);
            }
            _ => output.push_str(raw_line),
        }
    }

    Ok(output)
}

fn split_line_ending(raw_line: &str) -> (&str, &str) {
    if let Some(line) = raw_line.strip_suffix("\r\n") {
        (line, "\r\n")
    } else if let Some(line) = raw_line.strip_suffix('\n') {
        (line, "\n")
    } else {
        (raw_line, "")
    }
}
