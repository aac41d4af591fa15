use crate::error::{PkgupError, Result};
use crate::manifest::{Constraint, Dependency, ManifestKind, Requirement, normalize_name};
use std::collections::BTreeMap;
use toml_edit::{DocumentMut, Item, Value};

const SECTIONS: [&str; 2] = ["packages", "dev-packages"];

/// Entry keys Pipenv turns into environment markers.
const MARKER_KEYS: [&str; 10] = [
    "os_name",
    "sys_platform",
    "platform_machine",
    "platform_python_implementation",
    "platform_release",
    "platform_system",
    "platform_version",
    "python_version",
    "python_full_version",
    "implementation_name",
];

const VCS_KEYS: [&str; 4] = ["git", "hg", "svn", "bzr"];

fn load_document(content: &str) -> Result<DocumentMut> {
    content
        .parse::<DocumentMut>()
        .map_err(|e| PkgupError::ManifestParse(format!("Failed to parse Pipfile: {e}")))
}

/// Extract the version specifier string of an entry, if it has one.
fn extract_version(item: &Item) -> Option<&str> {
    if let Some(spec) = item.as_str() {
        return Some(spec);
    }

    if let Some(inline_table) = item.as_inline_table() {
        return inline_table.get("version").and_then(|v| v.as_str());
    }

    if let Some(table) = item.as_table() {
        return table.get("version").and_then(|v| v.as_str());
    }

    None
}

/// Replace the version specifier of an entry, keeping its decoration.
fn update_version(item: &mut Item, spec: &str) -> bool {
    fn replace(value: &mut Value, spec: &str) {
        let decor = value.decor().clone();
        *value = Value::from(spec);
        *value.decor_mut() = decor;
    }

    if let Some(value) = item.as_value_mut() {
        if value.is_str() {
            replace(value, spec);
            return true;
        }
        if let Some(inline_table) = value.as_inline_table_mut() {
            if let Some(version) = inline_table.get_mut("version") {
                replace(version, spec);
                return true;
            }
            return false;
        }
    }

    if let Some(table) = item.as_table_mut() {
        if let Some(version) = table.get_mut("version").and_then(|v| v.as_value_mut()) {
            replace(version, spec);
            return true;
        }
    }

    false
}

pub fn parse(content: &str) -> Result<Vec<Dependency>> {
    let doc = load_document(content)?;
    let mut dependencies = Vec::new();

    for section in SECTIONS {
        let Some(table) = doc.get(section).and_then(|s| s.as_table()) else {
            continue;
        };

        for (name, item) in table.iter() {
            let current_constraint = match extract_version(item) {
                Some(spec) => Constraint::parse(spec).ok_or_else(|| {
                    PkgupError::ManifestParse(format!(
                        "Pipfile [{section}] {name}: invalid version specifier '{spec}'"
                    ))
                })?,
                None => Constraint::unpinned(),
            };

            dependencies.push(Dependency {
                name: name.to_string(),
                current_constraint,
                source: ManifestKind::Pipfile,
            });
        }
    }

    Ok(dependencies)
}

/// Installable requirements for every entry: extras and markers are kept,
/// path and VCS entries install from their source instead of the index.
pub fn requirements(content: &str) -> Result<Vec<Requirement>> {
    let doc = load_document(content)?;
    let mut requirements = Vec::new();

    for section in SECTIONS {
        let Some(table) = doc.get(section).and_then(|s| s.as_table()) else {
            continue;
        };
        for (name, item) in table.iter() {
            requirements.push(entry_requirement(name, item));
        }
    }

    Ok(requirements)
}

fn entry_requirement(name: &str, item: &Item) -> Requirement {
    let mut requirement = Requirement::new(name);
    if let Some(spec) = extract_version(item).map(str::trim) {
        if spec != "*" {
            requirement.specifier = spec.replace(' ', "");
        }
    }

    let Some(entry) = item.as_table_like() else {
        return requirement;
    };
    let text = |key: &str| entry.get(key).and_then(Item::as_str).map(str::trim);

    requirement.extras = entry
        .get("extras")
        .and_then(Item::as_array)
        .map(|extras| {
            extras
                .iter()
                .filter_map(|extra| extra.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let mut markers: Vec<String> = text("markers").map(str::to_string).into_iter().collect();
    markers.extend(
        MARKER_KEYS
            .iter()
            .filter_map(|key| text(key).map(|expr| format!("{key} {expr}"))),
    );
    requirement.marker = match markers.len() {
        0 => None,
        1 => markers.pop(),
        _ => Some(
            markers
                .iter()
                .map(|m| format!("({m})"))
                .collect::<Vec<_>>()
                .join(" and "),
        ),
    };

    requirement.editable = entry.get("editable").and_then(Item::as_bool).unwrap_or(false);
    if let Some(path) = text("path").or_else(|| text("file")) {
        requirement.location = Some(path.to_string());
    } else if let Some((vcs, url)) = VCS_KEYS.iter().find_map(|vcs| text(vcs).map(|url| (*vcs, url))) {
        let scheme = if url.starts_with(&format!("{vcs}+")) {
            String::new()
        } else {
            format!("{vcs}+")
        };
        let reference = text("ref").map(|r| format!("@{r}")).unwrap_or_default();
        requirement.location = Some(format!("{scheme}{url}{reference}#egg={name}"));
    }

    requirement
}

pub fn rewrite(content: &str, pins: &BTreeMap<String, String>) -> Result<String> {
    let mut doc = load_document(content)?;

    for section in SECTIONS {
        let Some(table) = doc.get_mut(section).and_then(|s| s.as_table_mut()) else {
            continue;
        };

        for (name, item) in table.iter_mut() {
            let Some(new_version) = pins.get(&normalize_name(name.get())) else {
                continue;
            };
            let Some(spec) = extract_version(item).and_then(Constraint::parse) else {
                continue;
            };
            if spec.baseline().is_none() {
                continue;
            }

            let rewritten = spec.with_version(new_version).to_string();
            if !update_version(item, &rewritten) {
                tracing::warn!(package = name.get(), "could not rewrite Pipfile entry");
            }
        }
    }

    Ok(doc.to_string())
}
