//! `Pipfile` parsing: TOML with `[packages]` and `[dev-packages]` tables.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;

use crate::requirement::RequirementSource;
use crate::{
    DependencySet, ManifestError, Requirement, RequirementWarning, SourceKind, VersionSpecifiers,
};

#[derive(Debug, Deserialize)]
struct Pipfile {
    #[serde(default)]
    packages: IndexMap<String, toml::Value>,
    #[serde(default, rename = "dev-packages")]
    dev_packages: IndexMap<String, toml::Value>,
    #[serde(default)]
    requires: Requires,
}

#[derive(Debug, Default, Deserialize)]
struct Requires {
    python_version: Option<String>,
}

pub fn parse_pipfile(path: &Path) -> Result<DependencySet, ManifestError> {
    let content = crate::read_manifest(path)?;
    let parsed: Pipfile = toml::from_str(&content).map_err(|err| ManifestError::Syntax {
        path: path.to_path_buf(),
        line: err
            .span()
            .map(|span| content[..span.start].lines().count())
            .unwrap_or(0),
        message: err.message().to_string(),
    })?;

    let mut set = DependencySet {
        source_kind: Some(SourceKind::Pipfile),
        python_version_constraint: parsed.requires.python_version,
        ..DependencySet::default()
    };

    for (name, value) in &parsed.packages {
        push_entry(&mut set, None, name, value);
    }
    for (name, value) in &parsed.dev_packages {
        push_entry(&mut set, Some("dev"), name, value);
    }
    Ok(set)
}

fn push_entry(set: &mut DependencySet, group: Option<&str>, name: &str, value: &toml::Value) {
    match entry_to_requirement(name, value) {
        Ok(requirement) => match group {
            Some(group) => set
                .optional
                .entry(group.to_string())
                .or_default()
                .push(requirement),
            None => set.main.push(requirement),
        },
        Err(reason) => set.warnings.push(RequirementWarning {
            line: 0,
            text: format!("{name} = {value}"),
            reason,
        }),
    }
}

fn entry_to_requirement(name: &str, value: &toml::Value) -> Result<Requirement, String> {
    match value {
        // `requests = "*"` or `requests = ">=2.28"`.
        toml::Value::String(constraint) => {
            let spec = if constraint == "*" {
                String::new()
            } else {
                constraint.clone()
            };
            format!("{name}{spec}")
                .parse::<Requirement>()
                .map_err(|err| err.to_string())
        }
        // `requests = { version = "…", extras = […], path = "…", editable = true }`.
        toml::Value::Table(table) => {
            if table
                .get("editable")
                .and_then(toml::Value::as_bool)
                .unwrap_or(false)
            {
                let path = table
                    .get("path")
                    .and_then(toml::Value::as_str)
                    .ok_or_else(|| "editable entries need a `path`".to_string())?;
                return Ok(Requirement {
                    name: name.to_string(),
                    extras: Vec::new(),
                    version_spec: VersionSpecifiers::default(),
                    source: RequirementSource::EditablePath {
                        path: PathBuf::from(path),
                    },
                });
            }
            let mut spec = name.to_string();
            if let Some(extras) = table.get("extras").and_then(toml::Value::as_array) {
                let extras: Vec<&str> = extras
                    .iter()
                    .filter_map(toml::Value::as_str)
                    .collect();
                if !extras.is_empty() {
                    spec.push_str(&format!("[{}]", extras.join(",")));
                }
            }
            if let Some(version) = table.get("version").and_then(toml::Value::as_str) {
                if version != "*" {
                    spec.push_str(version);
                }
            }
            spec.parse::<Requirement>().map_err(|err| err.to_string())
        }
        other => Err(format!("unsupported Pipfile entry shape: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_pipfile(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Pipfile");
        fs_err::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn parses_packages_and_dev_packages() {
        let (_dir, path) = write_pipfile(
            r#"
[packages]
requests = ">=2.28"
rich = "*"
uvicorn = { version = "==0.30.1", extras = ["standard"] }

[dev-packages]
pytest = "*"

[requires]
python_version = "3.11"
"#,
        );
        let set = parse_pipfile(&path).unwrap();
        assert_eq!(set.main.len(), 3);
        assert_eq!(set.optional.get("dev").unwrap().len(), 1);
        assert_eq!(set.python_version_constraint.as_deref(), Some("3.11"));
        assert_eq!(set.main[2].extras, ["standard"]);
    }

    #[test]
    fn editable_path_entry() {
        let (_dir, path) = write_pipfile(
            r#"
[packages]
mypkg = { path = "./libs/mypkg", editable = true }
"#,
        );
        let set = parse_pipfile(&path).unwrap();
        assert!(matches!(
            set.main[0].source,
            RequirementSource::EditablePath { .. }
        ));
    }

    #[test]
    fn malformed_pipfile_is_fatal() {
        let (_dir, path) = write_pipfile("[packages\n");
        assert!(matches!(
            parse_pipfile(&path),
            Err(ManifestError::Syntax { .. })
        ));
    }
}
