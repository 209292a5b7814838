//! `pyproject.toml` parsing: PEP 621 `[project]` first, with a fallback to
//! `[tool.poetry.dependencies]` for older projects.

use std::path::Path;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::{DependencySet, ManifestError, Requirement, RequirementWarning, SourceKind};

#[derive(Debug, Deserialize)]
struct PyProjectToml {
    project: Option<Project>,
    tool: Option<Tool>,
}

#[derive(Debug, Deserialize)]
struct Project {
    name: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default, rename = "optional-dependencies")]
    optional_dependencies: IndexMap<String, Vec<String>>,
    #[serde(rename = "requires-python")]
    requires_python: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Tool {
    poetry: Option<Poetry>,
}

#[derive(Debug, Deserialize)]
struct Poetry {
    name: Option<String>,
    #[serde(default)]
    dependencies: IndexMap<String, toml::Value>,
    #[serde(default, rename = "dev-dependencies")]
    dev_dependencies: IndexMap<String, toml::Value>,
}

pub fn parse_pyproject(path: &Path) -> Result<DependencySet, ManifestError> {
    let content = crate::read_manifest(path)?;
    let parsed: PyProjectToml =
        toml::from_str(&content).map_err(|err| ManifestError::Syntax {
            path: path.to_path_buf(),
            line: err
                .span()
                .map(|span| content[..span.start].lines().count())
                .unwrap_or(0),
            message: err.message().to_string(),
        })?;

    let mut set = DependencySet {
        source_kind: Some(SourceKind::Pyproject),
        ..DependencySet::default()
    };

    if let Some(project) = parsed.project {
        set.project = project.name;
        set.python_version_constraint = project.requires_python;
        for (index, spec) in project.dependencies.iter().enumerate() {
            push_spec(&mut set, None, spec, index + 1);
        }
        for (group, specs) in &project.optional_dependencies {
            for spec in specs {
                push_spec(&mut set, Some(group), spec, 0);
            }
        }
        return Ok(set);
    }

    let Some(poetry) = parsed.tool.and_then(|tool| tool.poetry) else {
        return Err(ManifestError::Syntax {
            path: path.to_path_buf(),
            line: 0,
            message: "neither [project] nor [tool.poetry] is present".to_string(),
        });
    };

    set.project = poetry.name;
    for (name, value) in &poetry.dependencies {
        if name == "python" {
            set.python_version_constraint = poetry_constraint(value);
            continue;
        }
        push_spec(&mut set, None, &poetry_spec(name, value), 0);
    }
    for (name, value) in &poetry.dev_dependencies {
        push_spec(&mut set, Some("dev"), &poetry_spec(name, value), 0);
    }
    Ok(set)
}

fn push_spec(set: &mut DependencySet, group: Option<&str>, spec: &str, line: usize) {
    match spec.parse::<Requirement>() {
        Ok(requirement) => match group {
            Some(group) => set
                .optional
                .entry(group.to_string())
                .or_default()
                .push(requirement),
            None => set.main.push(requirement),
        },
        Err(err) => set.warnings.push(RequirementWarning {
            line,
            text: spec.to_string(),
            reason: err.to_string(),
        }),
    }
}

/// Render one poetry dependency as a PEP 508-ish spec string.
///
/// Caret and tilde constraints are translated to their compatible-release
/// lower bound; tables keep their `version` key.
fn poetry_spec(name: &str, value: &toml::Value) -> String {
    match poetry_constraint(value) {
        Some(constraint) if constraint != "*" => {
            let translated = translate_poetry_constraint(&constraint);
            format!("{name}{translated}")
        }
        _ => name.to_string(),
    }
}

fn poetry_constraint(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(text) => Some(text.clone()),
        toml::Value::Table(table) => table
            .get("version")
            .and_then(|version| version.as_str())
            .map(ToString::to_string),
        _ => None,
    }
}

fn translate_poetry_constraint(constraint: &str) -> String {
    let trimmed = constraint.trim();
    if let Some(rest) = trimmed.strip_prefix('^') {
        format!(">={rest}")
    } else if let Some(rest) = trimmed.strip_prefix('~') {
        format!("~={rest}")
    } else if trimmed
        .chars()
        .next()
        .is_some_and(|ch| ch.is_ascii_digit())
    {
        format!("=={trimmed}")
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_pyproject(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pyproject.toml");
        fs_err::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn parses_pep_621() {
        let (_dir, path) = write_pyproject(
            r#"
[project]
name = "svc"
version = "0.1.0"
requires-python = ">=3.11"
dependencies = ["requests>=2.31", "click"]

[project.optional-dependencies]
dev = ["pytest", "ruff"]
"#,
        );
        let set = parse_pyproject(&path).unwrap();
        assert_eq!(set.project.as_deref(), Some("svc"));
        assert_eq!(set.python_version_constraint.as_deref(), Some(">=3.11"));
        assert_eq!(set.main.len(), 2);
        assert_eq!(set.optional.get("dev").unwrap().len(), 2);
    }

    #[test]
    fn falls_back_to_poetry() {
        let (_dir, path) = write_pyproject(
            r#"
[tool.poetry]
name = "legacy"

[tool.poetry.dependencies]
python = "^3.10"
requests = "^2.28"
rich = { version = "13.7.0" }

[tool.poetry.dev-dependencies]
pytest = "*"
"#,
        );
        let set = parse_pyproject(&path).unwrap();
        assert_eq!(set.project.as_deref(), Some("legacy"));
        assert_eq!(set.python_version_constraint.as_deref(), Some("^3.10"));
        let names: Vec<_> = set.main.iter().map(|req| req.name.as_str()).collect();
        assert_eq!(names, ["requests", "rich"]);
        assert!(set.main[0]
            .version_spec
            .contains(&"2.31.0".parse().unwrap()));
        assert_eq!(set.optional.get("dev").unwrap().len(), 1);
    }

    #[test]
    fn syntax_error_is_fatal() {
        let (_dir, path) = write_pyproject("[project\nname=");
        let err = parse_pyproject(&path).unwrap_err();
        assert!(matches!(err, ManifestError::Syntax { .. }));
    }

    #[test]
    fn missing_tables_are_a_syntax_error() {
        let (_dir, path) = write_pyproject("[build-system]\nrequires = []\n");
        let err = parse_pyproject(&path).unwrap_err();
        assert!(err.to_string().contains("neither"));
    }

    #[test]
    fn bad_specs_become_warnings() {
        let (_dir, path) = write_pyproject(
            r#"
[project]
name = "svc"
dependencies = ["requests", "-bad-name-"]
"#,
        );
        let set = parse_pyproject(&path).unwrap();
        assert_eq!(set.main.len(), 1);
        assert_eq!(set.warnings.len(), 1);
    }
}
