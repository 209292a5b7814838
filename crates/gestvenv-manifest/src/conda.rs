//! Conda `environment.yml` parsing.
//!
//! Conda-specific packages cannot be installed by the pip-family backends,
//! so they are recorded in [`DependencySet::conda_only`] and skipped by the
//! install flow unless the caller opts in. Entries of the nested `pip:`
//! list go through the normal requirement screening.

use std::path::Path;

use serde::Deserialize;

use crate::{DependencySet, ManifestError, Requirement, RequirementWarning, SourceKind};

#[derive(Debug, Deserialize)]
struct RawEnvironmentYml {
    name: Option<String>,
    dependencies: Option<Vec<serde_yaml::Value>>,
}

pub fn parse_conda_yaml(path: &Path) -> Result<DependencySet, ManifestError> {
    let content = crate::read_manifest(path)?;
    let raw: RawEnvironmentYml =
        serde_yaml::from_str(&content).map_err(|err| ManifestError::Syntax {
            path: path.to_path_buf(),
            line: err.location().map(|at| at.line()).unwrap_or(0),
            message: err.to_string(),
        })?;

    let mut set = DependencySet {
        source_kind: Some(SourceKind::Conda),
        project: raw.name,
        ..DependencySet::default()
    };

    for dep in raw.dependencies.unwrap_or_default() {
        match dep {
            serde_yaml::Value::String(spec) => {
                if is_python_dep(&spec) {
                    set.python_version_constraint = extract_python_version(&spec);
                } else {
                    set.conda_only.push(spec);
                }
            }
            serde_yaml::Value::Mapping(map) => {
                if let Some(serde_yaml::Value::Sequence(pip_list)) =
                    map.get(serde_yaml::Value::String("pip".to_string()))
                {
                    for entry in pip_list {
                        let serde_yaml::Value::String(spec) = entry else {
                            continue;
                        };
                        match spec.parse::<Requirement>() {
                            Ok(requirement) => set.main.push(requirement),
                            Err(err) => set.warnings.push(RequirementWarning {
                                line: 0,
                                text: spec.clone(),
                                reason: err.to_string(),
                            }),
                        }
                    }
                }
                // Other mapping keys (like prefix:) are ignored.
            }
            _ => {}
        }
    }
    Ok(set)
}

/// Matches "python", "python=3.10", "python>=3.9", not "pythonnet".
fn is_python_dep(dep: &str) -> bool {
    let name = dep.split(['=', '>', '<', '!', ' ']).next().unwrap_or("");
    name == "python"
}

/// Extract `major.minor` from a conda python constraint like
/// `python=3.10.*` or `python>=3.9,<4`.
fn extract_python_version(dep: &str) -> Option<String> {
    let version_part = dep
        .trim_start_matches("python")
        .trim_start_matches(">=")
        .trim_start_matches("<=")
        .trim_start_matches("==")
        .trim_start_matches('=')
        .trim_start_matches('>')
        .trim_start_matches('<')
        .trim();
    if version_part.is_empty() {
        return None;
    }
    let first_constraint = version_part.split(',').next().unwrap_or(version_part);
    let cleaned = first_constraint.trim_end_matches(".*");
    let parts: Vec<&str> = cleaned.split('.').collect();
    if parts.len() >= 2 {
        Some(format!("{}.{}", parts[0], parts[1]))
    } else if !parts.is_empty() && !parts[0].is_empty() {
        Some(parts[0].to_string())
    } else {
        None
    }
}
