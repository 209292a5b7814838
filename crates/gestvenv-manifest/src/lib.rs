//! Parse project manifests (`pyproject.toml`, requirements files, `Pipfile`,
//! conda `environment.yml`) into one normalized [`DependencySet`].
//!
//! Parsing is strict about shapes (a malformed manifest is fatal) but
//! collects per-line requirement rejections as warnings so that one bad
//! spec does not sink an otherwise usable file.

use std::io;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::requirement::{
    Requirement, RequirementParseError, RequirementSource, VersionOperator, VersionSpecifier,
    VersionSpecifiers,
};
pub use crate::version::{Version, VersionParseError};

mod conda;
mod pipfile;
mod pyproject;
mod requirement;
mod requirements_txt;
mod version;

pub use crate::conda::parse_conda_yaml;
pub use crate::pipfile::parse_pipfile;
pub use crate::pyproject::parse_pyproject;
pub use crate::requirements_txt::{classify_group, parse_requirements, parse_requirements_files};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest not found at `{}`", _0.display())]
    Missing(PathBuf),
    #[error("syntax error in `{}` at line {line}: {message}", path.display())]
    Syntax {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Which kind of manifest a [`DependencySet`] was parsed from.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Pyproject,
    Requirements,
    Pipfile,
    Conda,
}

/// A non-fatal rejection collected while parsing.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RequirementWarning {
    /// 1-based line in the manifest, 0 when the format has no line notion.
    pub line: usize,
    /// The offending text, verbatim.
    pub text: String,
    pub reason: String,
}

/// The normalized result of parsing one manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencySet {
    /// Ordered main requirements.
    pub main: Vec<Requirement>,
    /// Ordered requirements per named group.
    pub optional: IndexMap<String, Vec<Requirement>>,
    /// `requires-python` style constraint, verbatim.
    pub python_version_constraint: Option<String>,
    pub source_kind: Option<SourceKind>,
    /// Project name, when the manifest declares one.
    pub project: Option<String>,
    /// Conda-only packages, recorded but skipped by the install flow
    /// unless the caller opts in.
    pub conda_only: Vec<String>,
    /// Rejected specs that did not abort the parse.
    pub warnings: Vec<RequirementWarning>,
}

impl DependencySet {
    /// All requirements: main plus the given groups, in manifest order.
    pub fn with_groups<'a>(
        &'a self,
        groups: impl IntoIterator<Item = &'a str>,
    ) -> Vec<Requirement> {
        let mut all = self.main.clone();
        for group in groups {
            if let Some(reqs) = self.optional.get(group) {
                all.extend(reqs.iter().cloned());
            }
        }
        all
    }

    /// Every group name declared by the manifest.
    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.optional.keys().map(String::as_str)
    }
}

/// Parse a manifest by file name shape: `pyproject.toml`, `Pipfile`,
/// `environment.yml`/`.yaml`, anything else as a requirements file.
pub fn parse_manifest(path: &Path) -> Result<DependencySet, ManifestError> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    match file_name {
        "pyproject.toml" => parse_pyproject(path),
        "Pipfile" => parse_pipfile(path),
        "environment.yml" | "environment.yaml" => parse_conda_yaml(path),
        _ => parse_requirements(path),
    }
}

pub(crate) fn read_manifest(path: &Path) -> Result<String, ManifestError> {
    if !path.is_file() {
        return Err(ManifestError::Missing(path.to_path_buf()));
    }
    Ok(fs_err::read_to_string(path)?)
}
