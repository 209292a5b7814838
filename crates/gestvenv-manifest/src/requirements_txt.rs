//! Requirements-file parsing with security screening.
//!
//! Lines that could smuggle shell commands or redirect resolution to an
//! attacker-controlled index are rejected; rejections are collected as
//! warnings unless the file itself is unreadable.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::requirement::{parse_vcs_url, RequirementSource};
use crate::{DependencySet, ManifestError, Requirement, RequirementWarning, SourceKind};

/// Characters that would be interpreted by a shell if a spec were ever
/// interpolated into a command line.
const SHELL_METACHARACTERS: &[char] = &[';', '|', '&', '`', '$', '(', ')'];

/// Pip options that change where packages come from. Never honored from a
/// manifest.
const INDEX_ALTERING_FLAGS: &[&str] = &[
    "--index-url",
    "--extra-index-url",
    "--trusted-host",
    "-i",
];

/// Parse one requirements file into a [`DependencySet`].
pub fn parse_requirements(path: &Path) -> Result<DependencySet, ManifestError> {
    let content = crate::read_manifest(path)?;
    let mut set = DependencySet {
        source_kind: Some(SourceKind::Requirements),
        ..DependencySet::default()
    };

    for (index, raw_line) in content.lines().enumerate() {
        let line_number = index + 1;
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        match parse_line(line) {
            Ok(requirement) => set.main.push(requirement),
            Err(reason) => {
                debug!("rejecting requirement line {line_number}: {reason}");
                set.warnings.push(RequirementWarning {
                    line: line_number,
                    text: raw_line.trim().to_string(),
                    reason,
                });
            }
        }
    }
    Ok(set)
}

/// Classify a requirements file into a dependency group by its name.
///
/// `requirements-dev.txt` style patterns map onto the conventional
/// `dev`/`test`/`docs` groups; anything else is main.
pub fn classify_group(path: &Path) -> Option<&'static str> {
    let stem = path.file_stem()?.to_str()?.to_lowercase();
    ["dev", "test", "docs"]
        .into_iter()
        .find(|group| stem.ends_with(&format!("-{group}")))
}

/// Parse several requirements files, classifying each into main or a group.
pub fn parse_requirements_files(paths: &[PathBuf]) -> Result<DependencySet, ManifestError> {
    let mut merged = DependencySet {
        source_kind: Some(SourceKind::Requirements),
        ..DependencySet::default()
    };
    for path in paths {
        let mut parsed = parse_requirements(path)?;
        merged.warnings.append(&mut parsed.warnings);
        // Only classify into groups when more than one file is present.
        match (paths.len() > 1).then(|| classify_group(path)).flatten() {
            Some(group) => {
                merged
                    .optional
                    .entry(group.to_string())
                    .or_default()
                    .append(&mut parsed.main);
            }
            None => merged.main.append(&mut parsed.main),
        }
    }
    Ok(merged)
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(at) => &line[..at],
        None => line,
    }
}

fn parse_line(line: &str) -> Result<Requirement, String> {
    if let Some(meta) = line.chars().find(|ch| SHELL_METACHARACTERS.contains(ch)) {
        return Err(format!("shell metacharacter `{meta}` is not allowed"));
    }

    // Editable installs: `-e <path-or-vcs-url>`.
    if let Some(rest) = line
        .strip_prefix("-e ")
        .or_else(|| line.strip_prefix("--editable "))
    {
        return parse_editable(rest.trim());
    }

    if line.starts_with('-') {
        let flag = line.split_whitespace().next().unwrap_or(line);
        let altering = INDEX_ALTERING_FLAGS
            .iter()
            .any(|known| flag == *known || line.starts_with(&format!("{known}=")));
        return if altering {
            Err(format!("index-altering option `{flag}` is not honored"))
        } else {
            Err(format!("pip option `{flag}` is not a requirement"))
        };
    }

    if is_scheme_only(line) {
        return Err("URL has a scheme but no location".to_string());
    }

    line.parse::<Requirement>().map_err(|err| err.to_string())
}

fn parse_editable(rest: &str) -> Result<Requirement, String> {
    if rest.is_empty() {
        return Err("editable spec is missing its target".to_string());
    }
    if rest.starts_with("git+") {
        let url = parse_vcs_url(rest).map_err(|err| err.to_string())?;
        let name = url
            .fragment()
            .and_then(|fragment| fragment.split('&').find_map(|pair| pair.strip_prefix("egg=")))
            .ok_or_else(|| "editable VCS spec is missing `#egg=`".to_string())?
            .to_string();
        return Ok(Requirement {
            name,
            extras: Vec::new(),
            version_spec: crate::VersionSpecifiers::default(),
            source: RequirementSource::Vcs { url },
        });
    }
    if rest.contains("://") {
        return Err("editable specs accept only paths and git+ URLs".to_string());
    }
    let path = PathBuf::from(rest);
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("local")
        .to_string();
    Ok(Requirement {
        name,
        extras: Vec::new(),
        version_spec: crate::VersionSpecifiers::default(),
        source: RequirementSource::EditablePath { path },
    })
}

fn is_scheme_only(line: &str) -> bool {
    line.split_once("://")
        .is_some_and(|(_, rest)| rest.trim().is_empty())
}
