//! A single normalized requirement and its version specifiers.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::version::{Version, VersionParseError};

#[derive(Debug, Error)]
pub enum RequirementParseError {
    #[error("empty requirement")]
    Empty,
    #[error("invalid package name `{0}`")]
    InvalidName(String),
    #[error("invalid version specifier `{0}`")]
    InvalidSpecifier(String),
    #[error(transparent)]
    Version(#[from] VersionParseError),
    #[error("invalid URL `{0}`")]
    InvalidUrl(String),
    #[error("only https direct URLs are accepted: `{0}`")]
    InsecureUrl(String),
    #[error("only git+https and git+ssh VCS URLs are accepted: `{0}`")]
    UnsupportedVcs(String),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum VersionOperator {
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = "<=")]
    LessEqual,
    #[serde(rename = ">=")]
    GreaterEqual,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = "~=")]
    Compatible,
}

impl fmt::Display for VersionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::LessEqual => "<=",
            Self::GreaterEqual => ">=",
            Self::Less => "<",
            Self::Greater => ">",
            Self::Compatible => "~=",
        };
        f.write_str(text)
    }
}

/// One comparator, e.g. `>=2.31` or `==1.4.*`.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct VersionSpecifier {
    pub operator: VersionOperator,
    pub version: Version,
    /// Trailing `.*`, only meaningful for `==` and `!=`.
    pub wildcard: bool,
}

impl VersionSpecifier {
    pub fn contains(&self, candidate: &Version) -> bool {
        match self.operator {
            VersionOperator::Equal => {
                if self.wildcard {
                    candidate.epoch == self.version.epoch
                        && candidate.release_starts_with(&self.version.release)
                } else {
                    candidate == &self.version
                }
            }
            VersionOperator::NotEqual => {
                !Self {
                    operator: VersionOperator::Equal,
                    version: self.version.clone(),
                    wildcard: self.wildcard,
                }
                .contains(candidate)
            }
            VersionOperator::LessEqual => candidate <= &self.version,
            VersionOperator::GreaterEqual => candidate >= &self.version,
            VersionOperator::Less => candidate < &self.version,
            VersionOperator::Greater => candidate > &self.version,
            VersionOperator::Compatible => {
                if self.version.release.len() < 2 {
                    return candidate >= &self.version;
                }
                let prefix = &self.version.release[..self.version.release.len() - 1];
                candidate >= &self.version && candidate.release_starts_with(prefix)
            }
        }
    }
}

impl FromStr for VersionSpecifier {
    type Err = RequirementParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        let (operator, rest) = if let Some(rest) = input.strip_prefix("==") {
            (VersionOperator::Equal, rest)
        } else if let Some(rest) = input.strip_prefix("!=") {
            (VersionOperator::NotEqual, rest)
        } else if let Some(rest) = input.strip_prefix("<=") {
            (VersionOperator::LessEqual, rest)
        } else if let Some(rest) = input.strip_prefix(">=") {
            (VersionOperator::GreaterEqual, rest)
        } else if let Some(rest) = input.strip_prefix("~=") {
            (VersionOperator::Compatible, rest)
        } else if let Some(rest) = input.strip_prefix('<') {
            (VersionOperator::Less, rest)
        } else if let Some(rest) = input.strip_prefix('>') {
            (VersionOperator::Greater, rest)
        } else {
            return Err(RequirementParseError::InvalidSpecifier(input.to_string()));
        };
        let rest = rest.trim();
        let (rest, wildcard) = match rest.strip_suffix(".*") {
            Some(stripped)
                if matches!(
                    operator,
                    VersionOperator::Equal | VersionOperator::NotEqual
                ) =>
            {
                (stripped, true)
            }
            _ => (rest, false),
        };
        Ok(Self {
            operator,
            version: rest.parse()?,
            wildcard,
        })
    }
}

impl fmt::Display for VersionSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.operator, self.version)?;
        if self.wildcard {
            f.write_str(".*")?;
        }
        Ok(())
    }
}

/// A comma-separated conjunction of comparators.
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct VersionSpecifiers(pub Vec<VersionSpecifier>);

impl VersionSpecifiers {
    pub fn contains(&self, candidate: &Version) -> bool {
        self.0.iter().all(|spec| spec.contains(candidate))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for VersionSpecifiers {
    type Err = RequirementParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        input
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(VersionSpecifier::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

impl fmt::Display for VersionSpecifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(","))
    }
}

/// Where a requirement is sourced from.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RequirementSource {
    /// A package index.
    Index,
    /// A version-control URL (`git+https`/`git+ssh`).
    Vcs { url: Url },
    /// A direct HTTPS artifact URL.
    Url { url: Url },
    /// A local path installed in editable mode.
    EditablePath { path: PathBuf },
}

/// One dependency declaration, normalized across manifest formats.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Requirement {
    /// The declared name, case preserved.
    pub name: String,
    pub extras: Vec<String>,
    pub version_spec: VersionSpecifiers,
    pub source: RequirementSource,
}

impl Requirement {
    /// Case-folded name used for equality and lookups.
    pub fn normalized_name(&self) -> String {
        self.name.to_lowercase().replace('_', "-")
    }

    /// A plain index requirement on `name` with no constraints.
    pub fn unconstrained(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extras: Vec::new(),
            version_spec: VersionSpecifiers::default(),
            source: RequirementSource::Index,
        }
    }

    /// A `name==version` pin.
    pub fn pinned(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            extras: Vec::new(),
            version_spec: VersionSpecifiers(vec![VersionSpecifier {
                operator: VersionOperator::Equal,
                version,
                wildcard: false,
            }]),
            source: RequirementSource::Index,
        }
    }
}

impl PartialEq for Requirement {
    fn eq(&self, other: &Self) -> bool {
        self.normalized_name() == other.normalized_name()
            && self.extras == other.extras
            && self.version_spec == other.version_spec
            && self.source == other.source
    }
}

impl std::hash::Hash for Requirement {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.normalized_name().hash(state);
        self.extras.hash(state);
        self.version_spec.hash(state);
        self.source.hash(state);
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphanumeric() {
        return false;
    }
    let mut last = first;
    for ch in chars {
        if !(ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-')) {
            return false;
        }
        last = ch;
    }
    last.is_ascii_alphanumeric()
}

impl FromStr for Requirement {
    type Err = RequirementParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        if input.is_empty() {
            return Err(RequirementParseError::Empty);
        }

        // `name @ https://…` direct references.
        if let Some((name_part, url_part)) = input.split_once('@') {
            let looks_like_url = url_part.trim_start().contains("://");
            if looks_like_url {
                let (name, extras) = split_extras(name_part.trim())?;
                let url = parse_direct_url(url_part.trim())?;
                return Ok(Self {
                    name,
                    extras,
                    version_spec: VersionSpecifiers::default(),
                    source: url,
                });
            }
        }

        // Bare VCS URLs carry their name in the `#egg=` fragment.
        if input.starts_with("git+") {
            let url = parse_vcs_url(input)?;
            let name = url
                .fragment()
                .and_then(|fragment| {
                    fragment
                        .split('&')
                        .find_map(|pair| pair.strip_prefix("egg="))
                })
                .ok_or_else(|| RequirementParseError::InvalidName(input.to_string()))?
                .to_string();
            if !is_valid_name(&name) {
                return Err(RequirementParseError::InvalidName(name));
            }
            return Ok(Self {
                name,
                extras: Vec::new(),
                version_spec: VersionSpecifiers::default(),
                source: RequirementSource::Vcs { url },
            });
        }

        // `name[extras]` followed by optional comparators.
        let spec_start = input
            .char_indices()
            .find(|(_, ch)| matches!(ch, '<' | '>' | '=' | '!' | '~'))
            .map(|(at, _)| at);
        let (head, spec) = match spec_start {
            Some(at) => (&input[..at], &input[at..]),
            None => (input, ""),
        };
        let (name, extras) = split_extras(head.trim())?;
        let version_spec = if spec.trim().is_empty() {
            VersionSpecifiers::default()
        } else {
            spec.parse()?
        };
        Ok(Self {
            name,
            extras,
            version_spec,
            source: RequirementSource::Index,
        })
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.extras.is_empty() {
            write!(f, "[{}]", self.extras.join(","))?;
        }
        match &self.source {
            RequirementSource::Index => {
                if !self.version_spec.is_empty() {
                    write!(f, "{}", self.version_spec)?;
                }
            }
            RequirementSource::Vcs { url } | RequirementSource::Url { url } => {
                write!(f, " @ {url}")?;
            }
            RequirementSource::EditablePath { path } => {
                write!(f, " @ {}", path.display())?;
            }
        }
        Ok(())
    }
}

fn split_extras(head: &str) -> Result<(String, Vec<String>), RequirementParseError> {
    let (name, extras) = match head.split_once('[') {
        Some((name, rest)) => {
            let inner = rest
                .strip_suffix(']')
                .ok_or_else(|| RequirementParseError::InvalidName(head.to_string()))?;
            let extras = inner
                .split(',')
                .map(|extra| extra.trim().to_string())
                .filter(|extra| !extra.is_empty())
                .collect();
            (name.trim().to_string(), extras)
        }
        None => (head.to_string(), Vec::new()),
    };
    if !is_valid_name(&name) {
        return Err(RequirementParseError::InvalidName(name));
    }
    Ok((name, extras))
}

pub(crate) fn parse_direct_url(raw: &str) -> Result<RequirementSource, RequirementParseError> {
    if raw.starts_with("git+") {
        return Ok(RequirementSource::Vcs {
            url: parse_vcs_url(raw)?,
        });
    }
    let url = Url::parse(raw).map_err(|_| RequirementParseError::InvalidUrl(raw.to_string()))?;
    if url.scheme() != "https" {
        return Err(RequirementParseError::InsecureUrl(raw.to_string()));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(RequirementParseError::InvalidUrl(raw.to_string()));
    }
    Ok(RequirementSource::Url { url })
}

pub(crate) fn parse_vcs_url(raw: &str) -> Result<Url, RequirementParseError> {
    if !(raw.starts_with("git+https://") || raw.starts_with("git+ssh://")) {
        return Err(RequirementParseError::UnsupportedVcs(raw.to_string()));
    }
    let url = Url::parse(raw).map_err(|_| RequirementParseError::InvalidUrl(raw.to_string()))?;
    Ok(url)
}
