//! A lenient PEP 440 version: epoch, release segments, pre/post/dev
//! suffixes. Local version labels are accepted and ignored for ordering.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid version `{0}`")]
pub struct VersionParseError(pub String);

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum PreReleaseKind {
    Alpha,
    Beta,
    Rc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Version {
    pub epoch: u64,
    pub release: Vec<u64>,
    pub pre: Option<(PreReleaseKind, u64)>,
    pub post: Option<u64>,
    pub dev: Option<u64>,
}

// Trailing zero release segments are insignificant (`1.0` == `1.0.0`), so
// equality and hashing go through the padded comparison form.
impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl std::hash::Hash for Version {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.epoch.hash(state);
        let significant = self
            .release
            .iter()
            .rposition(|segment| *segment != 0)
            .map(|at| at + 1)
            .unwrap_or(0);
        self.release[..significant].hash(state);
        self.pre.hash(state);
        self.post.hash(state);
        self.dev.hash(state);
    }
}

impl Version {
    pub fn new(release: impl Into<Vec<u64>>) -> Self {
        Self {
            epoch: 0,
            release: release.into(),
            pre: None,
            post: None,
            dev: None,
        }
    }

    /// Whether `self.release` starts with `prefix` (zero-padded on the
    /// right), the comparison behind `==` with a trailing `.*`.
    pub fn release_starts_with(&self, prefix: &[u64]) -> bool {
        (0..prefix.len()).all(|index| self.release.get(index).copied().unwrap_or(0) == prefix[index])
    }

    /// Phase rank used for ordering: dev < pre < final < post. A dev
    /// suffix on a pre or post release does not change the phase; it
    /// sorts the version below the same release without the suffix
    /// (`1.0 < 1.0.post1.dev2 < 1.0.post1`).
    fn phase(&self) -> u8 {
        if self.pre.is_some() {
            1
        } else if self.post.is_some() {
            3
        } else if self.dev.is_some() {
            0
        } else {
            2
        }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.epoch != other.epoch {
            return self.epoch.cmp(&other.epoch);
        }
        let segments = self.release.len().max(other.release.len());
        for index in 0..segments {
            let left = self.release.get(index).copied().unwrap_or(0);
            let right = other.release.get(index).copied().unwrap_or(0);
            if left != right {
                return left.cmp(&right);
            }
        }
        self.phase()
            .cmp(&other.phase())
            .then_with(|| self.pre.cmp(&other.pre))
            .then_with(|| self.post.cmp(&other.post))
            // A dev release sorts before the same version without one.
            .then_with(|| match (self.dev, other.dev) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(left), Some(right)) => left.cmp(&right),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let original = input;
        let input = input.trim().trim_start_matches('v');
        // Local version labels are ordering-irrelevant here.
        let input = input.split('+').next().unwrap_or(input);
        if input.is_empty() {
            return Err(VersionParseError(original.to_string()));
        }

        let (epoch, rest) = match input.split_once('!') {
            Some((epoch, rest)) => (
                epoch
                    .parse::<u64>()
                    .map_err(|_| VersionParseError(original.to_string()))?,
                rest,
            ),
            None => (0, input),
        };

        let mut release = Vec::new();
        let mut pre = None;
        let mut post = None;
        let mut dev = None;

        for segment in rest.split('.') {
            let segment = segment.trim();
            if segment.is_empty() {
                return Err(VersionParseError(original.to_string()));
            }
            if let Ok(number) = segment.parse::<u64>() {
                // Suffixes must not be followed by more release segments.
                if pre.is_some() || post.is_some() || dev.is_some() {
                    return Err(VersionParseError(original.to_string()));
                }
                release.push(number);
                continue;
            }
            // `1.0a1` glues a pre-release to a release segment.
            let lowered = segment.to_ascii_lowercase();
            if let Some(parsed) = parse_suffix(&lowered, &mut release)? {
                match parsed {
                    Suffix::Pre(kind, number) => pre = Some((kind, number)),
                    Suffix::Post(number) => post = Some(number),
                    Suffix::Dev(number) => dev = Some(number),
                }
            } else {
                return Err(VersionParseError(original.to_string()));
            }
        }

        if release.is_empty() {
            return Err(VersionParseError(original.to_string()));
        }
        Ok(Self {
            epoch,
            release,
            pre,
            post,
            dev,
        })
    }
}

enum Suffix {
    Pre(PreReleaseKind, u64),
    Post(u64),
    Dev(u64),
}

/// Parse a non-numeric dot segment: either a pure suffix (`rc1`, `post2`,
/// `dev0`) or a number glued to one (`0rc1` pushes `0` then yields rc1).
fn parse_suffix(segment: &str, release: &mut Vec<u64>) -> Result<Option<Suffix>, VersionParseError> {
    let split = segment
        .char_indices()
        .find(|(_, ch)| ch.is_ascii_alphabetic())
        .map(|(at, _)| at)
        .unwrap_or(0);
    let (number_part, suffix_part) = segment.split_at(split);
    if !number_part.is_empty() {
        let number = number_part
            .parse::<u64>()
            .map_err(|_| VersionParseError(segment.to_string()))?;
        release.push(number);
    }
    let (word, trailing) = suffix_part
        .char_indices()
        .find(|(_, ch)| ch.is_ascii_digit())
        .map(|(at, _)| suffix_part.split_at(at))
        .unwrap_or((suffix_part, ""));
    let number = if trailing.is_empty() {
        0
    } else {
        trailing
            .parse::<u64>()
            .map_err(|_| VersionParseError(segment.to_string()))?
    };
    let suffix = match word {
        "a" | "alpha" => Suffix::Pre(PreReleaseKind::Alpha, number),
        "b" | "beta" => Suffix::Pre(PreReleaseKind::Beta, number),
        "rc" | "c" => Suffix::Pre(PreReleaseKind::Rc, number),
        "post" | "rev" | "r" => Suffix::Post(number),
        "dev" => Suffix::Dev(number),
        _ => return Ok(None),
    };
    Ok(Some(suffix))
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch != 0 {
            write!(f, "{}!", self.epoch)?;
        }
        let release: Vec<String> = self.release.iter().map(ToString::to_string).collect();
        write!(f, "{}", release.join("."))?;
        if let Some((kind, number)) = self.pre {
            let tag = match kind {
                PreReleaseKind::Alpha => "a",
                PreReleaseKind::Beta => "b",
                PreReleaseKind::Rc => "rc",
            };
            write!(f, "{tag}{number}")?;
        }
        if let Some(number) = self.post {
            write!(f, ".post{number}")?;
        }
        if let Some(number) = self.dev {
            write!(f, ".dev{number}")?;
        }
        Ok(())
    }
}

impl From<Version> for String {
    fn from(version: Version) -> Self {
        version.to_string()
    }
}

impl TryFrom<String> for Version {
    type Error = VersionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
