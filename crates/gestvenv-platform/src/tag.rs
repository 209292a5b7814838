use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformTagError {
    #[error("invalid platform tag `{0}`: expected `<os>_<machine>`")]
    Invalid(String),
    #[error("unknown operating system family `{0}`")]
    UnknownOs(String),
}

/// A short ABI identifier for cached artifacts: OS family plus machine
/// architecture, e.g. `linux_x86_64`, `macosx_arm64`, `win_amd64`.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PlatformTag {
    os: String,
    machine: String,
}

impl PlatformTag {
    pub fn new(os: impl Into<String>, machine: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            machine: machine.into(),
        }
    }

    /// The tag of the host we are running on.
    pub fn current() -> Self {
        let os = match std::env::consts::OS {
            "windows" => "win",
            "macos" => "macosx",
            _ => "linux",
        };
        Self::new(os, std::env::consts::ARCH.to_lowercase())
    }

    pub fn os(&self) -> &str {
        &self.os
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }
}

impl fmt::Display for PlatformTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.os, self.machine)
    }
}

impl FromStr for PlatformTag {
    type Err = PlatformTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (os, machine) = s
            .split_once('_')
            .ok_or_else(|| PlatformTagError::Invalid(s.to_string()))?;
        if machine.is_empty() {
            return Err(PlatformTagError::Invalid(s.to_string()));
        }
        match os {
            "linux" | "macosx" | "win" => Ok(Self::new(os, machine)),
            other => Err(PlatformTagError::UnknownOs(other.to_string())),
        }
    }
}

impl From<PlatformTag> for String {
    fn from(tag: PlatformTag) -> Self {
        tag.to_string()
    }
}

impl TryFrom<String> for PlatformTag {
    type Error = PlatformTagError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let tag: PlatformTag = "linux_x86_64".parse().unwrap();
        assert_eq!(tag.os(), "linux");
        assert_eq!(tag.machine(), "x86_64");
        assert_eq!(tag.to_string(), "linux_x86_64");
    }

    #[test]
    fn machine_may_contain_underscores() {
        let tag: PlatformTag = "macosx_arm64".parse().unwrap();
        assert_eq!(tag.machine(), "arm64");
        let tag: PlatformTag = "win_amd64".parse().unwrap();
        assert_eq!(tag.os(), "win");
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<PlatformTag>().is_err());
        assert!("linux".parse::<PlatformTag>().is_err());
        assert!("freebsd_x86_64".parse::<PlatformTag>().is_err());
    }

    #[test]
    fn current_is_parseable() {
        let tag = PlatformTag::current();
        let round: PlatformTag = tag.to_string().parse().unwrap();
        assert_eq!(tag, round);
    }
}
