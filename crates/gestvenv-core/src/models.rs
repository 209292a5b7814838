//! The persisted environment record and its pieces.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use indexmap::IndexMap;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use gestvenv_backend::BackendKind;
use gestvenv_platform::VenvLayout;

use crate::CoreError;

/// A `major.minor` python version, bounded by the supported range.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PythonVersion {
    pub major: u32,
    pub minor: u32,
}

impl PythonVersion {
    /// Lowest supported interpreter.
    pub const FLOOR: Self = Self { major: 3, minor: 9 };
    /// Highest version the configuration accepts.
    pub const CEILING: Self = Self {
        major: 3,
        minor: 20,
    };

    pub fn in_supported_range(self) -> bool {
        self >= Self::FLOOR && self <= Self::CEILING
    }
}

impl fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for PythonVersion {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .trim()
            .split_once('.')
            .ok_or_else(|| CoreError::Validation(format!("python version `{s}` is not `X.Y`")))?;
        // A patch component is tolerated and dropped.
        let minor = minor.split('.').next().unwrap_or(minor);
        let parsed = Self {
            major: major
                .parse()
                .map_err(|_| CoreError::Validation(format!("python version `{s}` is not `X.Y`")))?,
            minor: minor
                .parse()
                .map_err(|_| CoreError::Validation(format!("python version `{s}` is not `X.Y`")))?,
        };
        Ok(parsed)
    }
}

/// Health grade; a pure function of the latest checker run.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    NeedsUpdate,
    HasWarnings,
    HasErrors,
    Corrupted,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstallMode {
    #[default]
    Standard,
    Editable,
    Development,
}

/// One installed package as the core last saw it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
    /// Where the artifact came from: `index`, `cache`, `vcs`, `path`.
    pub source: String,
    #[serde(default)]
    pub install_mode: InstallMode,
    pub installed_at: Timestamp,
}

/// The persisted record for one long-lived environment, stored at
/// `<env_root>/.gestvenv-metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub name: String,
    pub path: PathBuf,
    pub python_version: String,
    pub backend: BackendKind,
    #[serde(default)]
    pub health: HealthStatus,
    pub created_at: Timestamp,
    pub last_modified: Timestamp,
    pub last_used: Timestamp,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub manifest_path: Option<PathBuf>,
    #[serde(default)]
    pub packages: Vec<PackageInfo>,
    /// Named dependency groups: group name → requirement strings.
    #[serde(default)]
    pub dependency_groups: IndexMap<String, Vec<String>>,
    #[serde(default)]
    pub lock_file: Option<PathBuf>,
}

impl EnvironmentInfo {
    pub fn layout(&self) -> VenvLayout {
        VenvLayout::new(&self.path)
    }

    pub fn touch(&mut self) {
        self.last_modified = Timestamp::now();
    }

    pub fn package(&self, name: &str) -> Option<&PackageInfo> {
        let folded = fold_name(name);
        self.packages
            .iter()
            .find(|package| fold_name(&package.name) == folded)
    }
}

/// Case-folded package-name comparison form.
pub(crate) fn fold_name(name: &str) -> String {
    name.to_lowercase().replace('_', "-")
}

/// The structured result every mutating operation returns.
#[derive(Debug)]
pub struct EnvironmentOutcome {
    pub environment: EnvironmentInfo,
    pub message: String,
    pub warnings: Vec<String>,
    pub execution_time: Duration,
}
