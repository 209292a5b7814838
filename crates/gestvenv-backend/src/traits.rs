//! The backend trait: one uniform operation set, one concrete type per tool.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use gestvenv_manifest::{Requirement, Version};
use gestvenv_platform::VenvLayout;

use crate::{BackendCapabilities, BackendError, BackendKind};

/// Ceiling for venv creation.
pub(crate) const VENV_CREATE_TIMEOUT: Duration = Duration::from_secs(60);
/// Default ceiling for package installation; configurable per call.
pub(crate) const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(300);
/// Ceiling for list/freeze/check style queries.
pub(crate) const QUERY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub editable: bool,
    pub upgrade: bool,
    pub group: Option<String>,
    pub extra_index_urls: Vec<String>,
    pub timeout: Duration,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            editable: false,
            upgrade: false,
            group: None,
            extra_index_urls: Vec::new(),
            timeout: DEFAULT_INSTALL_TIMEOUT,
        }
    }
}

/// Per-spec result of an install call; partial failures do not abort the
/// whole operation.
#[derive(Debug, Clone, Default)]
pub struct InstallOutcome {
    pub installed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl InstallOutcome {
    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// One row of the backend's authoritative package listing.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: Version,
}

/// A dependency conflict reported by `check`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Conflict {
    pub package: String,
    pub message: String,
}

/// Uniform operations over one package tool.
///
/// Implementations choose the argument vectors; the contract (explicit
/// argv, cwd, env, timeout, lossy capture) is enforced by the shared
/// [`crate::CommandSpec`] runner.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::for_kind(self.kind())
    }

    /// Create a virtual environment at `path` for `python` (`X.Y`).
    ///
    /// Fails with [`BackendError::VenvCreationFailed`] on a non-zero exit
    /// or when the expected interpreter is missing afterwards.
    async fn create_venv(&self, path: &Path, python: &str) -> Result<(), BackendError>;

    /// Install requirements into the venv.
    async fn install(
        &self,
        env: &VenvLayout,
        specs: &[Requirement],
        options: &InstallOptions,
    ) -> Result<InstallOutcome, BackendError>;

    /// Install a local wheel file, never touching the network.
    async fn install_wheel(&self, env: &VenvLayout, wheel: &Path) -> Result<(), BackendError>;

    async fn uninstall(&self, env: &VenvLayout, name: &str) -> Result<(), BackendError>;

    /// Authoritative installed-package listing; source of truth for sync.
    async fn list(&self, env: &VenvLayout) -> Result<Vec<InstalledPackage>, BackendError>;

    /// Pinned requirement lines for the venv's current contents.
    async fn freeze(&self, env: &VenvLayout) -> Result<Vec<Requirement>, BackendError>;

    /// Dependency conflicts. A non-zero exit is expected when conflicts
    /// exist and is parsed, not surfaced as a failure.
    async fn check(&self, env: &VenvLayout) -> Result<Vec<Conflict>, BackendError>;

    /// Produce a lock file for the project at `manifest_dir`; `None` when
    /// the backend has no lock capability.
    async fn create_lock(&self, manifest_dir: &Path) -> Result<Option<PathBuf>, BackendError>;
}

impl std::fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Backend").field(&self.kind()).finish()
    }
}

/// Parse `pip list --format=json` output.
pub(crate) fn parse_pip_list_json(
    program: &str,
    stdout: &str,
) -> Result<Vec<InstalledPackage>, BackendError> {
    #[derive(Deserialize)]
    struct Row {
        name: String,
        version: String,
    }
    let rows: Vec<Row> =
        serde_json::from_str(stdout.trim()).map_err(|err| BackendError::OutputParse {
            program: program.to_string(),
            message: err.to_string(),
        })?;
    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let version = row.version.parse().ok()?;
            Some(InstalledPackage {
                name: row.name,
                version,
            })
        })
        .collect())
}

/// Parse `pip freeze` lines into pinned requirements; unparseable lines
/// (editable VCS noise etc.) are skipped.
pub(crate) fn parse_freeze_lines(stdout: &str) -> Vec<Requirement> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.parse().ok())
        .collect()
}

/// Parse `pip check` stdout into conflicts, e.g.
/// `pkg 1.0 requires other, which is not installed.`
pub(crate) fn parse_check_lines(stdout: &str) -> Vec<Conflict> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let package = line
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string();
            Conflict {
                package,
                message: line.to_string(),
            }
        })
        .collect()
}
