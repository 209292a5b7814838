//! Probe which backends exist on this host, record their capabilities and
//! pick one.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    Backend, BackendCapabilities, BackendError, BackendKind, CommandSpec, PdmBackend, PipBackend,
    PoetryBackend, UvBackend,
};

/// Ceiling for availability/version probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the registry learned about one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub name: BackendKind,
    pub version: Option<String>,
    pub available: bool,
    pub performance_score: u32,
    pub capabilities: BackendCapabilities,
}

/// What the caller asked for.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum BackendPreference {
    #[default]
    Auto,
    Named(BackendKind),
}

impl FromStr for BackendPreference {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            Ok(Self::Auto)
        } else {
            Ok(Self::Named(s.parse()?))
        }
    }
}

impl fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Named(kind) => kind.fmt(f),
        }
    }
}

pub struct BackendRegistry {
    descriptors: Vec<BackendDescriptor>,
    backends: HashMap<BackendKind, Arc<dyn Backend>>,
}

impl BackendRegistry {
    /// Probe every known backend: locate the executable, query its version
    /// with a short timeout, derive capability flags. Availability requires
    /// both probes to succeed.
    pub async fn probe() -> Self {
        let mut descriptors = Vec::new();
        let mut backends: HashMap<BackendKind, Arc<dyn Backend>> = HashMap::new();

        for kind in BackendKind::ALL {
            let (available, version, backend) = probe_backend(kind).await;
            if available {
                info!(
                    "backend {kind} available{}",
                    version
                        .as_deref()
                        .map(|v| format!(" ({v})"))
                        .unwrap_or_default()
                );
            } else {
                debug!("backend {kind} not available");
            }
            let capabilities = BackendCapabilities::for_kind(kind);
            descriptors.push(BackendDescriptor {
                name: kind,
                version,
                available,
                performance_score: capabilities.performance_score(),
                capabilities,
            });
            if let Some(backend) = backend {
                backends.insert(kind, backend);
            }
        }
        Self {
            descriptors,
            backends,
        }
    }

    /// Build a registry from explicit backends; every entry is recorded as
    /// available. Test seams and embedders use this.
    pub fn with_backends(entries: Vec<Arc<dyn Backend>>) -> Self {
        let mut descriptors = Vec::new();
        let mut backends: HashMap<BackendKind, Arc<dyn Backend>> = HashMap::new();
        for backend in entries {
            let kind = backend.kind();
            let capabilities = backend.capabilities();
            descriptors.push(BackendDescriptor {
                name: kind,
                version: None,
                available: true,
                performance_score: capabilities.performance_score(),
                capabilities,
            });
            backends.insert(kind, backend);
        }
        Self {
            descriptors,
            backends,
        }
    }

    pub fn descriptors(&self) -> &[BackendDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, kind: BackendKind) -> Option<&BackendDescriptor> {
        self.descriptors
            .iter()
            .find(|descriptor| descriptor.name == kind)
    }

    pub fn is_available(&self, kind: BackendKind) -> bool {
        self.backends.contains_key(&kind)
    }

    /// The backend for `kind`, if available.
    pub fn get(&self, kind: BackendKind) -> Result<Arc<dyn Backend>, BackendError> {
        self.backends
            .get(&kind)
            .cloned()
            .ok_or(BackendError::NotAvailable(kind))
    }

    /// Select a backend: `auto` returns the highest-scoring available one
    /// (ties broken by `uv > pdm > poetry > pip`), a named preference
    /// returns exactly that backend or fails.
    pub fn select(&self, preference: BackendPreference) -> Result<Arc<dyn Backend>, BackendError> {
        match preference {
            BackendPreference::Named(kind) => self.get(kind),
            BackendPreference::Auto => {
                let best = self
                    .descriptors
                    .iter()
                    .filter(|descriptor| descriptor.available)
                    .max_by(|left, right| {
                        left.performance_score
                            .cmp(&right.performance_score)
                            // Lower rank wins a tie, so compare reversed.
                            .then(
                                right
                                    .name
                                    .preference_rank()
                                    .cmp(&left.name.preference_rank()),
                            )
                    })
                    .ok_or(BackendError::NoneAvailable)?;
                self.get(best.name)
            }
        }
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("descriptors", &self.descriptors)
            .finish_non_exhaustive()
    }
}

async fn probe_backend(kind: BackendKind) -> (bool, Option<String>, Option<Arc<dyn Backend>>) {
    match kind {
        BackendKind::Pip => {
            // pip lives inside a python installation.
            let Ok(python) = which::which("python3").or_else(|_| which::which("python")) else {
                return (false, None, None);
            };
            let version = probe_version(
                CommandSpec::new(&python)
                    .args(["-m", "pip", "--version"])
                    .timeout(PROBE_TIMEOUT),
            )
            .await;
            match version {
                Some(version) => (
                    true,
                    Some(version),
                    Some(Arc::new(PipBackend::new()) as Arc<dyn Backend>),
                ),
                None => (false, None, None),
            }
        }
        BackendKind::Uv | BackendKind::Poetry | BackendKind::Pdm => {
            let Ok(executable) = which::which(kind.as_str()) else {
                return (false, None, None);
            };
            let version = probe_version(
                CommandSpec::new(&executable)
                    .arg("--version")
                    .timeout(PROBE_TIMEOUT),
            )
            .await;
            let Some(version) = version else {
                return (false, None, None);
            };
            let backend: Arc<dyn Backend> = match kind {
                BackendKind::Uv => Arc::new(UvBackend::new(executable)),
                BackendKind::Poetry => Arc::new(PoetryBackend::new(executable)),
                BackendKind::Pdm => Arc::new(PdmBackend::new(executable)),
                BackendKind::Pip => unreachable!("handled above"),
            };
            (true, Some(version), Some(backend))
        }
    }
}

async fn probe_version(spec: CommandSpec) -> Option<String> {
    let output = spec.output().await.ok()?;
    if !output.success() {
        return None;
    }
    let line = output.stdout.lines().next()?.trim();
    // `uv 0.4.18` / `pip 24.0 from …` / `Poetry (version 1.8.3)`.
    let version = line
        .split_whitespace()
        .find(|token| {
            token
                .trim_matches(|ch: char| !ch.is_ascii_digit() && ch != '.')
                .split('.')
                .filter(|part| !part.is_empty())
                .count()
                >= 2
        })
        .map(|token| {
            token
                .trim_matches(|ch: char| !ch.is_ascii_digit() && ch != '.')
                .to_string()
        })?;
    Some(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};

    use gestvenv_manifest::Requirement;
    use gestvenv_platform::VenvLayout;

    use crate::{Conflict, InstallOptions, InstallOutcome, InstalledPackage};

    struct NullBackend(BackendKind);

    #[async_trait]
    impl Backend for NullBackend {
        fn kind(&self) -> BackendKind {
            self.0
        }
        async fn create_venv(&self, _: &Path, _: &str) -> Result<(), BackendError> {
            Ok(())
        }
        async fn install(
            &self,
            _: &VenvLayout,
            _: &[Requirement],
            _: &InstallOptions,
        ) -> Result<InstallOutcome, BackendError> {
            Ok(InstallOutcome::default())
        }
        async fn install_wheel(&self, _: &VenvLayout, _: &Path) -> Result<(), BackendError> {
            Ok(())
        }
        async fn uninstall(&self, _: &VenvLayout, _: &str) -> Result<(), BackendError> {
            Ok(())
        }
        async fn list(&self, _: &VenvLayout) -> Result<Vec<InstalledPackage>, BackendError> {
            Ok(Vec::new())
        }
        async fn freeze(&self, _: &VenvLayout) -> Result<Vec<Requirement>, BackendError> {
            Ok(Vec::new())
        }
        async fn check(&self, _: &VenvLayout) -> Result<Vec<Conflict>, BackendError> {
            Ok(Vec::new())
        }
        async fn create_lock(&self, _: &Path) -> Result<Option<PathBuf>, BackendError> {
            Ok(None)
        }
    }

    #[test]
    fn auto_prefers_the_highest_score() {
        let registry = BackendRegistry::with_backends(vec![
            Arc::new(NullBackend(BackendKind::Pip)),
            Arc::new(NullBackend(BackendKind::Uv)),
            Arc::new(NullBackend(BackendKind::Poetry)),
        ]);
        let selected = registry.select(BackendPreference::Auto).unwrap();
        assert_eq!(selected.kind(), BackendKind::Uv);
    }

    #[test]
    fn auto_downgrades_when_uv_is_absent() {
        let registry = BackendRegistry::with_backends(vec![
            Arc::new(NullBackend(BackendKind::Pip)),
            Arc::new(NullBackend(BackendKind::Poetry)),
        ]);
        let selected = registry.select(BackendPreference::Auto).unwrap();
        assert_eq!(selected.kind(), BackendKind::Poetry);
    }

    #[test]
    fn named_preference_fails_when_absent() {
        let registry =
            BackendRegistry::with_backends(vec![Arc::new(NullBackend(BackendKind::Pip))]);
        let err = registry
            .select(BackendPreference::Named(BackendKind::Uv))
            .unwrap_err();
        assert!(matches!(err, BackendError::NotAvailable(BackendKind::Uv)));
    }

    #[test]
    fn empty_registry_has_no_auto_choice() {
        let registry = BackendRegistry::with_backends(Vec::new());
        assert!(matches!(
            registry.select(BackendPreference::Auto),
            Err(BackendError::NoneAvailable)
        ));
    }

    #[test]
    fn preference_parses() {
        assert_eq!(
            "auto".parse::<BackendPreference>().unwrap(),
            BackendPreference::Auto
        );
        assert_eq!(
            "uv".parse::<BackendPreference>().unwrap(),
            BackendPreference::Named(BackendKind::Uv)
        );
        assert!("mamba".parse::<BackendPreference>().is_err());
    }
}
