//! In-tree stub backend so manager and doctor tests never shell out.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use gestvenv_backend::{
    Backend, BackendError, BackendKind, BackendRegistry, Conflict, InstallOptions, InstallOutcome,
    InstalledPackage,
};
use gestvenv_cache::{CacheConfig, PackageCache};
use gestvenv_manifest::{Requirement, VersionOperator};
use gestvenv_platform::VenvLayout;

use crate::config::GestvenvConfig;
use crate::manager::EnvironmentManager;
use crate::packages::PackageService;

const STATE_FILE: &str = ".stub-packages.json";

/// A backend that fakes venv creation and keeps its installed-package
/// state in a JSON file inside the env root.
#[derive(Debug, Default)]
pub(crate) struct StubBackend {
    pub(crate) fail_create: bool,
}

fn state_path(env: &VenvLayout) -> PathBuf {
    env.root().join(STATE_FILE)
}

fn read_state(env: &VenvLayout) -> Vec<(String, String)> {
    fs_err::read(state_path(env))
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_default()
}

fn write_state(env: &VenvLayout, state: &[(String, String)]) {
    let json = serde_json::to_vec(state).expect("state serializes");
    fs_err::write(state_path(env), json).expect("state file writes");
}

fn spec_version(spec: &Requirement) -> String {
    match spec.version_spec.0.first() {
        Some(first) if first.operator == VersionOperator::Equal && !first.wildcard => {
            first.version.to_string()
        }
        _ => "1.0.0".to_string(),
    }
}

#[async_trait]
impl Backend for StubBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Pip
    }

    async fn create_venv(&self, path: &Path, python: &str) -> Result<(), BackendError> {
        if self.fail_create {
            return Err(BackendError::VenvCreationFailed {
                stderr: "stub backend was told to fail".to_string(),
            });
        }
        let layout = VenvLayout::new(path);
        fs_err::create_dir_all(layout.scripts_dir())?;
        fs_err::write(
            layout.python(),
            format!("#!/bin/sh\necho \"Python {python}.0\"\n"),
        )?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs_err::set_permissions(layout.python(), std::fs::Permissions::from_mode(0o755))?;
        }
        fs_err::write(layout.activate(), b"# stub activate\n")?;
        fs_err::write(
            layout.pyvenv_cfg(),
            format!("home = /usr/bin\nversion = {python}.0\n"),
        )?;
        Ok(())
    }

    async fn install(
        &self,
        env: &VenvLayout,
        specs: &[Requirement],
        _options: &InstallOptions,
    ) -> Result<InstallOutcome, BackendError> {
        let mut state = read_state(env);
        let mut outcome = InstallOutcome::default();
        for spec in specs {
            let name = spec.name.clone();
            let version = spec_version(spec);
            state.retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
            state.push((name.clone(), version));
            outcome.installed.push(name);
        }
        write_state(env, &state);
        Ok(outcome)
    }

    async fn install_wheel(&self, env: &VenvLayout, wheel: &Path) -> Result<(), BackendError> {
        let stem = wheel
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default();
        let mut parts = stem.split('-');
        let name = parts.next().unwrap_or("unknown").replace('_', "-");
        let version = parts.next().unwrap_or("0").to_string();
        let mut state = read_state(env);
        state.retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
        state.push((name, version));
        write_state(env, &state);
        Ok(())
    }

    async fn uninstall(&self, env: &VenvLayout, name: &str) -> Result<(), BackendError> {
        let mut state = read_state(env);
        state.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
        write_state(env, &state);
        Ok(())
    }

    async fn list(&self, env: &VenvLayout) -> Result<Vec<InstalledPackage>, BackendError> {
        Ok(read_state(env)
            .into_iter()
            .filter_map(|(name, version)| {
                Some(InstalledPackage {
                    name,
                    version: version.parse().ok()?,
                })
            })
            .collect())
    }

    async fn freeze(&self, env: &VenvLayout) -> Result<Vec<Requirement>, BackendError> {
        Ok(read_state(env)
            .into_iter()
            .filter_map(|(name, version)| format!("{name}=={version}").parse().ok())
            .collect())
    }

    async fn check(&self, _env: &VenvLayout) -> Result<Vec<Conflict>, BackendError> {
        Ok(Vec::new())
    }

    async fn create_lock(&self, _manifest_dir: &Path) -> Result<Option<PathBuf>, BackendError> {
        Ok(None)
    }
}

/// A manager wired to the stub backend and a throwaway cache.
pub(crate) fn manager_with_stub(
    backend: StubBackend,
) -> (tempfile::TempDir, EnvironmentManager) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = GestvenvConfig::default();
    config.environments_path = dir.path().join("environments");
    config.cache.path = dir.path().join("cache");

    let registry = Arc::new(BackendRegistry::with_backends(vec![Arc::new(backend)]));
    let cache = Arc::new(
        PackageCache::open(
            &config.cache.path,
            CacheConfig {
                enabled: config.cache.enabled,
                max_size_mb: config.cache.max_size_mb,
                compression: config.cache.compression,
                offline_mode: config.cache.offline_mode,
            },
        )
        .expect("cache opens"),
    );
    let packages = PackageService::new(registry, cache);
    let manager = EnvironmentManager::new(config, packages);
    (dir, manager)
}
