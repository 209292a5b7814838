//! Shared fixtures: a stub backend that fakes venvs on disk, and a
//! container wired against it inside a tempdir.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use gestvenv::{
    Backend, BackendKind, BackendRegistry, GestVenv, GestvenvConfig, Requirement, VenvLayout,
};
use gestvenv_backend::{BackendError, Conflict, InstallOptions, InstallOutcome, InstalledPackage};

const STATE_FILE: &str = ".stub-packages.json";

/// Fakes venv creation and records installs in a JSON file inside the
/// environment root, so listings survive across calls.
#[derive(Debug, Default)]
pub struct StubBackend;

fn read_state(env: &VenvLayout) -> Vec<(String, String)> {
    fs_err::read(env.root().join(STATE_FILE))
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_default()
}

fn write_state(env: &VenvLayout, state: &[(String, String)]) {
    let json = serde_json::to_vec(state).expect("state serializes");
    fs_err::write(env.root().join(STATE_FILE), json).expect("state file writes");
}

#[async_trait]
impl Backend for StubBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Pip
    }

    async fn create_venv(&self, path: &Path, python: &str) -> Result<(), BackendError> {
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
            let version = spec
                .version_spec
                .0
                .first()
                .map(|first| first.version.to_string())
                .unwrap_or_else(|| "1.0.0".to_string());
            state.retain(|(name, _)| !name.eq_ignore_ascii_case(&spec.name));
            state.push((spec.name.clone(), version));
            outcome.installed.push(spec.name.clone());
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

/// Configuration rooted inside `dir`, every path isolated from the host.
pub fn test_config(dir: &Path) -> GestvenvConfig {
    let mut config = GestvenvConfig::default();
    config.environments_path = dir.join("environments");
    config.cache.path = dir.join("cache");
    config.ephemeral.storage_backend = "disk".to_string();
    config.ephemeral.base_storage_path = Some(dir.join("ephemeral"));
    config.ephemeral.enable_preallocation = false;
    config
}

/// A container backed by the stub registry.
pub async fn stub_container(config: GestvenvConfig) -> GestVenv {
    let registry = Arc::new(BackendRegistry::with_backends(vec![Arc::new(StubBackend)]));
    GestVenv::assemble(config, registry)
        .await
        .expect("container assembles")
}
