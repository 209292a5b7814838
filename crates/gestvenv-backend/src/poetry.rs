//! The `poetry` backend. Poetry manages venvs of its own, so environment
//! creation uses the stock `python -m venv` and installs go through the
//! venv's pip; the native tool is used where it is the only one that can
//! do the job (lock files).

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use gestvenv_manifest::Requirement;
use gestvenv_platform::VenvLayout;

use crate::pip::{
    create_venv_with_module, pip_check, pip_freeze, pip_install, pip_install_wheel, pip_list,
    pip_uninstall,
};
use crate::traits::QUERY_TIMEOUT;
use crate::{
    Backend, BackendError, BackendKind, CommandSpec, Conflict, InstallOptions, InstallOutcome,
    InstalledPackage,
};

#[derive(Debug)]
pub struct PoetryBackend {
    executable: PathBuf,
}

impl PoetryBackend {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

#[async_trait]
impl Backend for PoetryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Poetry
    }

    async fn create_venv(&self, path: &Path, python: &str) -> Result<(), BackendError> {
        create_venv_with_module(path, python, true).await
    }

    async fn install(
        &self,
        env: &VenvLayout,
        specs: &[Requirement],
        options: &InstallOptions,
    ) -> Result<InstallOutcome, BackendError> {
        pip_install(env, specs, options).await
    }

    async fn install_wheel(&self, env: &VenvLayout, wheel: &Path) -> Result<(), BackendError> {
        pip_install_wheel(env, wheel).await
    }

    async fn uninstall(&self, env: &VenvLayout, name: &str) -> Result<(), BackendError> {
        pip_uninstall(env, name).await
    }

    async fn list(&self, env: &VenvLayout) -> Result<Vec<InstalledPackage>, BackendError> {
        pip_list(env).await
    }

    async fn freeze(&self, env: &VenvLayout) -> Result<Vec<Requirement>, BackendError> {
        pip_freeze(env).await
    }

    async fn check(&self, env: &VenvLayout) -> Result<Vec<Conflict>, BackendError> {
        pip_check(env).await
    }

    async fn create_lock(&self, manifest_dir: &Path) -> Result<Option<PathBuf>, BackendError> {
        CommandSpec::new(&self.executable)
            .arg("lock")
            .current_dir(manifest_dir)
            .timeout(QUERY_TIMEOUT)
            .output_checked()
            .await?;
        Ok(Some(manifest_dir.join("poetry.lock")))
    }
}
