//! The `pdm` backend: `pdm venv create` for environments, the venv's pip
//! for installs, native `pdm lock` for lock files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use gestvenv_manifest::Requirement;
use gestvenv_platform::VenvLayout;

use crate::pip::{
    pip_check, pip_freeze, pip_install, pip_install_wheel, pip_list, pip_uninstall,
};
use crate::traits::{QUERY_TIMEOUT, VENV_CREATE_TIMEOUT};
use crate::{
    Backend, BackendError, BackendKind, CommandSpec, Conflict, InstallOptions, InstallOutcome,
    InstalledPackage,
};

#[derive(Debug)]
pub struct PdmBackend {
    executable: PathBuf,
}

impl PdmBackend {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

#[async_trait]
impl Backend for PdmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Pdm
    }

    async fn create_venv(&self, path: &Path, python: &str) -> Result<(), BackendError> {
        let output = CommandSpec::new(&self.executable)
            .args(["venv", "create"])
            .args(["--python", python])
            .arg(path.display().to_string())
            .timeout(VENV_CREATE_TIMEOUT)
            .output()
            .await?;
        if !output.success() {
            return Err(BackendError::VenvCreationFailed {
                stderr: output.stderr.trim().to_string(),
            });
        }
        VenvLayout::new(path).existing_python()?;
        Ok(())
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
        Ok(Some(manifest_dir.join("pdm.lock")))
    }
}
