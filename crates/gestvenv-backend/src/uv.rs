//! The `uv` backend. Fastest venv creation and the only backend with
//! parallel installs; everything is driven through the `uv` executable.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use gestvenv_manifest::Requirement;
use gestvenv_platform::VenvLayout;

use crate::traits::{
    parse_check_lines, parse_freeze_lines, parse_pip_list_json, QUERY_TIMEOUT, VENV_CREATE_TIMEOUT,
};
use crate::{
    Backend, BackendError, BackendKind, CommandSpec, Conflict, InstallOptions, InstallOutcome,
    InstalledPackage,
};

#[derive(Debug)]
pub struct UvBackend {
    executable: PathBuf,
}

impl UvBackend {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    /// `uv pip …` scoped to the venv's interpreter.
    fn uv_pip(&self, env: &VenvLayout) -> Result<CommandSpec, BackendError> {
        let python = env.existing_python()?;
        Ok(CommandSpec::new(&self.executable)
            .arg("pip")
            .timeout(QUERY_TIMEOUT)
            .env("VIRTUAL_ENV", env.root().display().to_string())
            .env("UV_PYTHON", python.display().to_string()))
    }
}

#[async_trait]
impl Backend for UvBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Uv
    }

    async fn create_venv(&self, path: &Path, python: &str) -> Result<(), BackendError> {
        let output = CommandSpec::new(&self.executable)
            .arg("venv")
            .arg(path.display().to_string())
            .args(["--python", python])
            .arg("--seed")
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
        if specs.is_empty() {
            return Ok(InstallOutcome::default());
        }
        let mut command = self
            .uv_pip(env)?
            .arg("install")
            .timeout(options.timeout);
        if options.upgrade {
            command = command.arg("--upgrade");
        }
        for url in &options.extra_index_urls {
            command = command.args(["--extra-index-url", url]);
        }
        for spec in specs {
            match &spec.source {
                gestvenv_manifest::RequirementSource::EditablePath { path } => {
                    command = command.arg("-e").arg(path.display().to_string());
                }
                _ => {
                    if options.editable {
                        command = command.arg("-e");
                    }
                    command = command.arg(spec.to_string());
                }
            }
        }
        let output = command.output().await?;
        let mut outcome = InstallOutcome::default();
        if output.success() {
            outcome.installed = specs.iter().map(|spec| spec.name.clone()).collect();
        } else {
            // uv resolves the whole set at once, so the batch fails as one.
            for spec in specs {
                outcome
                    .failed
                    .push((spec.name.clone(), output.stderr.trim().to_string()));
            }
        }
        Ok(outcome)
    }

    async fn install_wheel(&self, env: &VenvLayout, wheel: &Path) -> Result<(), BackendError> {
        self.uv_pip(env)?
            .arg("install")
            .arg("--no-index")
            .arg(wheel.display().to_string())
            .output_checked()
            .await?;
        Ok(())
    }

    async fn uninstall(&self, env: &VenvLayout, name: &str) -> Result<(), BackendError> {
        self.uv_pip(env)?
            .args(["uninstall", name])
            .output_checked()
            .await?;
        Ok(())
    }

    async fn list(&self, env: &VenvLayout) -> Result<Vec<InstalledPackage>, BackendError> {
        let output = self
            .uv_pip(env)?
            .args(["list", "--format", "json"])
            .output_checked()
            .await?;
        parse_pip_list_json("uv", &output.stdout)
    }

    async fn freeze(&self, env: &VenvLayout) -> Result<Vec<Requirement>, BackendError> {
        let output = self.uv_pip(env)?.arg("freeze").output_checked().await?;
        Ok(parse_freeze_lines(&output.stdout))
    }

    async fn check(&self, env: &VenvLayout) -> Result<Vec<Conflict>, BackendError> {
        let output = self.uv_pip(env)?.arg("check").output().await?;
        if output.success() {
            Ok(Vec::new())
        } else {
            Ok(parse_check_lines(&output.stdout))
        }
    }

    async fn create_lock(&self, manifest_dir: &Path) -> Result<Option<PathBuf>, BackendError> {
        CommandSpec::new(&self.executable)
            .arg("lock")
            .current_dir(manifest_dir)
            .timeout(QUERY_TIMEOUT)
            .output_checked()
            .await?;
        Ok(Some(manifest_dir.join("uv.lock")))
    }
}
