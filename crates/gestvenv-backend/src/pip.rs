//! The `pip` backend: stock `python -m venv` plus the venv's own pip.
//!
//! The module-level helpers drive a venv's pip directly and are shared by
//! the poetry and pdm backends, whose install path is also the venv's pip.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use gestvenv_manifest::Requirement;
use gestvenv_platform::VenvLayout;

use crate::traits::{
    parse_check_lines, parse_freeze_lines, parse_pip_list_json, DEFAULT_INSTALL_TIMEOUT,
    QUERY_TIMEOUT, VENV_CREATE_TIMEOUT,
};
use crate::{
    Backend, BackendError, BackendKind, CommandSpec, Conflict, InstallOptions, InstallOutcome,
    InstalledPackage,
};

#[derive(Debug, Default)]
pub struct PipBackend;

impl PipBackend {
    pub fn new() -> Self {
        Self
    }
}

/// Resolve a base interpreter for `X.Y`, preferring the versioned name.
pub(crate) fn find_base_python(python: &str) -> Result<PathBuf, BackendError> {
    if let Ok(path) = which::which(format!("python{python}")) {
        return Ok(path);
    }
    debug!("python{python} not on PATH, falling back to python3");
    which::which("python3").map_err(|_| BackendError::NoneAvailable)
}

pub(crate) async fn create_venv_with_module(
    path: &Path,
    python: &str,
    upgrade_deps: bool,
) -> Result<(), BackendError> {
    let base_python = find_base_python(python)?;
    let mut spec = CommandSpec::new(base_python)
        .args(["-m", "venv"])
        .arg(path.display().to_string())
        .timeout(VENV_CREATE_TIMEOUT);
    if upgrade_deps {
        spec = spec.arg("--upgrade-deps");
    }
    let output = spec.output().await?;
    if !output.success() {
        return Err(BackendError::VenvCreationFailed {
            stderr: output.stderr.trim().to_string(),
        });
    }
    // A zero exit with no interpreter behind it is still a failure.
    VenvLayout::new(path).existing_python()?;
    Ok(())
}

/// `<venv python> -m pip <args…>`.
pub(crate) fn venv_pip(env: &VenvLayout) -> Result<CommandSpec, BackendError> {
    let python = env.existing_python()?;
    Ok(CommandSpec::new(python)
        .args(["-m", "pip"])
        .timeout(QUERY_TIMEOUT))
}

pub(crate) async fn pip_install(
    env: &VenvLayout,
    specs: &[Requirement],
    options: &InstallOptions,
) -> Result<InstallOutcome, BackendError> {
    if specs.is_empty() {
        return Ok(InstallOutcome::default());
    }
    let mut outcome = InstallOutcome::default();
    let batch = install_command(env, specs, options)?;
    let output = batch.output().await?;
    if output.success() {
        outcome.installed = specs.iter().map(|spec| spec.name.clone()).collect();
        return Ok(outcome);
    }
    // Attribute failures by retrying one spec at a time.
    debug!("batch install failed, retrying per spec to attribute failures");
    for spec in specs {
        let single = install_command(env, std::slice::from_ref(spec), options)?;
        let output = single.output().await?;
        if output.success() {
            outcome.installed.push(spec.name.clone());
        } else {
            outcome
                .failed
                .push((spec.name.clone(), output.stderr.trim().to_string()));
        }
    }
    Ok(outcome)
}

fn install_command(
    env: &VenvLayout,
    specs: &[Requirement],
    options: &InstallOptions,
) -> Result<CommandSpec, BackendError> {
    let mut command = venv_pip(env)?.arg("install").timeout(options.timeout);
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
    Ok(command)
}

pub(crate) async fn pip_install_wheel(env: &VenvLayout, wheel: &Path) -> Result<(), BackendError> {
    venv_pip(env)?
        .arg("install")
        .arg("--no-index")
        .arg(wheel.display().to_string())
        .timeout(DEFAULT_INSTALL_TIMEOUT)
        .output_checked()
        .await?;
    Ok(())
}

pub(crate) async fn pip_uninstall(env: &VenvLayout, name: &str) -> Result<(), BackendError> {
    venv_pip(env)?
        .args(["uninstall", "--yes", name])
        .output_checked()
        .await?;
    Ok(())
}

pub(crate) async fn pip_list(env: &VenvLayout) -> Result<Vec<InstalledPackage>, BackendError> {
    let output = venv_pip(env)?
        .args(["list", "--format=json"])
        .output_checked()
        .await?;
    parse_pip_list_json("pip", &output.stdout)
}

pub(crate) async fn pip_freeze(env: &VenvLayout) -> Result<Vec<Requirement>, BackendError> {
    let output = venv_pip(env)?.arg("freeze").output_checked().await?;
    Ok(parse_freeze_lines(&output.stdout))
}

pub(crate) async fn pip_check(env: &VenvLayout) -> Result<Vec<Conflict>, BackendError> {
    // Non-zero exit is the expected signal that conflicts exist.
    let output = venv_pip(env)?.arg("check").output().await?;
    if output.success() {
        Ok(Vec::new())
    } else {
        Ok(parse_check_lines(&output.stdout))
    }
}

#[async_trait]
impl Backend for PipBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Pip
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

    async fn create_lock(&self, _manifest_dir: &Path) -> Result<Option<PathBuf>, BackendError> {
        // pip has no lock capability.
        Ok(None)
    }
}
