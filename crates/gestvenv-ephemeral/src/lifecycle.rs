//! Drives one ephemeral environment through creation and teardown, and
//! runs commands inside it.
//!
//! Creation order: allocate storage → build the venv → configure
//! isolation → install the cgroup. Destruction runs the same steps in
//! reverse: stop processes → tear down isolation → release the cgroup →
//! release storage.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use gestvenv_backend::{BackendRegistry, CommandSpec, InstallOptions};
use gestvenv_manifest::Requirement;
use gestvenv_platform::VenvLayout;

use crate::cgroups::{CgroupController, CgroupHandle};
use crate::isolation::IsolationProvider;
use crate::models::{
    EphemeralEnvironment, EphemeralStatus, ExecOutcome, SecurityMode,
};
use crate::storage::StorageAllocator;
use crate::EphemeralError;

const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(300);
/// Grace between SIGTERM and SIGKILL for the primary child.
const STOP_GRACE: Duration = Duration::from_secs(5);

pub(crate) struct LifecycleController {
    pub(crate) backends: Arc<BackendRegistry>,
    pub(crate) storage: StorageAllocator,
    pub(crate) isolation: IsolationProvider,
    pub(crate) cgroups: CgroupController,
}

impl LifecycleController {
    /// Bring `env` from CREATING to the point where READY can be entered.
    /// On error the caller owns emergency cleanup.
    pub(crate) async fn create(
        &self,
        env: &mut EphemeralEnvironment,
    ) -> Result<(), EphemeralError> {
        info!("creating ephemeral environment {} ({})", env.id, env.name);

        let root = self.storage.allocate(&env.id, env.estimated_disk_mb)?;
        env.storage_path = Some(root.clone());
        for dir in ["tmp", "logs", "cache"] {
            fs_err::create_dir_all(root.join(dir))?;
        }

        let backend = self
            .backends
            .select(env.backend_preference)
            .map_err(EphemeralError::Backend)?;
        env.backend = backend.kind();
        let venv_path = root.join("venv");
        backend
            .create_venv(&venv_path, &env.python_version)
            .await?;
        env.venv_path = Some(venv_path);

        self.isolation.prepare(env).await?;

        // Resource limits are best effort: a host without delegation still
        // gets a working environment.
        if self.cgroups.is_available() {
            match self.cgroups.create(&env.id, &env.limits) {
                Ok(handle) => env.cgroup_path = Some(handle.path),
                Err(err) => warn!("resource limits not applied for {}: {err}", env.id),
            }
        } else {
            debug!("cgroups v2 unavailable, skipping resource limits for {}", env.id);
        }
        Ok(())
    }

    /// Tear everything down in reverse creation order. With `force`,
    /// every error is logged and swallowed; otherwise the first error is
    /// returned after the remaining steps have still been attempted.
    pub(crate) async fn destroy(
        &self,
        env: &mut EphemeralEnvironment,
        force: bool,
    ) -> Result<(), EphemeralError> {
        info!("cleaning up ephemeral environment {} (force={force})", env.id);
        let mut first_error: Option<EphemeralError> = None;
        let mut note = |error: EphemeralError| {
            warn!("cleanup step failed: {error}");
            if first_error.is_none() {
                first_error = Some(error);
            }
        };

        self.stop_primary_process(env).await;

        if let Err(err) = self.isolation.teardown(env).await {
            note(err);
        }
        env.container_id = None;

        if let Some(path) = env.cgroup_path.take() {
            let handle = CgroupHandle { path };
            if let Err(err) = self.cgroups.delete(&handle).await {
                note(err.into());
            }
        }

        if let Some(root) = env.storage_path.take() {
            if let Err(err) = self.storage.release(&root).await {
                note(err);
            }
        }
        env.venv_path = None;

        match first_error {
            Some(error) if !force => Err(error),
            _ => Ok(()),
        }
    }

    async fn stop_primary_process(&self, env: &mut EphemeralEnvironment) {
        let Some(pid) = env.pid.take() else {
            return;
        };
        #[cfg(not(unix))]
        let _ = pid;
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            #[allow(clippy::cast_possible_wrap)]
            let target = Pid::from_raw(pid as i32);
            if kill(target, Signal::SIGTERM).is_err() {
                return; // Already gone.
            }
            let deadline = Instant::now() + STOP_GRACE;
            while Instant::now() < deadline {
                // Signal 0 probes liveness.
                if kill(target, None).is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            warn!("pid {pid} survived SIGTERM, sending SIGKILL");
            let _ = kill(target, Signal::SIGKILL);
        }
    }

    /// Run a shell command inside the environment. The venv's scripts
    /// directory leads `PATH`; the working directory is the storage root.
    pub(crate) async fn execute(
        &self,
        env: &mut EphemeralEnvironment,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutcome, EphemeralError> {
        if !env.is_active() {
            return Err(EphemeralError::NotActive {
                id: env.id.clone(),
            });
        }
        let root = env
            .storage_path
            .clone()
            .ok_or_else(|| EphemeralError::NotActive { id: env.id.clone() })?;
        env.touch();
        env.status = EphemeralStatus::Running;

        let started = Instant::now();
        let mut spec = CommandSpec::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .current_dir(&root)
            .timeout(timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT))
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONUNBUFFERED", "1")
            .env("PIP_CACHE_DIR", root.join("cache").join("pip").display().to_string())
            .env("UV_CACHE_DIR", root.join("cache").join("uv").display().to_string());
        if let Some(venv) = &env.venv_path {
            let layout = VenvLayout::new(venv);
            let path_value = std::env::var("PATH").unwrap_or_default();
            spec = spec
                .env("VIRTUAL_ENV", venv.display().to_string())
                .env(
                    "PATH",
                    format!("{}:{path_value}", layout.scripts_dir().display()),
                );
        }
        if env.security == SecurityMode::Restricted || env.security == SecurityMode::Sandboxed {
            spec = spec
                .env("HOME", root.display().to_string())
                .env("TMPDIR", root.join("tmp").display().to_string());
        }

        let result = spec.output().await;
        let duration = started.elapsed();
        env.status = EphemeralStatus::Ready;
        env.touch();

        let output = result?;
        Ok(ExecOutcome {
            code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
            duration,
            command: command.to_string(),
        })
    }

    /// Install packages through the env's backend trait implementation.
    pub(crate) async fn install(
        &self,
        env: &mut EphemeralEnvironment,
        packages: &[String],
    ) -> Result<(), EphemeralError> {
        if packages.is_empty() {
            return Ok(());
        }
        if !env.is_active() {
            return Err(EphemeralError::NotActive {
                id: env.id.clone(),
            });
        }
        let venv = env
            .venv_path
            .clone()
            .ok_or_else(|| EphemeralError::NotActive { id: env.id.clone() })?;
        env.touch();
        env.status = EphemeralStatus::Running;

        let backend = self.backends.get(env.backend)?;
        let specs: Vec<Requirement> = packages
            .iter()
            .filter_map(|package| package.parse().ok())
            .collect();
        let outcome = backend
            .install(&VenvLayout::new(&venv), &specs, &InstallOptions::default())
            .await;

        env.status = EphemeralStatus::Ready;
        env.touch();
        let outcome = outcome?;
        env.packages.extend(outcome.installed);
        if !outcome.failed.is_empty() {
            let (package, reason) = &outcome.failed[0];
            return Err(EphemeralError::Creation {
                message: format!("install of {package} failed: {reason}"),
            });
        }
        Ok(())
    }
}

