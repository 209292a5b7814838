//! Isolation strategies for ephemeral environments, with graceful
//! downgrade when a level's prerequisites are absent: container →
//! namespace → chroot → process.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use gestvenv_backend::CommandSpec;

use crate::models::{EphemeralEnvironment, IsolationLevel};
use crate::EphemeralError;

const CONTAINER_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
const IMAGE_BUILD_TIMEOUT: Duration = Duration::from_secs(300);

/// What `prepare` actually applied, after any downgrades.
#[derive(Debug, Clone, Default)]
pub struct AppliedIsolation {
    pub level: IsolationLevel,
    pub container_id: Option<String>,
    pub script: Option<PathBuf>,
    pub chroot: Option<PathBuf>,
}

#[derive(Debug)]
pub struct IsolationProvider {
    /// `docker` or `podman`, when one is installed.
    container_runtime: Option<PathBuf>,
}

impl IsolationProvider {
    pub async fn detect() -> Self {
        let mut container_runtime = None;
        for candidate in ["docker", "podman"] {
            if let Ok(path) = which::which(candidate) {
                let probe = CommandSpec::new(&path)
                    .arg("--version")
                    .timeout(Duration::from_secs(10))
                    .output()
                    .await;
                if matches!(probe, Ok(output) if output.success()) {
                    debug!("found container runtime `{}`", path.display());
                    container_runtime = Some(path);
                    break;
                }
            }
        }
        Self { container_runtime }
    }

    /// Provider with no container runtime; namespace/chroot probes still
    /// run. Used by tests and embedders that forbid containers.
    pub fn without_container_runtime() -> Self {
        Self {
            container_runtime: None,
        }
    }

    /// Apply the strongest satisfiable level at or below the requested
    /// one, recording what was actually applied.
    pub async fn prepare(
        &self,
        env: &mut EphemeralEnvironment,
    ) -> Result<AppliedIsolation, EphemeralError> {
        let mut level = env.requested_isolation;
        loop {
            match self.try_level(env, level).await {
                Ok(applied) => {
                    if applied.level != env.requested_isolation {
                        warn!(
                            "isolation downgraded from {:?} to {:?} for {}",
                            env.requested_isolation, applied.level, env.id
                        );
                    }
                    env.isolation = applied.level;
                    env.container_id = applied.container_id.clone();
                    env.isolation_script = applied.script.clone();
                    env.chroot_path = applied.chroot.clone();
                    return Ok(applied);
                }
                Err(reason) => match level.downgrade() {
                    Some(next) => {
                        debug!("isolation level {level:?} unavailable ({reason}), trying {next:?}");
                        level = next;
                    }
                    None => {
                        // Process isolation never fails.
                        env.isolation = IsolationLevel::Process;
                        return Ok(AppliedIsolation {
                            level: IsolationLevel::Process,
                            ..AppliedIsolation::default()
                        });
                    }
                },
            }
        }
    }

    async fn try_level(
        &self,
        env: &EphemeralEnvironment,
        level: IsolationLevel,
    ) -> Result<AppliedIsolation, String> {
        match level {
            IsolationLevel::Process => Ok(AppliedIsolation {
                level,
                ..AppliedIsolation::default()
            }),
            IsolationLevel::Namespace => self.prepare_namespace(env).await,
            IsolationLevel::Container => self.prepare_container(env).await,
            IsolationLevel::Chroot => self.prepare_chroot(env),
        }
    }

    // --- namespaces ---

    async fn prepare_namespace(
        &self,
        env: &EphemeralEnvironment,
    ) -> Result<AppliedIsolation, String> {
        if !cfg!(target_os = "linux") {
            return Err("namespaces are Linux-only".to_string());
        }
        which::which("unshare").map_err(|_| "unshare is not installed".to_string())?;
        let proc_ns = Path::new("/proc/self/ns");
        for kind in ["pid", "net", "mnt", "ipc", "uts", "user"] {
            if !proc_ns.join(kind).exists() {
                return Err(format!("namespace `{kind}` is not exposed"));
            }
        }
        let storage = env
            .storage_path
            .as_deref()
            .ok_or_else(|| "no storage allocated".to_string())?;
        let script = write_namespace_script(env, storage).map_err(|err| err.to_string())?;
        info!("namespace isolation configured for {}", env.id);
        Ok(AppliedIsolation {
            level: IsolationLevel::Namespace,
            script: Some(script),
            ..AppliedIsolation::default()
        })
    }

    // --- containers ---

    async fn prepare_container(
        &self,
        env: &EphemeralEnvironment,
    ) -> Result<AppliedIsolation, String> {
        let runtime = self
            .container_runtime
            .as_deref()
            .ok_or_else(|| "no container runtime available".to_string())?;
        let storage = env
            .storage_path
            .as_deref()
            .ok_or_else(|| "no storage allocated".to_string())?;

        let image = format!("gestvenv-ephemeral-{}", env.python_version);
        self.ensure_image(runtime, &image, &env.python_version)
            .await?;

        let mut create = CommandSpec::new(runtime)
            .arg("create")
            .args(["--name", &format!("gestvenv-{}", &env.id[..8])])
            .args(["--workdir", "/workspace"])
            .arg("--rm")
            .args(["-v", &format!("{}:/workspace:rw", storage.display())])
            .timeout(CONTAINER_COMMAND_TIMEOUT);
        if let Some(memory_mb) = env.limits.max_memory_mb {
            create = create.args(["--memory", &format!("{memory_mb}m")]);
        }
        if let Some(percent) = env.limits.max_cpu_percent {
            create = create.args(["--cpus", &format!("{:.2}", f64::from(percent) / 100.0)]);
        }
        if !env.limits.network_access {
            create = create.args(["--network", "none"]);
        }
        let create = create.arg(&image).args(["sleep", "infinity"]);

        let output = create.output().await.map_err(|err| err.to_string())?;
        if !output.success() {
            return Err(format!("container create failed: {}", output.stderr.trim()));
        }
        let container_id = output.stdout.trim().to_string();

        let started = CommandSpec::new(runtime)
            .args(["start", &container_id])
            .timeout(CONTAINER_COMMAND_TIMEOUT)
            .output()
            .await
            .map_err(|err| err.to_string())?;
        if !started.success() {
            return Err(format!("container start failed: {}", started.stderr.trim()));
        }
        info!(
            "container isolation configured for {}: {}",
            env.id,
            &container_id[..container_id.len().min(12)]
        );
        Ok(AppliedIsolation {
            level: IsolationLevel::Container,
            container_id: Some(container_id),
            ..AppliedIsolation::default()
        })
    }

    /// Build or reuse the minimal per-python-version image.
    async fn ensure_image(
        &self,
        runtime: &Path,
        image: &str,
        python_version: &str,
    ) -> Result<(), String> {
        let inspect = CommandSpec::new(runtime)
            .args(["image", "inspect", image])
            .timeout(CONTAINER_COMMAND_TIMEOUT)
            .output()
            .await
            .map_err(|err| err.to_string())?;
        if inspect.success() {
            return Ok(());
        }

        let context = tempfile::tempdir().map_err(|err| err.to_string())?;
        let dockerfile = format!(
            "FROM python:{python_version}-slim\n\
             WORKDIR /workspace\n\
             RUN mkdir -p /workspace/tmp /workspace/cache\n\
             ENV PYTHONUNBUFFERED=1\n\
             ENV PYTHONDONTWRITEBYTECODE=1\n\
             CMD [\"/bin/bash\"]\n"
        );
        fs_err::write(context.path().join("Dockerfile"), dockerfile)
            .map_err(|err| err.to_string())?;
        let build = CommandSpec::new(runtime)
            .args(["build", "-t", image])
            .arg(context.path().display().to_string())
            .timeout(IMAGE_BUILD_TIMEOUT)
            .output()
            .await
            .map_err(|err| err.to_string())?;
        if !build.success() {
            return Err(format!("image build failed: {}", build.stderr.trim()));
        }
        info!("built container image `{image}`");
        Ok(())
    }

    /// Remove any container the env owns; errors are reported so forced
    /// cleanup can swallow them.
    pub async fn teardown(&self, env: &EphemeralEnvironment) -> Result<(), EphemeralError> {
        let Some(container_id) = &env.container_id else {
            return Ok(());
        };
        let Some(runtime) = self.container_runtime.as_deref() else {
            return Ok(());
        };
        let output = CommandSpec::new(runtime)
            .args(["rm", "-f", container_id])
            .timeout(CONTAINER_COMMAND_TIMEOUT)
            .output()
            .await?;
        if !output.success() && !output.stderr.contains("No such container") {
            return Err(EphemeralError::Cleanup {
                message: format!("container removal failed: {}", output.stderr.trim()),
            });
        }
        Ok(())
    }

    // --- chroot ---

    fn prepare_chroot(&self, env: &EphemeralEnvironment) -> Result<AppliedIsolation, String> {
        #[cfg(unix)]
        {
            if !nix::unistd::geteuid().is_root() {
                return Err("chroot requires root privileges".to_string());
            }
            let storage = env
                .storage_path
                .as_deref()
                .ok_or_else(|| "no storage allocated".to_string())?;
            let chroot = storage.join("chroot");
            populate_chroot(&chroot).map_err(|err| err.to_string())?;
            info!("chroot isolation configured at `{}`", chroot.display());
            return Ok(AppliedIsolation {
                level: IsolationLevel::Chroot,
                chroot: Some(chroot),
                ..AppliedIsolation::default()
            });
        }
        #[cfg(not(unix))]
        {
            let _ = env;
            Err("chroot is unix-only".to_string())
        }
    }
}

/// Shell script that re-executes its arguments inside fresh namespaces.
fn write_namespace_script(
    env: &EphemeralEnvironment,
    storage: &Path,
) -> std::io::Result<PathBuf> {
    let mut options = vec!["--pid", "--fork", "--mount", "--ipc", "--uts"];
    if !env.limits.network_access {
        options.push("--net");
    }
    let script = format!(
        "#!/bin/sh\nset -e\nexec unshare {} --mount-proc \\\n  env PYTHONDONTWRITEBYTECODE=1 PYTHONUNBUFFERED=1 TMPDIR=\"{}/tmp\" \\\n  \"$@\"\n",
        options.join(" "),
        storage.display(),
    );
    let path = storage.join("isolation.sh");
    fs_err::write(&path, script)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs_err::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(path)
}

/// Populate a minimal chroot: shell, python, loader libraries and the
/// basic device nodes.
#[cfg(unix)]
fn populate_chroot(chroot: &Path) -> std::io::Result<()> {
    for dir in [
        "bin", "usr/bin", "lib", "lib64", "usr/lib", "etc", "tmp", "dev", "proc", "workspace",
    ] {
        fs_err::create_dir_all(chroot.join(dir))?;
    }
    for binary in ["/bin/sh", "/bin/bash", "/usr/bin/python3", "/bin/ls", "/bin/cat"] {
        let source = Path::new(binary);
        if !source.exists() {
            continue;
        }
        let destination = chroot.join(binary.trim_start_matches('/'));
        if let Some(parent) = destination.parent() {
            fs_err::create_dir_all(parent)?;
        }
        if let Err(err) = fs_err::copy(source, &destination) {
            debug!("could not copy `{binary}` into the chroot: {err}");
        }
    }
    for (name, major, minor) in [("null", 1, 3), ("zero", 1, 5), ("random", 1, 8), ("urandom", 1, 9)]
    {
        let node = chroot.join("dev").join(name);
        if node.exists() {
            continue;
        }
        let device = nix::sys::stat::makedev(major, minor);
        if let Err(err) = nix::sys::stat::mknod(
            &node,
            nix::sys::stat::SFlag::S_IFCHR,
            nix::sys::stat::Mode::from_bits_truncate(0o666),
            device,
        ) {
            debug!("could not create device node `{name}`: {err}");
        }
    }
    Ok(())
}
