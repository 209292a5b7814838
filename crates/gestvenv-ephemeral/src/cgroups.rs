//! cgroups v2 bindings for per-environment resource limits.
//!
//! Availability requires the unified hierarchy mount and the `memory`,
//! `cpu`, `io` and `pids` controllers. Limit application is plain control
//! file writes; deletion kills every member process (SIGTERM, short
//! grace, SIGKILL) before removing the group directory.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::ResourceLimits;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const REQUIRED_CONTROLLERS: &[&str] = &["memory", "cpu", "io", "pids"];
/// `cpu.max` period in microseconds.
const CPU_PERIOD_USEC: u64 = 100_000;
/// Grace between SIGTERM and SIGKILL for member processes.
const KILL_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum CgroupError {
    #[error("cgroups v2 is not available on this system")]
    NotAvailable,
    #[error("cgroup operation on `{}` failed: {source}", path.display())]
    Operation {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A created cgroup directory, owned by exactly one ephemeral env.
#[derive(Debug, Clone)]
pub struct CgroupHandle {
    pub path: PathBuf,
}

/// Statistics read back from the control files.
#[derive(Debug, Clone, Default)]
pub struct CgroupStats {
    pub memory_current: u64,
    pub memory_peak: u64,
    pub cpu_usage_usec: u64,
    pub io_read_bytes: u64,
    pub io_write_bytes: u64,
    pub pids_current: u64,
    pub pids_peak: u64,
}

#[derive(Debug)]
pub struct CgroupController {
    root: PathBuf,
    controllers: Vec<String>,
}

impl CgroupController {
    /// Probe the host's unified hierarchy.
    pub fn detect() -> Self {
        Self::with_root(PathBuf::from(CGROUP_ROOT))
    }

    /// Use an explicit hierarchy root; tests point this at a fixture.
    pub fn with_root(root: PathBuf) -> Self {
        let controllers = fs_err::read_to_string(root.join("cgroup.controllers"))
            .map(|content| {
                content
                    .split_whitespace()
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let controller = Self { root, controllers };
        if controller.is_available() {
            info!(
                "cgroups v2 available with controllers: {}",
                controller.controllers.join(" ")
            );
        } else {
            debug!("cgroups v2 not available, resource limits will not be enforced");
        }
        controller
    }

    pub fn is_available(&self) -> bool {
        REQUIRED_CONTROLLERS
            .iter()
            .all(|required| self.controllers.iter().any(|have| have == required))
    }

    /// Base directory our groups live under: the user slice when
    /// delegated, the hierarchy root otherwise.
    fn base_dir(&self) -> PathBuf {
        #[cfg(unix)]
        {
            let uid = nix::unistd::getuid().as_raw();
            let user_slice = self
                .root
                .join("user.slice")
                .join(format!("user-{uid}.slice"));
            if user_slice.is_dir() {
                return user_slice.join("gestvenv");
            }
        }
        self.root.join("gestvenv")
    }

    /// Create `…/gestvenv-<id8>/` and apply `limits`.
    pub fn create(&self, env_id: &str, limits: &ResourceLimits) -> Result<CgroupHandle, CgroupError> {
        if !self.is_available() {
            return Err(CgroupError::NotAvailable);
        }
        let short_id = &env_id[..env_id.len().min(8)];
        let base = self.base_dir();
        fs_err::create_dir_all(&base).map_err(|source| CgroupError::Operation {
            path: base.clone(),
            source,
        })?;
        self.enable_controllers(base.parent().unwrap_or(&self.root));
        let path = base.join(format!("gestvenv-{short_id}"));
        fs_err::create_dir_all(&path).map_err(|source| CgroupError::Operation {
            path: path.clone(),
            source,
        })?;
        self.enable_controllers(&base);
        self.apply_limits(&path, limits)?;
        info!("created cgroup `{}`", path.display());
        Ok(CgroupHandle { path })
    }

    /// `+memory +cpu +io +pids` on the parent's subtree control; failure
    /// is logged, the kernel may already have them enabled.
    fn enable_controllers(&self, parent: &Path) {
        let subtree = parent.join("cgroup.subtree_control");
        if !subtree.exists() {
            return;
        }
        let wanted: Vec<String> = REQUIRED_CONTROLLERS
            .iter()
            .filter(|controller| self.controllers.iter().any(|have| have == *controller))
            .map(|controller| format!("+{controller}"))
            .collect();
        if wanted.is_empty() {
            return;
        }
        if let Err(err) = fs_err::write(&subtree, wanted.join(" ")) {
            debug!("could not enable controllers on `{}`: {err}", parent.display());
        }
    }

    fn apply_limits(&self, path: &Path, limits: &ResourceLimits) -> Result<(), CgroupError> {
        if let Some(memory_mb) = limits.max_memory_mb {
            let max = memory_mb * 1024 * 1024;
            self.write_control(path, "memory.max", &max.to_string())?;
            // Soft ceiling at 80% so reclaim starts before the OOM kill.
            self.write_control(path, "memory.high", &(max * 8 / 10).to_string())?;
            self.write_control(path, "memory.swap.max", "0")?;
        }
        if let Some(percent) = limits.max_cpu_percent {
            let quota = CPU_PERIOD_USEC * u64::from(percent) / 100;
            self.write_control(path, "cpu.max", &format!("{quota} {CPU_PERIOD_USEC}"))?;
        }
        if let Some(pids) = limits.max_pids {
            self.write_control(path, "pids.max", &pids.to_string())?;
        }
        let mut io_parts = Vec::new();
        if let Some(bps) = limits.io_read_bps {
            io_parts.push(format!("rbps={bps}"));
        }
        if let Some(bps) = limits.io_write_bps {
            io_parts.push(format!("wbps={bps}"));
        }
        if let Some(iops) = limits.io_read_iops {
            io_parts.push(format!("riops={iops}"));
        }
        if let Some(iops) = limits.io_write_iops {
            io_parts.push(format!("wiops={iops}"));
        }
        if !io_parts.is_empty() {
            if let Some(device) = root_device() {
                self.write_control(path, "io.max", &format!("{device} {}", io_parts.join(" ")))?;
            } else {
                debug!("could not resolve the root device, skipping io.max");
            }
        }
        Ok(())
    }

    fn write_control(&self, path: &Path, file: &str, value: &str) -> Result<(), CgroupError> {
        let control = path.join(file);
        debug!("writing `{value}` to `{}`", control.display());
        fs_err::write(&control, value).map_err(|source| CgroupError::Operation {
            path: control,
            source,
        })
    }

    /// Attach a process to the group.
    pub fn add_process(&self, handle: &CgroupHandle, pid: u32) -> Result<(), CgroupError> {
        self.write_control(&handle.path, "cgroup.procs", &pid.to_string())
    }

    pub fn stats(&self, handle: &CgroupHandle) -> CgroupStats {
        let read_u64 = |file: &str| -> u64 {
            fs_err::read_to_string(handle.path.join(file))
                .ok()
                .and_then(|content| content.trim().parse().ok())
                .unwrap_or(0)
        };
        let mut stats = CgroupStats {
            memory_current: read_u64("memory.current"),
            memory_peak: read_u64("memory.peak"),
            pids_current: read_u64("pids.current"),
            pids_peak: read_u64("pids.peak"),
            ..CgroupStats::default()
        };
        if let Ok(cpu) = fs_err::read_to_string(handle.path.join("cpu.stat")) {
            for line in cpu.lines() {
                if let Some(value) = line.strip_prefix("usage_usec ") {
                    stats.cpu_usage_usec = value.trim().parse().unwrap_or(0);
                }
            }
        }
        if let Ok(io) = fs_err::read_to_string(handle.path.join("io.stat")) {
            for line in io.lines() {
                for part in line.split_whitespace() {
                    if let Some(value) = part.strip_prefix("rbytes=") {
                        stats.io_read_bytes += value.parse().unwrap_or(0);
                    } else if let Some(value) = part.strip_prefix("wbytes=") {
                        stats.io_write_bytes += value.parse().unwrap_or(0);
                    }
                }
            }
        }
        stats
    }

    /// Kill every member process, then remove the group directory.
    pub async fn delete(&self, handle: &CgroupHandle) -> Result<(), CgroupError> {
        if !handle.path.exists() {
            return Ok(());
        }
        self.kill_members(handle).await;
        fs_err::remove_dir(&handle.path).map_err(|source| CgroupError::Operation {
            path: handle.path.clone(),
            source,
        })?;
        info!("deleted cgroup `{}`", handle.path.display());
        Ok(())
    }

    async fn kill_members(&self, handle: &CgroupHandle) {
        let pids = self.member_pids(handle);
        if pids.is_empty() {
            return;
        }
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            for pid in &pids {
                #[allow(clippy::cast_possible_wrap)]
                let _ = kill(Pid::from_raw(*pid as i32), Signal::SIGTERM);
            }
            tokio::time::sleep(KILL_GRACE).await;
            for pid in self.member_pids(handle) {
                warn!("SIGKILL for surviving pid {pid}");
                #[allow(clippy::cast_possible_wrap)]
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        }
    }

    fn member_pids(&self, handle: &CgroupHandle) -> Vec<u32> {
        fs_err::read_to_string(handle.path.join("cgroup.procs"))
            .map(|content| {
                content
                    .lines()
                    .filter_map(|line| line.trim().parse().ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// `major:minor` of the device backing `/`.
fn root_device() -> Option<String> {
    #[cfg(unix)]
    {
        let stat = nix::sys::stat::stat("/").ok()?;
        let major = nix::sys::stat::major(stat.st_dev);
        let minor = nix::sys::stat::minor(stat.st_dev);
        Some(format!("{major}:{minor}"))
    }
    #[cfg(not(unix))]
    {
        None
    }
}
