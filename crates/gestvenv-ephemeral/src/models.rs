//! Data model for the ephemeral runtime.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gestvenv_backend::{BackendKind, BackendPreference};

/// State of one ephemeral environment.
///
/// `PENDING → CREATING → READY ⇄ RUNNING → CLEANING_UP → DESTROYED`, with
/// `FAILED` reachable from `CREATING` and `RUNNING`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EphemeralStatus {
    Pending,
    Creating,
    Ready,
    Running,
    CleaningUp,
    Destroyed,
    Failed,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    #[default]
    Process,
    Namespace,
    Container,
    Chroot,
}

impl IsolationLevel {
    /// The next weaker level to downgrade to when prerequisites are
    /// absent; `Process` is the floor.
    pub fn downgrade(self) -> Option<Self> {
        match self {
            Self::Container => Some(Self::Namespace),
            Self::Namespace => Some(Self::Chroot),
            Self::Chroot => Some(Self::Process),
            Self::Process => None,
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "namespace" => Ok(Self::Namespace),
            "container" => Ok(Self::Container),
            "chroot" => Ok(Self::Chroot),
            other => Err(format!("unknown isolation level `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    Permissive,
    #[default]
    Restricted,
    Sandboxed,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Disk,
    #[default]
    Tmpfs,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disk" => Ok(Self::Disk),
            "tmpfs" => Ok(Self::Tmpfs),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown storage backend `{other}`")),
        }
    }
}

/// Per-environment resource limits, enforced through cgroups v2 when the
/// controller is available.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_memory_mb: Option<u64>,
    /// Percent of one core; 100 = one full core.
    pub max_cpu_percent: Option<u32>,
    pub max_pids: Option<u32>,
    pub io_read_bps: Option<u64>,
    pub io_write_bps: Option<u64>,
    pub io_read_iops: Option<u64>,
    pub io_write_iops: Option<u64>,
    pub network_access: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: None,
            max_cpu_percent: None,
            max_pids: Some(100),
            io_read_bps: None,
            io_write_bps: None,
            io_read_iops: None,
            io_write_iops: None,
            network_access: true,
        }
    }
}

/// Global configuration of the ephemeral runtime.
#[derive(Debug, Clone)]
pub struct EphemeralConfig {
    pub max_concurrent: usize,
    pub max_total_memory_mb: u64,
    pub max_total_disk_mb: u64,
    pub storage_backend: StorageBackend,
    pub base_storage_path: Option<PathBuf>,
    pub default_isolation: IsolationLevel,
    pub default_security: SecurityMode,
    pub default_ttl: Option<u64>,
    pub default_max_idle: u64,
    pub cleanup_interval: Duration,
    pub force_cleanup_after: Duration,
    pub monitoring_interval: Duration,
    pub enable_preallocation: bool,
}

impl Default for EphemeralConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 50,
            max_total_memory_mb: 8192,
            max_total_disk_mb: 20480,
            storage_backend: StorageBackend::Tmpfs,
            base_storage_path: None,
            default_isolation: IsolationLevel::Process,
            default_security: SecurityMode::Restricted,
            default_ttl: Some(3600),
            default_max_idle: 300,
            cleanup_interval: Duration::from_secs(60),
            force_cleanup_after: Duration::from_secs(7200),
            monitoring_interval: Duration::from_secs(5),
            enable_preallocation: true,
        }
    }
}

/// What a caller asks for when entering a scoped guard.
#[derive(Debug, Clone, Default)]
pub struct EphemeralRequest {
    pub name: Option<String>,
    pub python_version: Option<String>,
    pub backend: Option<BackendPreference>,
    pub ttl: Option<u64>,
    pub max_idle: Option<u64>,
    pub isolation: Option<IsolationLevel>,
    pub security: Option<SecurityMode>,
    pub limits: ResourceLimits,
    /// Estimated storage need, used by admission and preallocation.
    pub estimated_disk_mb: u64,
}

/// The live record of one ephemeral environment.
#[derive(Debug)]
pub struct EphemeralEnvironment {
    pub id: String,
    pub name: String,
    pub python_version: String,
    /// How the backend should be selected at creation time.
    pub backend_preference: BackendPreference,
    /// The backend actually selected; meaningful once CREATING started.
    pub backend: BackendKind,
    pub status: EphemeralStatus,
    pub ttl: Option<Duration>,
    pub max_idle: Duration,
    pub created_at: Timestamp,
    pub(crate) created_instant: Instant,
    pub(crate) last_activity: Instant,
    pub storage_path: Option<PathBuf>,
    pub venv_path: Option<PathBuf>,
    pub requested_isolation: IsolationLevel,
    pub isolation: IsolationLevel,
    pub security: SecurityMode,
    pub limits: ResourceLimits,
    pub estimated_disk_mb: u64,
    pub pid: Option<u32>,
    pub container_id: Option<String>,
    pub cgroup_path: Option<PathBuf>,
    pub isolation_script: Option<PathBuf>,
    pub chroot_path: Option<PathBuf>,
    pub packages: Vec<String>,
    pub peak_memory_mb: f64,
    pub peak_disk_mb: f64,
}

impl EphemeralEnvironment {
    pub(crate) fn from_request(request: &EphemeralRequest, config: &EphemeralConfig) -> Self {
        // 128 bits of entropy, hyphen-free for path friendliness.
        let id = Uuid::new_v4().simple().to_string();
        let name = request
            .name
            .clone()
            .unwrap_or_else(|| format!("ephemeral-{}", &id[..8]));
        let now = Instant::now();
        Self {
            id,
            name,
            python_version: request
                .python_version
                .clone()
                .unwrap_or_else(|| "3.11".to_string()),
            backend_preference: request.backend.unwrap_or_default(),
            backend: BackendKind::Pip,
            status: EphemeralStatus::Pending,
            ttl: request.ttl.or(config.default_ttl).map(Duration::from_secs),
            max_idle: Duration::from_secs(request.max_idle.unwrap_or(config.default_max_idle)),
            created_at: Timestamp::now(),
            created_instant: now,
            last_activity: now,
            storage_path: None,
            venv_path: None,
            requested_isolation: request.isolation.unwrap_or(config.default_isolation),
            isolation: IsolationLevel::Process,
            security: request.security.unwrap_or(config.default_security),
            limits: request.limits.clone(),
            estimated_disk_mb: if request.estimated_disk_mb == 0 {
                1024
            } else {
                request.estimated_disk_mb
            },
            pid: None,
            container_id: None,
            cgroup_path: None,
            isolation_script: None,
            chroot_path: None,
            packages: Vec::new(),
            peak_memory_mb: 0.0,
            peak_disk_mb: 0.0,
        }
    }

    pub fn age(&self) -> Duration {
        self.created_instant.elapsed()
    }

    pub fn idle(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// READY or RUNNING.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            EphemeralStatus::Ready | EphemeralStatus::Running
        )
    }

    pub fn is_expired(&self) -> bool {
        self.ttl.is_some_and(|ttl| self.age() > ttl)
    }

    pub fn is_idle_expired(&self) -> bool {
        self.idle() > self.max_idle
    }
}

/// Result of running a command inside an ephemeral environment.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub command: String,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// One monitoring sample.
#[derive(Debug, Clone)]
pub struct ResourceUsage {
    pub memory_mb: f64,
    pub disk_mb: f64,
    pub cpu_usage_usec: u64,
    pub active_pids: u64,
    pub sampled_at: Timestamp,
}
