//! The ephemeral environment manager: admission, registry, scoped guards.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gestvenv_backend::BackendRegistry;

use crate::cgroups::CgroupController;
use crate::cleanup::{spawn_scheduler, CleanupStats};
use crate::isolation::IsolationProvider;
use crate::lifecycle::LifecycleController;
use crate::models::{
    EphemeralConfig, EphemeralEnvironment, EphemeralRequest, EphemeralStatus, ExecOutcome,
    ResourceUsage,
};
use crate::monitor::spawn_monitor;
use crate::storage::StorageAllocator;
use crate::EphemeralError;

pub(crate) type SharedEnv = Arc<tokio::sync::Mutex<EphemeralEnvironment>>;

/// Aggregate view over all live ephemerals.
#[derive(Debug, Clone, Default)]
pub struct AggregateUsage {
    pub active_count: usize,
    pub total_memory_mb: u64,
    pub total_disk_mb: u64,
}

/// Point-in-time view of one environment.
#[derive(Debug, Clone)]
pub struct EphemeralSummary {
    pub id: String,
    pub name: String,
    pub status: EphemeralStatus,
    pub age: Duration,
    pub idle: Duration,
}

pub(crate) struct ManagerInner {
    pub(crate) config: EphemeralConfig,
    pub(crate) lifecycle: LifecycleController,
    /// The global registry; the lock is held only for O(1) operations.
    pub(crate) envs: tokio::sync::Mutex<HashMap<String, SharedEnv>>,
    /// Serializes the admission check-then-insert section.
    admission: tokio::sync::Mutex<()>,
    pub(crate) cleanup_stats: std::sync::Mutex<CleanupStats>,
    pub(crate) history:
        std::sync::Mutex<HashMap<String, std::collections::VecDeque<ResourceUsage>>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ManagerInner {
    /// Registry snapshot: ids plus shared records.
    pub(crate) async fn snapshot(&self) -> Vec<(String, SharedEnv)> {
        self.envs
            .lock()
            .await
            .iter()
            .map(|(id, env)| (id.clone(), env.clone()))
            .collect()
    }

    pub(crate) async fn live_ids(&self) -> Vec<String> {
        self.envs.lock().await.keys().cloned().collect()
    }

    /// Tear one environment down and drop it from the registry.
    pub(crate) async fn cleanup(&self, id: &str, force: bool) -> Result<(), EphemeralError> {
        let shared = self
            .envs
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EphemeralError::NotFound(id.to_string()))?;

        let result = {
            let mut env = shared.lock().await;
            if env.status == EphemeralStatus::CleaningUp
                || env.status == EphemeralStatus::Destroyed
            {
                debug!("environment {id} is already being cleaned up");
                return Ok(());
            }
            env.status = EphemeralStatus::CleaningUp;
            let result = self.lifecycle.destroy(&mut env, force).await;
            env.status = EphemeralStatus::Destroyed;
            result
        };

        self.envs.lock().await.remove(id);
        self.history.lock().expect("history lock poisoned").remove(id);
        result
    }

    /// Whether the registry can admit `candidate` under the global caps.
    async fn fits_caps(&self, candidate: &EphemeralEnvironment) -> Result<(), String> {
        let usage = self.aggregate_usage().await;
        if usage.active_count + 1 > self.config.max_concurrent {
            return Err(format!(
                "active environment cap reached ({})",
                self.config.max_concurrent
            ));
        }
        let projected_memory =
            usage.total_memory_mb + candidate.limits.max_memory_mb.unwrap_or(0);
        if projected_memory > self.config.max_total_memory_mb {
            return Err(format!(
                "aggregate memory cap exceeded ({projected_memory} > {} MB)",
                self.config.max_total_memory_mb
            ));
        }
        let projected_disk = usage.total_disk_mb + candidate.estimated_disk_mb;
        if projected_disk > self.config.max_total_disk_mb {
            return Err(format!(
                "aggregate disk cap exceeded ({projected_disk} > {} MB)",
                self.config.max_total_disk_mb
            ));
        }
        Ok(())
    }

    pub(crate) async fn aggregate_usage(&self) -> AggregateUsage {
        let snapshot = self.snapshot().await;
        let mut usage = AggregateUsage::default();
        for (_, shared) in snapshot {
            let env = shared.lock().await;
            if env.status == EphemeralStatus::Destroyed {
                continue;
            }
            usage.active_count += 1;
            usage.total_memory_mb += env.limits.max_memory_mb.unwrap_or(0);
            usage.total_disk_mb += env.estimated_disk_mb;
        }
        usage
    }

    /// One preemptive pass over inactive candidates when admission is
    /// about to refuse: expired, idle-expired and failed envs.
    async fn reap_inactive_once(&self) -> usize {
        let mut reaped = 0;
        for (id, shared) in self.snapshot().await {
            let eligible = {
                let env = shared.lock().await;
                env.status == EphemeralStatus::Failed
                    || env.is_expired()
                    || (env.is_active() && env.is_idle_expired())
            };
            if eligible && self.cleanup(&id, true).await.is_ok() {
                reaped += 1;
            }
        }
        reaped
    }
}

pub struct EphemeralManager {
    inner: Arc<ManagerInner>,
}

impl EphemeralManager {
    #[cfg(test)]
    pub(crate) fn inner_for_tests(&self) -> &Arc<ManagerInner> {
        &self.inner
    }

    /// Build a manager probing the host for isolation and cgroup support.
    pub async fn new(
        config: EphemeralConfig,
        backends: Arc<BackendRegistry>,
    ) -> Result<Self, EphemeralError> {
        let isolation = IsolationProvider::detect().await;
        let cgroups = CgroupController::detect();
        Self::with_components(config, backends, isolation, cgroups)
    }

    /// Build a manager from explicit components; tests and embedders pin
    /// down isolation and cgroup behavior with this.
    pub fn with_components(
        config: EphemeralConfig,
        backends: Arc<BackendRegistry>,
        isolation: IsolationProvider,
        cgroups: CgroupController,
    ) -> Result<Self, EphemeralError> {
        let storage = StorageAllocator::new(&config)?;
        let lifecycle = LifecycleController {
            backends,
            storage,
            isolation,
            cgroups,
        };
        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                lifecycle,
                envs: tokio::sync::Mutex::new(HashMap::new()),
                admission: tokio::sync::Mutex::new(()),
                cleanup_stats: std::sync::Mutex::new(CleanupStats::default()),
                history: std::sync::Mutex::new(HashMap::new()),
                tasks: std::sync::Mutex::new(Vec::new()),
            }),
        })
    }

    /// Start the background reaper, the resource monitor, and the
    /// SIGTERM handler that reaps everything before the process exits.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock().expect("task list poisoned");
        if !tasks.is_empty() {
            return;
        }
        tasks.push(spawn_scheduler(self.inner.clone()));
        tasks.push(spawn_monitor(self.inner.clone()));
        #[cfg(unix)]
        tasks.push(spawn_sigterm_handler(self.inner.clone()));
        info!("ephemeral manager started");
    }

    /// Stop background tasks and reap every live environment.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut held = self.inner.tasks.lock().expect("task list poisoned");
            held.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
        self.emergency_cleanup_all().await;
        info!("ephemeral manager stopped");
    }

    /// Enter a scoped region with a fresh environment. Teardown runs
    /// whether the body returns `Ok` or `Err`; a body cancelled mid-way
    /// leaves the environment to the cleanup scheduler, which reaps it on
    /// its next pass.
    pub async fn with_ephemeral<T, F, Fut>(
        &self,
        request: EphemeralRequest,
        body: F,
    ) -> Result<T, EphemeralError>
    where
        F: FnOnce(EphemeralHandle) -> Fut,
        Fut: Future<Output = Result<T, EphemeralError>>,
    {
        let handle = self.create(request).await?;
        let id = handle.id().to_string();
        let result = body(handle).await;
        // The single teardown path, shared by success and error exits;
        // cleanup failures are logged, never propagated past the guard.
        match self.inner.cleanup(&id, true).await {
            Ok(()) | Err(EphemeralError::NotFound(_)) => {}
            Err(err) => warn!("guard cleanup for {id} failed: {err}"),
        }
        result
    }

    /// Admission-checked creation. The admission section is serialized:
    /// when a cap is exceeded one preemptive reap of inactive envs runs,
    /// the caps are rechecked, and the call is admitted or refused.
    pub async fn create(
        &self,
        request: EphemeralRequest,
    ) -> Result<EphemeralHandle, EphemeralError> {
        let mut env = EphemeralEnvironment::from_request(&request, &self.inner.config);
        let id = env.id.clone();

        let shared: SharedEnv = {
            let _admission = self.inner.admission.lock().await;
            if self.inner.fits_caps(&env).await.is_err() {
                let reaped = self.inner.reap_inactive_once().await;
                debug!("admission pressure: reaped {reaped} inactive environment(s)");
                if let Err(reason) = self.inner.fits_caps(&env).await {
                    return Err(EphemeralError::ResourceExhausted(reason));
                }
            }
            env.status = EphemeralStatus::Creating;
            let shared = Arc::new(tokio::sync::Mutex::new(env));
            self.inner
                .envs
                .lock()
                .await
                .insert(id.clone(), shared.clone());
            shared
        };

        let creation = {
            let mut env = shared.lock().await;
            self.inner.lifecycle.create(&mut env).await
        };
        match creation {
            Ok(()) => {
                let mut env = shared.lock().await;
                env.status = EphemeralStatus::Ready;
                env.touch();
                drop(env);
                Ok(EphemeralHandle {
                    id,
                    inner: self.inner.clone(),
                    env: shared,
                })
            }
            Err(err) => {
                {
                    let mut env = shared.lock().await;
                    env.status = EphemeralStatus::Failed;
                }
                // Emergency cleanup releases whatever was acquired before
                // the failure; errors here are logged and swallowed.
                if let Err(cleanup_err) = self.inner.cleanup(&id, true).await {
                    warn!("emergency cleanup for {id} failed: {cleanup_err}");
                }
                Err(err)
            }
        }
    }

    /// Explicit teardown outside a guard.
    pub async fn cleanup(&self, id: &str, force: bool) -> Result<(), EphemeralError> {
        self.inner.cleanup(id, force).await
    }

    pub async fn list(&self) -> Vec<EphemeralSummary> {
        let mut summaries = Vec::new();
        for (id, shared) in self.inner.snapshot().await {
            let env = shared.lock().await;
            summaries.push(EphemeralSummary {
                id,
                name: env.name.clone(),
                status: env.status,
                age: env.age(),
                idle: env.idle(),
            });
        }
        summaries
    }

    pub async fn resource_usage(&self) -> AggregateUsage {
        self.inner.aggregate_usage().await
    }

    pub fn cleanup_stats(&self) -> CleanupStats {
        self.inner
            .cleanup_stats
            .lock()
            .expect("cleanup stats poisoned")
            .clone()
    }

    /// Monitoring history for one environment.
    pub fn resource_history(&self, id: &str) -> Vec<ResourceUsage> {
        self.inner
            .history
            .lock()
            .expect("history lock poisoned")
            .get(id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Reap every live environment in parallel, swallowing errors. Run
    /// on SIGTERM and at shutdown.
    pub async fn emergency_cleanup_all(&self) {
        let ids = self.inner.live_ids().await;
        if ids.is_empty() {
            return;
        }
        warn!("emergency cleanup of {} environment(s)", ids.len());
        let cleanups = ids.into_iter().map(|id| {
            let inner = self.inner.clone();
            async move {
                if let Err(err) = inner.cleanup(&id, true).await {
                    warn!("emergency cleanup of {id} failed: {err}");
                }
            }
        });
        futures::future::join_all(cleanups).await;
    }
}

/// Reap every live environment when the hosting process receives
/// SIGTERM; cleanup errors are logged and swallowed.
#[cfg(unix)]
fn spawn_sigterm_handler(inner: Arc<ManagerInner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Ok(mut sigterm) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        else {
            warn!("could not install the SIGTERM handler");
            return;
        };
        sigterm.recv().await;
        warn!("SIGTERM received, reaping all ephemeral environments");
        let ids = inner.live_ids().await;
        let cleanups = ids.into_iter().map(|id| {
            let inner = inner.clone();
            async move {
                if let Err(err) = inner.cleanup(&id, true).await {
                    warn!("emergency cleanup of {id} failed: {err}");
                }
            }
        });
        futures::future::join_all(cleanups).await;
    })
}

/// A caller's grip on one live environment inside a scoped region.
pub struct EphemeralHandle {
    id: String,
    inner: Arc<ManagerInner>,
    env: SharedEnv,
}

impl std::fmt::Debug for EphemeralHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralHandle").field("id", &self.id).finish()
    }
}

impl EphemeralHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn status(&self) -> EphemeralStatus {
        self.env.lock().await.status
    }

    pub async fn storage_path(&self) -> Option<std::path::PathBuf> {
        self.env.lock().await.storage_path.clone()
    }

    pub async fn cgroup_path(&self) -> Option<std::path::PathBuf> {
        self.env.lock().await.cgroup_path.clone()
    }

    /// Run a shell command inside the environment.
    pub async fn execute(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutcome, EphemeralError> {
        let mut env = self.env.lock().await;
        self.inner.lifecycle.execute(&mut env, command, timeout).await
    }

    /// Install packages through the environment's backend.
    pub async fn install(&self, packages: &[String]) -> Result<(), EphemeralError> {
        let mut env = self.env.lock().await;
        self.inner.lifecycle.install(&mut env, packages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IsolationLevel, StorageBackend};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};

    use gestvenv_backend::{
        Backend, BackendError, BackendKind, Conflict, InstallOptions, InstallOutcome,
        InstalledPackage,
    };
    use gestvenv_manifest::Requirement;
    use gestvenv_platform::VenvLayout;

    struct FakeBackend {
        fail_create: bool,
    }

    #[async_trait]
    impl Backend for FakeBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Pip
        }
        async fn create_venv(&self, path: &Path, python: &str) -> Result<(), BackendError> {
            if self.fail_create {
                return Err(BackendError::VenvCreationFailed {
                    stderr: "told to fail".to_string(),
                });
            }
            let layout = VenvLayout::new(path);
            fs_err::create_dir_all(layout.scripts_dir())?;
            fs_err::write(layout.python(), b"#!/bin/sh\n")?;
            fs_err::write(layout.pyvenv_cfg(), format!("version = {python}.0\n"))?;
            Ok(())
        }
        async fn install(
            &self,
            _: &VenvLayout,
            specs: &[Requirement],
            _: &InstallOptions,
        ) -> Result<InstallOutcome, BackendError> {
            Ok(InstallOutcome {
                installed: specs.iter().map(|spec| spec.name.clone()).collect(),
                failed: Vec::new(),
            })
        }
        async fn install_wheel(&self, _: &VenvLayout, _: &Path) -> Result<(), BackendError> {
            Ok(())
        }
        async fn uninstall(&self, _: &VenvLayout, _: &str) -> Result<(), BackendError> {
            Ok(())
        }
        async fn list(&self, _: &VenvLayout) -> Result<Vec<InstalledPackage>, BackendError> {
            Ok(Vec::new())
        }
        async fn freeze(&self, _: &VenvLayout) -> Result<Vec<Requirement>, BackendError> {
            Ok(Vec::new())
        }
        async fn check(&self, _: &VenvLayout) -> Result<Vec<Conflict>, BackendError> {
            Ok(Vec::new())
        }
        async fn create_lock(&self, _: &Path) -> Result<Option<PathBuf>, BackendError> {
            Ok(None)
        }
    }

    fn test_manager(dir: &Path, max_concurrent: usize, fail_create: bool) -> EphemeralManager {
        let config = EphemeralConfig {
            max_concurrent,
            storage_backend: StorageBackend::Disk,
            base_storage_path: Some(dir.join("ephemeral")),
            default_isolation: IsolationLevel::Process,
            enable_preallocation: false,
            ..EphemeralConfig::default()
        };
        let backends = Arc::new(gestvenv_backend::BackendRegistry::with_backends(vec![
            Arc::new(FakeBackend { fail_create }),
        ]));
        // A cgroup root that does not exist keeps limits off in tests.
        let cgroups = CgroupController::with_root(dir.join("no-cgroups"));
        EphemeralManager::with_components(
            config,
            backends,
            IsolationProvider::without_container_runtime(),
            cgroups,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn guard_releases_storage_on_normal_exit() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), 4, false);
        let root = manager
            .with_ephemeral(EphemeralRequest::default(), |env| async move {
                let root = env.storage_path().await.expect("storage allocated");
                assert!(root.is_dir());
                assert!(root.join("venv").join("pyvenv.cfg").is_file());
                assert_eq!(env.status().await, EphemeralStatus::Ready);
                Ok(root)
            })
            .await
            .unwrap();
        assert!(!root.exists(), "storage must be released on guard exit");
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn guard_releases_storage_on_error_exit() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), 4, false);
        let captured = std::sync::Arc::new(std::sync::Mutex::new(None::<PathBuf>));
        let capture = captured.clone();
        let result: Result<(), EphemeralError> = manager
            .with_ephemeral(EphemeralRequest::default(), |env| async move {
                capture
                    .lock()
                    .unwrap()
                    .replace(env.storage_path().await.unwrap());
                Err(EphemeralError::Creation {
                    message: "body failed".to_string(),
                })
            })
            .await;
        assert!(result.is_err());
        let root = captured.lock().unwrap().clone().unwrap();
        assert!(!root.exists(), "storage must be released on error exit");
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn failed_creation_cleans_up_and_surfaces_the_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), 4, true);
        let err = manager.create(EphemeralRequest::default()).await.unwrap_err();
        assert!(matches!(err, EphemeralError::Backend(_)));
        assert!(manager.list().await.is_empty());
        // Nothing left under the storage base.
        let base = dir.path().join("ephemeral");
        let leftovers = fs_err::read_dir(&base)
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn admission_enforces_the_concurrency_cap() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), 3, false);
        let mut handles = Vec::new();
        for _ in 0..3 {
            handles.push(manager.create(EphemeralRequest::default()).await.unwrap());
        }
        let err = manager.create(EphemeralRequest::default()).await.unwrap_err();
        assert!(matches!(err, EphemeralError::ResourceExhausted(_)));

        // Releasing one admits the next.
        let id = handles.pop().unwrap().id().to_string();
        manager.cleanup(&id, false).await.unwrap();
        let admitted = manager.create(EphemeralRequest::default()).await;
        assert!(admitted.is_ok());
    }

    #[tokio::test]
    async fn admission_enforces_the_memory_cap() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), 10, false);
        let mut request = EphemeralRequest::default();
        request.limits.max_memory_mb = Some(8192);
        let _first = manager.create(request.clone()).await.unwrap();
        let err = manager.create(request).await.unwrap_err();
        assert!(matches!(err, EphemeralError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn execute_runs_inside_the_environment() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), 4, false);
        manager
            .with_ephemeral(EphemeralRequest::default(), |env| async move {
                let outcome = env.execute("echo $VIRTUAL_ENV; pwd", None).await?;
                assert!(outcome.success());
                let mut lines = outcome.stdout.lines();
                let virtual_env = lines.next().unwrap_or_default();
                assert!(virtual_env.ends_with("/venv"));
                assert_eq!(env.status().await, EphemeralStatus::Ready);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn install_records_packages() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), 4, false);
        manager
            .with_ephemeral(EphemeralRequest::default(), |env| async move {
                env.install(&["requests>=2.31".to_string()]).await?;
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn explicit_cleanup_is_idempotent_through_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), 4, false);
        let handle = manager.create(EphemeralRequest::default()).await.unwrap();
        let id = handle.id().to_string();
        manager.cleanup(&id, false).await.unwrap();
        let err = manager.cleanup(&id, false).await.unwrap_err();
        assert!(matches!(err, EphemeralError::NotFound(_)));
    }

    #[tokio::test]
    async fn aggregate_usage_tracks_live_envs() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), 4, false);
        let mut request = EphemeralRequest::default();
        request.limits.max_memory_mb = Some(256);
        request.estimated_disk_mb = 64;
        let handle = manager.create(request).await.unwrap();

        let usage = manager.resource_usage().await;
        assert_eq!(usage.active_count, 1);
        assert_eq!(usage.total_memory_mb, 256);
        assert_eq!(usage.total_disk_mb, 64);

        manager.cleanup(handle.id(), false).await.unwrap();
        let usage = manager.resource_usage().await;
        assert_eq!(usage.active_count, 0);
    }

    #[tokio::test]
    async fn emergency_cleanup_reaps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), 8, false);
        for _ in 0..3 {
            manager.create(EphemeralRequest::default()).await.unwrap();
        }
        assert_eq!(manager.list().await.len(), 3);
        manager.emergency_cleanup_all().await;
        assert!(manager.list().await.is_empty());
    }
}
