//! GestVenv: isolated Python runtime environments on a single host.
//!
//! This crate wires the subsystem crates into one typed service
//! container: configuration, backend registry, package cache, the
//! long-lived environment manager and the ephemeral runtime. Services
//! are constructed once at startup and injected down; nothing reaches
//! for globals.

use std::sync::Arc;

use tracing::warn;

pub use gestvenv_backend::{
    Backend, BackendDescriptor, BackendKind, BackendPreference, BackendRegistry,
};
pub use gestvenv_cache::{CacheConfig, PackageCache};
pub use gestvenv_core::{
    CoreError, CreateRequest, EnvironmentInfo, EnvironmentManager, ExportFormat, GestvenvConfig,
    HealthStatus, ListFilter, MetadataStore, PackageService, SyncOptions,
};
pub use gestvenv_ephemeral::{
    EphemeralConfig, EphemeralError, EphemeralManager, EphemeralRequest, IsolationLevel,
    ResourceLimits, StorageBackend,
};
pub use gestvenv_manifest::{DependencySet, Requirement};
pub use gestvenv_platform::{PlatformTag, VenvLayout};

/// The assembled application container.
pub struct GestVenv {
    config: GestvenvConfig,
    registry: Arc<BackendRegistry>,
    cache: Arc<PackageCache>,
    environments: EnvironmentManager,
    ephemeral: EphemeralManager,
}

impl GestVenv {
    /// Configuration from defaults plus `GESTVENV_*` overrides, backends
    /// probed from the host.
    pub async fn init() -> Result<Self, CoreError> {
        let config = GestvenvConfig::from_env()?;
        let registry = Arc::new(BackendRegistry::probe().await);
        Self::assemble(config, registry).await
    }

    /// Explicit configuration, backends probed from the host.
    pub async fn with_config(config: GestvenvConfig) -> Result<Self, CoreError> {
        let config = config.validated()?;
        let registry = Arc::new(BackendRegistry::probe().await);
        Self::assemble(config, registry).await
    }

    /// Explicit configuration and registry; the seam embedders and tests
    /// inject stub backends through.
    pub async fn assemble(
        config: GestvenvConfig,
        registry: Arc<BackendRegistry>,
    ) -> Result<Self, CoreError> {
        let cache = Arc::new(PackageCache::open(
            &config.cache.path,
            CacheConfig {
                enabled: config.cache.enabled,
                max_size_mb: config.cache.max_size_mb,
                compression: config.cache.compression,
                offline_mode: config.cache.offline_mode,
            },
        )?);
        let packages = PackageService::new(registry.clone(), cache.clone());
        let environments = EnvironmentManager::new(config.clone(), packages);
        let ephemeral = EphemeralManager::new(
            ephemeral_config(&config),
            registry.clone(),
        )
        .await
        .map_err(|err| CoreError::Validation(format!("ephemeral runtime: {err}")))?;
        Ok(Self {
            config,
            registry,
            cache,
            environments,
            ephemeral,
        })
    }

    pub fn config(&self) -> &GestvenvConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<PackageCache> {
        &self.cache
    }

    pub fn environments(&self) -> &EnvironmentManager {
        &self.environments
    }

    pub fn ephemeral(&self) -> &EphemeralManager {
        &self.ephemeral
    }

    /// Start background services (the ephemeral reaper and monitor).
    pub fn start(&self) {
        self.ephemeral.start();
    }

    /// Stop background services and reap every live ephemeral.
    pub async fn shutdown(&self) {
        self.ephemeral.shutdown().await;
    }
}

/// Map the plain-data settings onto the ephemeral runtime's config,
/// falling back to defaults on unparseable names.
fn ephemeral_config(config: &GestvenvConfig) -> EphemeralConfig {
    let settings = &config.ephemeral;
    let defaults = EphemeralConfig::default();
    let storage_backend = settings
        .storage_backend
        .parse()
        .unwrap_or_else(|err: String| {
            warn!("{err}, using tmpfs");
            StorageBackend::Tmpfs
        });
    let default_isolation = settings
        .default_isolation
        .parse()
        .unwrap_or_else(|err: String| {
            warn!("{err}, using process isolation");
            IsolationLevel::Process
        });
    EphemeralConfig {
        max_concurrent: settings.max_concurrent,
        max_total_memory_mb: settings.max_total_memory_mb,
        max_total_disk_mb: settings.max_total_disk_mb,
        storage_backend,
        base_storage_path: settings.base_storage_path.clone(),
        default_isolation,
        default_ttl: Some(settings.default_ttl),
        default_max_idle: settings.default_max_idle,
        cleanup_interval: std::time::Duration::from_secs(settings.cleanup_interval),
        force_cleanup_after: std::time::Duration::from_secs(settings.force_cleanup_after),
        monitoring_interval: std::time::Duration::from_secs(settings.monitoring_interval),
        enable_preallocation: settings.enable_preallocation,
        ..defaults
    }
}
