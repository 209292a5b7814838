//! Install orchestration: cache lookup, backend install, metadata refresh.

use std::path::PathBuf;
use std::sync::Arc;

use jiff::Timestamp;
use tracing::{debug, warn};
use walkdir::WalkDir;

use gestvenv_backend::{Backend, BackendRegistry, InstallOptions};
use gestvenv_cache::PackageCache;
use gestvenv_manifest::{Requirement, RequirementSource, Version, VersionOperator};
use gestvenv_platform::PlatformTag;

use crate::models::{fold_name, EnvironmentInfo, InstallMode, PackageInfo};
use crate::CoreError;

/// What happened to each requested spec.
#[derive(Debug, Default)]
pub struct InstallReport {
    pub installed: Vec<String>,
    pub from_cache: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub warnings: Vec<String>,
}

impl InstallReport {
    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Orchestrates installs for one environment: cache first when allowed,
/// backend otherwise, then a refresh from the backend's authoritative
/// listing.
pub struct PackageService {
    registry: Arc<BackendRegistry>,
    cache: Arc<PackageCache>,
    /// Query the cache even when the network would be allowed.
    prefer_cache: bool,
}

impl PackageService {
    pub fn new(registry: Arc<BackendRegistry>, cache: Arc<PackageCache>) -> Self {
        Self {
            registry,
            cache,
            prefer_cache: true,
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<PackageCache> {
        &self.cache
    }

    /// Install `specs` into `env` and refresh its package list.
    ///
    /// Offline misses fail the operation; per-spec backend failures are
    /// collected in the report instead.
    pub async fn install(
        &self,
        env: &mut EnvironmentInfo,
        specs: &[Requirement],
        options: &InstallOptions,
    ) -> Result<InstallReport, CoreError> {
        let backend = self.registry.get(env.backend)?;
        let layout = env.layout();
        let offline = self.cache.offline_mode();
        let mut report = InstallReport::default();
        let mut remaining: Vec<Requirement> = Vec::new();

        for spec in specs {
            let cacheable = matches!(spec.source, RequirementSource::Index);
            if cacheable && (offline || self.prefer_cache) && self.cache.enabled() {
                let pinned = pinned_version(spec);
                match self
                    .cache
                    .install_from_cache(&layout, backend.as_ref(), &spec.name, pinned.as_ref())
                    .await?
                {
                    Some(done) => {
                        debug!("installed {} {} from cache", done.package, done.version);
                        report.from_cache.push(spec.name.clone());
                        report.installed.push(spec.name.clone());
                        continue;
                    }
                    None => {}
                }
            }
            if offline && !matches!(spec.source, RequirementSource::EditablePath { .. }) {
                // Everything else would need the network.
                return Err(CoreError::OfflineMiss {
                    package: spec.name.clone(),
                });
            }
            remaining.push(spec.clone());
        }

        if !remaining.is_empty() {
            let outcome = backend.install(&layout, &remaining, options).await?;
            report.installed.extend(outcome.installed);
            report.failed.extend(outcome.failed);
        }

        self.refresh(env, backend.as_ref()).await?;
        self.annotate_sources(env, &report, options);

        // Promote freshly downloaded artifacts into the cache for reuse;
        // failure to cache never fails the install.
        for name in &report.installed {
            if report.from_cache.iter().any(|cached| cached == name) {
                continue;
            }
            if let Some(package) = env.package(name) {
                let version = package.version.clone();
                if let Err(err) = self.promote_to_cache(env, name, &version).await {
                    debug!("could not promote {name} {version} into the cache: {err}");
                }
            }
        }

        Ok(report)
    }

    /// Replace the record's package list with the backend's listing,
    /// preserving install modes and sources for packages we already knew.
    pub async fn refresh(
        &self,
        env: &mut EnvironmentInfo,
        backend: &dyn Backend,
    ) -> Result<(), CoreError> {
        let listed = backend.list(&env.layout()).await?;
        let previous = std::mem::take(&mut env.packages);
        env.packages = listed
            .into_iter()
            .map(|package| {
                let known = previous
                    .iter()
                    .find(|existing| fold_name(&existing.name) == fold_name(&package.name));
                PackageInfo {
                    name: package.name,
                    version: package.version.to_string(),
                    source: known.map(|k| k.source.clone()).unwrap_or_else(|| "index".to_string()),
                    install_mode: known.map(|k| k.install_mode).unwrap_or_default(),
                    installed_at: known.map(|k| k.installed_at).unwrap_or_else(Timestamp::now),
                }
            })
            .collect();
        env.touch();
        Ok(())
    }

    fn annotate_sources(
        &self,
        env: &mut EnvironmentInfo,
        report: &InstallReport,
        options: &InstallOptions,
    ) {
        for package in &mut env.packages {
            let folded = fold_name(&package.name);
            if report
                .from_cache
                .iter()
                .any(|name| fold_name(name) == folded)
            {
                package.source = "cache".to_string();
            }
            if options.editable
                && report
                    .installed
                    .iter()
                    .any(|name| fold_name(name) == folded)
            {
                package.install_mode = InstallMode::Editable;
            }
        }
    }

    /// Best-effort: find the wheel the backend just downloaded in its own
    /// download cache and copy it into the package cache.
    async fn promote_to_cache(
        &self,
        env: &EnvironmentInfo,
        package: &str,
        version: &str,
    ) -> Result<bool, CoreError> {
        if !self.cache.enabled() {
            return Ok(false);
        }
        let Ok(parsed) = version.parse::<Version>() else {
            return Ok(false);
        };
        let Some(wheel) = find_downloaded_wheel(package, version) else {
            return Ok(false);
        };
        let bytes = fs_err::read(&wheel)?;
        self.cache
            .cache(
                package,
                &parsed,
                &PlatformTag::current(),
                &bytes,
                env.backend,
            )
            .await?;
        debug!("promoted {package} {version} into the cache from `{}`", wheel.display());
        Ok(true)
    }
}

/// The version a spec pins exactly, when it does.
fn pinned_version(spec: &Requirement) -> Option<Version> {
    match spec.version_spec.0.as_slice() {
        [only] if only.operator == VersionOperator::Equal && !only.wildcard => {
            Some(only.version.clone())
        }
        _ => None,
    }
}

/// Scan the host's pip/uv wheel caches for `{package}-{version}-*.whl`.
fn find_downloaded_wheel(package: &str, version: &str) -> Option<PathBuf> {
    let folded = fold_name(package).replace('-', "_");
    let prefix = format!("{folded}-{version}-");
    let roots = [
        dirs::cache_dir().map(|dir| dir.join("pip").join("wheels")),
        dirs::cache_dir().map(|dir| dir.join("uv")),
    ];
    for root in roots.into_iter().flatten() {
        if !root.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&root)
            .max_depth(6)
            .into_iter()
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if name.to_lowercase().starts_with(&prefix) && name.ends_with(".whl") {
                return Some(entry.into_path());
            }
        }
    }
    warn!("no downloaded wheel found for {package} {version}");
    None
}
