//! Lifecycle state machine for long-lived environments.
//!
//! The manager owns the metadata store and the on-disk environment
//! directories; backends and the package cache are reached through the
//! injected [`PackageService`]. Entities are value records between
//! operations: each operation loads, mutates and persists.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use jiff::Timestamp;
use serde::Serialize;
use tracing::{debug, info, warn};

use gestvenv_backend::{BackendKind, BackendPreference, InstallOptions};
use gestvenv_manifest::{parse_manifest, DependencySet, Requirement};
use gestvenv_platform::OsFamily;

use crate::config::GestvenvConfig;
use crate::metadata::MetadataStore;
use crate::models::{
    fold_name, EnvironmentInfo, EnvironmentOutcome, HealthStatus, PythonVersion,
};
use crate::packages::PackageService;
use crate::validate;
use crate::CoreError;

/// Packages a backend seeds into every venv; never treated as drift.
const SEED_PACKAGES: &[&str] = &["pip", "setuptools", "wheel"];

#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub name: String,
    pub python_version: Option<String>,
    pub backend: Option<BackendPreference>,
    pub initial_packages: Vec<Requirement>,
    pub custom_path: Option<PathBuf>,
}

impl CreateRequest {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Filters for `list`; every returned record satisfies all of them.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub active_only: bool,
    pub backend: Option<BackendKind>,
    pub health: Option<HealthStatus>,
    pub python_version: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Groups to include beyond main.
    pub groups: Vec<String>,
    /// Uninstall packages the manifest no longer lists.
    pub clean: bool,
    /// Upgrade packages the manifest still lists.
    pub upgrade: bool,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub packages_added: Vec<String>,
    pub packages_removed: Vec<String>,
    pub packages_updated: Vec<String>,
    pub warnings: Vec<String>,
    pub execution_time: Duration,
}

#[derive(Debug)]
pub struct ActivationOutcome {
    pub environment: EnvironmentInfo,
    /// Shell command the caller should evaluate.
    pub command: String,
    /// Variables to set, `PATH` already prefixed with the scripts dir.
    pub env_vars: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ExportFormat {
    Json,
    Requirements,
    Pyproject,
}

#[derive(Debug)]
pub struct ExportPayload {
    pub file_name: String,
    pub content: String,
}

pub struct EnvironmentManager {
    config: GestvenvConfig,
    store: MetadataStore,
    packages: PackageService,
}

impl EnvironmentManager {
    pub fn new(config: GestvenvConfig, packages: PackageService) -> Self {
        let store = MetadataStore::new(&config.environments_path);
        Self {
            config,
            store,
            packages,
        }
    }

    pub fn config(&self) -> &GestvenvConfig {
        &self.config
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn package_service(&self) -> &PackageService {
        &self.packages
    }

    /// Create a new environment: validate, select a backend, build the
    /// venv, install initial packages (failures become warnings), persist.
    /// A fatal failure rolls back any partially created directory.
    pub async fn create(&self, request: CreateRequest) -> Result<EnvironmentOutcome, CoreError> {
        let started = Instant::now();
        validate::env_name(&request.name)?;
        let python = validate::python_version(
            request
                .python_version
                .as_deref()
                .unwrap_or(&self.config.default_python_version),
        )?;
        if self.store.exists(&request.name) {
            return Err(CoreError::AlreadyExists(request.name));
        }

        let preference = request
            .backend
            .unwrap_or_else(|| self.config.backend_preference());
        let backend = self.packages.registry().select(preference)?;

        let default_root = self.store.env_root(&request.name);
        let path = request.custom_path.clone().unwrap_or_else(|| default_root.clone());
        if path.exists() {
            return Err(CoreError::AlreadyExists(request.name));
        }
        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent)?;
        }

        info!(
            "creating environment `{}` (python {python}, backend {})",
            request.name,
            backend.kind()
        );
        if let Err(err) = backend.create_venv(&path, &python.to_string()).await {
            rollback_partial(&path);
            return Err(err.into());
        }
        // Custom-path environments stay visible to the directory registry
        // through a symlink.
        #[cfg(unix)]
        if path != default_root {
            if let Err(err) = std::os::unix::fs::symlink(&path, &default_root) {
                rollback_partial(&path);
                return Err(err.into());
            }
        }

        let now = Timestamp::now();
        let mut environment = EnvironmentInfo {
            name: request.name.clone(),
            path,
            python_version: python.to_string(),
            backend: backend.kind(),
            health: HealthStatus::Healthy,
            created_at: now,
            last_modified: now,
            last_used: now,
            is_active: false,
            manifest_path: None,
            packages: Vec::new(),
            dependency_groups: IndexMap::new(),
            lock_file: None,
        };

        let mut warnings = Vec::new();
        if !request.initial_packages.is_empty() {
            match self
                .packages
                .install(
                    &mut environment,
                    &request.initial_packages,
                    &InstallOptions::default(),
                )
                .await
            {
                Ok(report) => {
                    for (package, reason) in &report.failed {
                        warnings.push(format!("could not install {package}: {reason}"));
                    }
                }
                Err(err) => {
                    rollback_partial(&environment.path);
                    let link = self.store.env_root(&environment.name);
                    if link.is_symlink() {
                        let _ = fs_err::remove_file(&link);
                    }
                    return Err(err);
                }
            }
        } else {
            let backend = self.packages.registry().get(environment.backend)?;
            self.packages.refresh(&mut environment, backend.as_ref()).await?;
        }

        self.store.save(&environment)?;
        Ok(EnvironmentOutcome {
            message: format!("environment `{}` created", environment.name),
            environment,
            warnings,
            execution_time: started.elapsed(),
        })
    }

    /// Parse a manifest, create the environment, then install its main
    /// requirements plus `groups`.
    pub async fn create_from_manifest(
        &self,
        manifest: &Path,
        mut request: CreateRequest,
        groups: &[String],
    ) -> Result<EnvironmentOutcome, CoreError> {
        let started = Instant::now();
        let set = parse_manifest(manifest)?;
        if request.name.is_empty() {
            request.name = set
                .project
                .clone()
                .ok_or_else(|| CoreError::Validation("manifest declares no project name; pass one".to_string()))?;
        }
        if request.python_version.is_none() {
            request.python_version = python_from_constraint(&set);
        }
        request.initial_packages = set.with_groups(groups.iter().map(String::as_str));

        let mut outcome = self.create(request).await?;
        outcome.warnings.extend(
            set.warnings
                .iter()
                .map(|warning| format!("line {}: {} ({})", warning.line, warning.text, warning.reason)),
        );
        if !set.conda_only.is_empty() {
            outcome.warnings.push(format!(
                "skipped {} conda-only packages: {}",
                set.conda_only.len(),
                set.conda_only.join(", ")
            ));
        }

        let mut environment = outcome.environment;
        environment.manifest_path = Some(manifest.to_path_buf());
        for (group, requirements) in &set.optional {
            environment.dependency_groups.insert(
                group.clone(),
                requirements.iter().map(ToString::to_string).collect(),
            );
        }
        self.store.save(&environment)?;
        outcome.environment = environment;
        outcome.execution_time = started.elapsed();
        Ok(outcome)
    }

    /// Mark `name` active (deactivating everything else first) and return
    /// the activation command and variables.
    pub async fn activate(&self, name: &str) -> Result<ActivationOutcome, CoreError> {
        let mut environment = self
            .store
            .load(name)
            .ok_or_else(|| CoreError::NotFound(name.to_string()))?;
        self.deactivate()?;

        environment.is_active = true;
        environment.last_used = Timestamp::now();
        environment.touch();
        self.store.save(&environment)?;

        let layout = environment.layout();
        let scripts = layout.scripts_dir();
        let activate = layout.activate();
        let command = match OsFamily::current() {
            OsFamily::Unix => format!("source {}", activate.display()),
            OsFamily::Windows => activate.display().to_string(),
        };
        let path_value = std::env::var("PATH").unwrap_or_default();
        let env_vars = vec![
            (
                "VIRTUAL_ENV".to_string(),
                layout.root().display().to_string(),
            ),
            (
                "VIRTUAL_ENV_PROMPT".to_string(),
                format!("({})", environment.name),
            ),
            (
                "PATH".to_string(),
                format!("{}:{path_value}", scripts.display()),
            ),
        ];
        Ok(ActivationOutcome {
            environment,
            command,
            env_vars,
        })
    }

    /// Clear the active flag everywhere. Returns how many records changed.
    pub fn deactivate(&self) -> Result<usize, CoreError> {
        let mut cleared = 0;
        for name in self.store.list_names()? {
            if let Some(mut environment) = self.store.load(&name) {
                if environment.is_active {
                    environment.is_active = false;
                    self.store.save(&environment)?;
                    cleared += 1;
                }
            }
        }
        Ok(cleared)
    }

    /// Delete the environment directory and its metadata. Repeat calls
    /// return `NotFound`; active environments require `force`.
    pub async fn delete(&self, name: &str, force: bool) -> Result<(), CoreError> {
        let environment = self
            .store
            .load(name)
            .ok_or_else(|| CoreError::NotFound(name.to_string()))?;
        if environment.is_active && !force {
            return Err(CoreError::ActiveEnvironment {
                name: name.to_string(),
            });
        }
        validate::safe_to_delete(&environment.path)?;

        // Keep a copy of the record so a deletion can be audited.
        let backups = self.store.environments_path().join(".backups");
        if fs_err::create_dir_all(&backups).is_ok() {
            let backup = backups.join(format!("{name}.json"));
            if let Ok(json) = serde_json::to_vec_pretty(&environment) {
                let _ = fs_err::write(&backup, json);
            }
        }

        let link = self.store.env_root(name);
        if link.is_symlink() {
            let target = fs_err::read_link(&link)?;
            fs_err::remove_dir_all(&target)?;
            fs_err::remove_file(&link)?;
        } else {
            fs_err::remove_dir_all(&environment.path)?;
        }
        info!("environment `{name}` deleted");
        Ok(())
    }

    /// Enumerate, reconstructing any record lacking metadata, then filter
    /// and sort by `last_used` descending.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<EnvironmentInfo>, CoreError> {
        let mut environments = Vec::new();
        for name in self.store.list_names()? {
            let Some(environment) = self.store.load(&name) else {
                continue;
            };
            if filter.active_only && !environment.is_active {
                continue;
            }
            if filter.backend.is_some_and(|kind| kind != environment.backend) {
                continue;
            }
            if filter.health.is_some_and(|health| health != environment.health) {
                continue;
            }
            if let Some(python) = &filter.python_version {
                if &environment.python_version != python {
                    continue;
                }
            }
            environments.push(environment);
        }
        environments.sort_by(|left, right| right.last_used.cmp(&left.last_used));
        Ok(environments)
    }

    /// Install extra packages into an existing environment.
    pub async fn install(
        &self,
        name: &str,
        specs: &[Requirement],
        options: &InstallOptions,
    ) -> Result<EnvironmentOutcome, CoreError> {
        let started = Instant::now();
        let mut environment = self
            .store
            .load(name)
            .ok_or_else(|| CoreError::NotFound(name.to_string()))?;
        let report = self.packages.install(&mut environment, specs, options).await?;
        environment.last_used = Timestamp::now();
        self.store.save(&environment)?;
        let warnings = report
            .failed
            .iter()
            .map(|(package, reason)| format!("could not install {package}: {reason}"))
            .collect();
        Ok(EnvironmentOutcome {
            message: format!(
                "installed {} packages ({} from cache)",
                report.installed.len(),
                report.from_cache.len()
            ),
            environment,
            warnings,
            execution_time: started.elapsed(),
        })
    }

    /// Uninstall one package.
    pub async fn uninstall(&self, name: &str, package: &str) -> Result<(), CoreError> {
        let mut environment = self
            .store
            .load(name)
            .ok_or_else(|| CoreError::NotFound(name.to_string()))?;
        let backend = self.packages.registry().get(environment.backend)?;
        backend.uninstall(&environment.layout(), package).await?;
        self.packages.refresh(&mut environment, backend.as_ref()).await?;
        self.store.save(&environment)?;
        Ok(())
    }

    /// Upgrade the named packages, or everything installed when `None`.
    pub async fn update(
        &self,
        name: &str,
        packages: Option<&[String]>,
    ) -> Result<EnvironmentOutcome, CoreError> {
        let environment = self
            .store
            .load(name)
            .ok_or_else(|| CoreError::NotFound(name.to_string()))?;
        let targets: Vec<Requirement> = match packages {
            Some(names) => names
                .iter()
                .map(|package| Requirement::unconstrained(package.clone()))
                .collect(),
            None => environment
                .packages
                .iter()
                .filter(|package| !is_seed(&package.name))
                .map(|package| Requirement::unconstrained(package.name.clone()))
                .collect(),
        };
        let options = InstallOptions {
            upgrade: true,
            ..InstallOptions::default()
        };
        self.install(name, &targets, &options).await
    }

    /// Produce a lock file through the environment's backend, when it has
    /// that capability. The path is recorded on the environment.
    pub async fn create_lock(&self, name: &str) -> Result<Option<PathBuf>, CoreError> {
        let mut environment = self
            .store
            .load(name)
            .ok_or_else(|| CoreError::NotFound(name.to_string()))?;
        let manifest = environment
            .manifest_path
            .clone()
            .ok_or_else(|| CoreError::NoManifest {
                name: name.to_string(),
            })?;
        let manifest_dir = manifest.parent().unwrap_or_else(|| Path::new("."));
        let backend = self.packages.registry().get(environment.backend)?;
        let lock_file = backend.create_lock(manifest_dir).await?;
        environment.lock_file = lock_file.clone();
        environment.touch();
        self.store.save(&environment)?;
        Ok(lock_file)
    }

    /// Reconcile installed packages against the environment's manifest.
    pub async fn sync(&self, name: &str, options: &SyncOptions) -> Result<SyncReport, CoreError> {
        let started = Instant::now();
        let mut environment = self
            .store
            .load(name)
            .ok_or_else(|| CoreError::NotFound(name.to_string()))?;
        let manifest = environment
            .manifest_path
            .clone()
            .ok_or_else(|| CoreError::NoManifest {
                name: name.to_string(),
            })?;
        let set = parse_manifest(&manifest)?;
        let desired = set.with_groups(options.groups.iter().map(String::as_str));

        let mut report = SyncReport::default();
        report.warnings.extend(
            set.warnings
                .iter()
                .map(|warning| format!("line {}: {}", warning.line, warning.reason)),
        );
        if !set.conda_only.is_empty() {
            report
                .warnings
                .push(format!("skipped conda-only packages: {}", set.conda_only.join(", ")));
        }

        let installed: Vec<String> = environment
            .packages
            .iter()
            .map(|package| fold_name(&package.name))
            .collect();
        let desired_names: Vec<String> =
            desired.iter().map(|spec| spec.normalized_name()).collect();

        // Install what the manifest wants and the env lacks.
        let missing: Vec<Requirement> = desired
            .iter()
            .filter(|spec| !installed.contains(&spec.normalized_name()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let install_report = self
                .packages
                .install(&mut environment, &missing, &InstallOptions::default())
                .await?;
            report.packages_added.extend(install_report.installed);
            for (package, reason) in install_report.failed {
                report
                    .warnings
                    .push(format!("could not install {package}: {reason}"));
            }
        }

        // Remove what the env has and the manifest dropped.
        if options.clean {
            let backend = self.packages.registry().get(environment.backend)?;
            let extras: Vec<String> = environment
                .packages
                .iter()
                .filter(|package| {
                    let folded = fold_name(&package.name);
                    !desired_names.contains(&folded) && !is_seed(&package.name)
                })
                .map(|package| package.name.clone())
                .collect();
            for package in extras {
                match backend.uninstall(&environment.layout(), &package).await {
                    Ok(()) => report.packages_removed.push(package),
                    Err(err) => report
                        .warnings
                        .push(format!("could not uninstall {package}: {err}")),
                }
            }
        }

        // Upgrade what both sides still agree on.
        if options.upgrade {
            let still_desired: Vec<Requirement> = desired
                .iter()
                .filter(|spec| installed.contains(&spec.normalized_name()))
                .cloned()
                .collect();
            if !still_desired.is_empty() {
                let upgrade_options = InstallOptions {
                    upgrade: true,
                    ..InstallOptions::default()
                };
                let upgrade_report = self
                    .packages
                    .install(&mut environment, &still_desired, &upgrade_options)
                    .await?;
                report.packages_updated.extend(upgrade_report.installed);
            }
        }

        let backend = self.packages.registry().get(environment.backend)?;
        self.packages.refresh(&mut environment, backend.as_ref()).await?;
        environment.last_used = Timestamp::now();
        self.store.save(&environment)?;
        report.execution_time = started.elapsed();
        Ok(report)
    }

    /// Create `target` with the same python and backend as `source`, then
    /// replay the source's package pins and copy its manifest reference.
    pub async fn clone_environment(
        &self,
        source: &str,
        target: &str,
    ) -> Result<EnvironmentOutcome, CoreError> {
        let started = Instant::now();
        let source_env = self
            .store
            .load(source)
            .ok_or_else(|| CoreError::NotFound(source.to_string()))?;

        let pins: Vec<Requirement> = source_env
            .packages
            .iter()
            .filter(|package| !is_seed(&package.name))
            .map(|package| match package.version.parse() {
                Ok(version) => Requirement::pinned(package.name.clone(), version),
                Err(_) => Requirement::unconstrained(package.name.clone()),
            })
            .collect();

        let request = CreateRequest {
            name: target.to_string(),
            python_version: Some(source_env.python_version.clone()),
            backend: Some(BackendPreference::Named(source_env.backend)),
            initial_packages: pins,
            custom_path: None,
        };
        let mut outcome = self.create(request).await?;

        let mut environment = outcome.environment;
        environment.manifest_path = source_env.manifest_path.clone();
        environment.dependency_groups = source_env.dependency_groups.clone();
        self.store.save(&environment)?;
        outcome.environment = environment;
        outcome.execution_time = started.elapsed();
        outcome.message = format!("environment `{source}` cloned to `{target}`");
        Ok(outcome)
    }

    /// Render an environment in one of the export formats.
    pub fn export(&self, name: &str, format: ExportFormat) -> Result<ExportPayload, CoreError> {
        let environment = self
            .store
            .load(name)
            .ok_or_else(|| CoreError::NotFound(name.to_string()))?;
        match format {
            ExportFormat::Json => Ok(ExportPayload {
                file_name: format!("{name}.json"),
                content: serde_json::to_string_pretty(&environment)?,
            }),
            ExportFormat::Requirements => {
                let mut lines: Vec<String> = environment
                    .packages
                    .iter()
                    .filter(|package| !is_seed(&package.name))
                    .map(|package| format!("{}=={}", package.name, package.version))
                    .collect();
                lines.sort();
                Ok(ExportPayload {
                    file_name: format!("{name}-requirements.txt"),
                    content: lines.join("\n") + "\n",
                })
            }
            ExportFormat::Pyproject => {
                let content = render_pyproject(&environment)?;
                Ok(ExportPayload {
                    file_name: "pyproject.toml".to_string(),
                    content,
                })
            }
        }
    }

    /// Recreate an environment from an exported file, detected by its
    /// extension and inner shape.
    pub async fn import(
        &self,
        path: &Path,
        name: Option<&str>,
    ) -> Result<EnvironmentOutcome, CoreError> {
        let extension = path
            .extension()
            .and_then(|extension| extension.to_str())
            .unwrap_or_default()
            .to_lowercase();
        let file_name = path
            .file_name()
            .and_then(|file_name| file_name.to_str())
            .unwrap_or_default();

        if extension == "json" {
            let record: EnvironmentInfo = serde_json::from_slice(&fs_err::read(path)?)
                .map_err(|err| CoreError::UnsupportedImport {
                    path: path.to_path_buf(),
                    reason: format!("not an environment export: {err}"),
                })?;
            let pins: Vec<Requirement> = record
                .packages
                .iter()
                .filter(|package| !is_seed(&package.name))
                .map(|package| match package.version.parse() {
                    Ok(version) => Requirement::pinned(package.name.clone(), version),
                    Err(_) => Requirement::unconstrained(package.name.clone()),
                })
                .collect();
            let request = CreateRequest {
                name: name.unwrap_or(&record.name).to_string(),
                python_version: Some(record.python_version.clone()),
                backend: Some(BackendPreference::Named(record.backend)),
                initial_packages: pins,
                custom_path: None,
            };
            let mut outcome = self.create(request).await?;
            let mut environment = outcome.environment;
            environment.dependency_groups = record.dependency_groups.clone();
            environment.manifest_path = record.manifest_path.clone();
            self.store.save(&environment)?;
            outcome.environment = environment;
            return Ok(outcome);
        }

        if matches!(extension.as_str(), "toml" | "txt" | "in" | "yml" | "yaml")
            || file_name == "Pipfile"
        {
            let request = CreateRequest {
                name: name.unwrap_or_default().to_string(),
                ..CreateRequest::default()
            };
            return self.create_from_manifest(path, request, &[]).await;
        }

        Err(CoreError::UnsupportedImport {
            path: path.to_path_buf(),
            reason: format!("unrecognized extension `{extension}`"),
        })
    }
}

fn is_seed(package: &str) -> bool {
    SEED_PACKAGES.contains(&fold_name(package).as_str())
}

fn rollback_partial(path: &Path) {
    if path.exists() {
        debug!("rolling back partially created environment at `{}`", path.display());
        if let Err(err) = fs_err::remove_dir_all(path) {
            warn!("rollback of `{}` failed: {err}", path.display());
        }
    }
}

/// Choose a concrete `X.Y` from a manifest's python constraint when it
/// names one (`>=3.11`, `3.11`, `^3.10`).
fn python_from_constraint(set: &DependencySet) -> Option<String> {
    let constraint = set.python_version_constraint.as_deref()?;
    let digits: String = constraint
        .chars()
        .skip_while(|ch| !ch.is_ascii_digit())
        .take_while(|ch| ch.is_ascii_digit() || *ch == '.')
        .collect();
    let version: PythonVersion = digits.parse().ok()?;
    version.in_supported_range().then(|| version.to_string())
}

fn render_pyproject(environment: &EnvironmentInfo) -> Result<String, CoreError> {
    #[derive(Serialize)]
    struct Project<'a> {
        name: &'a str,
        #[serde(rename = "requires-python")]
        requires_python: String,
        dependencies: Vec<String>,
        #[serde(
            rename = "optional-dependencies",
            skip_serializing_if = "IndexMap::is_empty"
        )]
        optional_dependencies: &'a IndexMap<String, Vec<String>>,
    }
    #[derive(Serialize)]
    struct PyProject<'a> {
        project: Project<'a>,
    }

    let dependencies = environment
        .packages
        .iter()
        .filter(|package| !is_seed(&package.name))
        .map(|package| format!("{}>={}", package.name, package.version))
        .collect();
    let rendered = toml::to_string_pretty(&PyProject {
        project: Project {
            name: &environment.name,
            requires_python: format!(">={}", environment.python_version),
            dependencies,
            optional_dependencies: &environment.dependency_groups,
        },
    })
    .map_err(|err| CoreError::Validation(format!("could not render pyproject: {err}")))?;
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{manager_with_stub, StubBackend};
    use gestvenv_manifest::Requirement;

    fn req(text: &str) -> Requirement {
        text.parse().unwrap()
    }

    #[tokio::test]
    async fn create_then_delete_leaves_nothing() {
        let (dir, manager) = manager_with_stub(StubBackend::default());
        let outcome = manager.create(CreateRequest::named("svc")).await.unwrap();
        assert!(outcome.environment.path.is_dir());
        assert!(outcome.environment.path.join("pyvenv.cfg").is_file());

        manager.delete("svc", false).await.unwrap();
        assert!(!outcome.environment.path.exists());
        assert!(manager.store().load("svc").is_none());
        drop(dir);
    }

    #[tokio::test]
    async fn create_twice_is_already_exists() {
        let (_dir, manager) = manager_with_stub(StubBackend::default());
        manager.create(CreateRequest::named("svc")).await.unwrap();
        let err = manager.create(CreateRequest::named("svc")).await.unwrap_err();
        assert!(matches!(err, CoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn delete_twice_is_not_found() {
        let (_dir, manager) = manager_with_stub(StubBackend::default());
        manager.create(CreateRequest::named("svc")).await.unwrap();
        manager.delete("svc", false).await.unwrap();
        let err = manager.delete("svc", false).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn invalid_names_are_rejected_before_any_work() {
        let (_dir, manager) = manager_with_stub(StubBackend::default());
        for name in ["a", "-bad", "bad-", "c0n trol"] {
            let err = manager
                .create(CreateRequest::named(name))
                .await
                .unwrap_err();
            assert!(matches!(err, CoreError::Validation(_)), "{name}");
        }
    }

    #[tokio::test]
    async fn failed_venv_creation_rolls_back() {
        let backend = StubBackend {
            fail_create: true,
            ..StubBackend::default()
        };
        let (_dir, manager) = manager_with_stub(backend);
        let err = manager.create(CreateRequest::named("svc")).await.unwrap_err();
        assert!(matches!(err, CoreError::Backend(_)));
        assert!(!manager.store().exists("svc"));
    }

    #[tokio::test]
    async fn create_installs_initial_packages() {
        let (_dir, manager) = manager_with_stub(StubBackend::default());
        let request = CreateRequest {
            initial_packages: vec![req("requests==2.31.0"), req("rich")],
            ..CreateRequest::named("svc")
        };
        let outcome = manager.create(request).await.unwrap();
        assert!(outcome.environment.package("requests").is_some());
        assert!(outcome.environment.package("rich").is_some());
    }

    #[tokio::test]
    async fn activation_is_exclusive() {
        let (_dir, manager) = manager_with_stub(StubBackend::default());
        manager.create(CreateRequest::named("one")).await.unwrap();
        manager.create(CreateRequest::named("two")).await.unwrap();

        manager.activate("one").await.unwrap();
        let activation = manager.activate("two").await.unwrap();
        assert!(activation.environment.is_active);
        assert!(activation
            .env_vars
            .iter()
            .any(|(key, value)| key == "VIRTUAL_ENV" && value.contains("two")));

        let active: Vec<_> = manager
            .list(&ListFilter {
                active_only: true,
                ..ListFilter::default()
            })
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "two");
    }

    #[tokio::test]
    async fn deleting_active_environment_requires_force() {
        let (_dir, manager) = manager_with_stub(StubBackend::default());
        manager.create(CreateRequest::named("svc")).await.unwrap();
        manager.activate("svc").await.unwrap();
        let err = manager.delete("svc", false).await.unwrap_err();
        assert!(matches!(err, CoreError::ActiveEnvironment { .. }));
        manager.delete("svc", true).await.unwrap();
    }

    #[tokio::test]
    async fn list_filters_apply() {
        let (_dir, manager) = manager_with_stub(StubBackend::default());
        manager.create(CreateRequest::named("alpha")).await.unwrap();
        manager.create(CreateRequest::named("beta")).await.unwrap();

        let all = manager.list(&ListFilter::default()).unwrap();
        assert_eq!(all.len(), 2);

        let by_python = manager
            .list(&ListFilter {
                python_version: Some("3.11".to_string()),
                ..ListFilter::default()
            })
            .unwrap();
        assert_eq!(by_python.len(), 2);

        let none = manager
            .list(&ListFilter {
                python_version: Some("3.12".to_string()),
                ..ListFilter::default()
            })
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn clone_replays_packages() {
        let (_dir, manager) = manager_with_stub(StubBackend::default());
        let request = CreateRequest {
            initial_packages: vec![req("requests==2.31.0")],
            ..CreateRequest::named("src")
        };
        manager.create(request).await.unwrap();

        let outcome = manager.clone_environment("src", "dst").await.unwrap();
        assert_eq!(outcome.environment.name, "dst");
        assert!(outcome.environment.package("requests").is_some());
        // Source remains.
        assert!(manager.store().load("src").is_some());
    }

    #[tokio::test]
    async fn export_json_round_trips_through_import() {
        let (dir, manager) = manager_with_stub(StubBackend::default());
        let request = CreateRequest {
            initial_packages: vec![req("requests==2.31.0")],
            ..CreateRequest::named("svc")
        };
        manager.create(request).await.unwrap();

        let payload = manager.export("svc", ExportFormat::Json).unwrap();
        let export_path = dir.path().join(payload.file_name);
        fs_err::write(&export_path, payload.content).unwrap();

        let imported = manager.import(&export_path, Some("copy")).await.unwrap();
        assert_eq!(imported.environment.name, "copy");
        assert_eq!(imported.environment.python_version, "3.11");
        assert!(imported.environment.package("requests").is_some());
        let version = &imported.environment.package("requests").unwrap().version;
        assert_eq!(version, "2.31.0");
    }

    #[tokio::test]
    async fn export_requirements_lists_pins() {
        let (_dir, manager) = manager_with_stub(StubBackend::default());
        let request = CreateRequest {
            initial_packages: vec![req("requests==2.31.0"), req("rich==13.7.1")],
            ..CreateRequest::named("svc")
        };
        manager.create(request).await.unwrap();
        let payload = manager.export("svc", ExportFormat::Requirements).unwrap();
        assert!(payload.content.contains("requests==2.31.0"));
        assert!(payload.content.contains("rich==13.7.1"));
    }

    #[tokio::test]
    async fn export_pyproject_renders_a_project_table() {
        let (_dir, manager) = manager_with_stub(StubBackend::default());
        let request = CreateRequest {
            initial_packages: vec![req("requests==2.31.0")],
            ..CreateRequest::named("svc")
        };
        manager.create(request).await.unwrap();
        let payload = manager.export("svc", ExportFormat::Pyproject).unwrap();
        assert_eq!(payload.file_name, "pyproject.toml");
        assert!(payload.content.contains("[project]"));
        assert!(payload.content.contains("name = \"svc\""));
        assert!(payload.content.contains("requests>=2.31.0"));
    }

    #[tokio::test]
    async fn sync_reconciles_against_manifest() {
        let (dir, manager) = manager_with_stub(StubBackend::default());
        let manifest = dir.path().join("requirements.txt");
        fs_err::write(&manifest, "requests==2.31.0\nclick==8.1.7\n").unwrap();

        let outcome = manager
            .create_from_manifest(&manifest, CreateRequest::named("svc"), &[])
            .await
            .unwrap();
        assert!(outcome.environment.package("click").is_some());

        // The manifest moves on: click is dropped, rich appears.
        fs_err::write(&manifest, "requests==2.31.0\nrich==13.7.1\n").unwrap();
        let report = manager
            .sync(
                "svc",
                &SyncOptions {
                    clean: true,
                    ..SyncOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(report.packages_added.iter().any(|name| name == "rich"));
        assert!(report.packages_removed.iter().any(|name| name == "click"));

        let environment = manager.store().load("svc").unwrap();
        assert!(environment.package("rich").is_some());
        assert!(environment.package("click").is_none());
        assert!(environment.package("requests").is_some());
    }

    #[tokio::test]
    async fn sync_without_manifest_fails() {
        let (_dir, manager) = manager_with_stub(StubBackend::default());
        manager.create(CreateRequest::named("svc")).await.unwrap();
        let err = manager.sync("svc", &SyncOptions::default()).await.unwrap_err();
        assert!(matches!(err, CoreError::NoManifest { .. }));
    }

    #[test]
    fn python_constraint_extraction() {
        let mut set = DependencySet::default();
        set.python_version_constraint = Some(">=3.11".to_string());
        assert_eq!(python_from_constraint(&set), Some("3.11".to_string()));
        set.python_version_constraint = Some("^3.10".to_string());
        assert_eq!(python_from_constraint(&set), Some("3.10".to_string()));
        set.python_version_constraint = Some(">=2.7".to_string());
        assert_eq!(python_from_constraint(&set), None);
        set.python_version_constraint = None;
        assert_eq!(python_from_constraint(&set), None);
    }
}
