//! Diagnostic pipeline: independent checkers per environment, a report
//! with an overall health grade, and category-dispatched auto-fixes.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use gestvenv_backend::{BackendRegistry, CommandSpec};
use gestvenv_manifest::parse_manifest;

use crate::manager::EnvironmentManager;
use crate::models::{fold_name, EnvironmentInfo, HealthStatus};
use crate::CoreError;

/// Environments larger than this earn an oversize warning.
const OVERSIZE_THRESHOLD_BYTES: u64 = 2 * 1024 * 1024 * 1024;
/// Probe ceiling for interpreter and installer invocations.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueLevel {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Existence,
    Interpreter,
    Installer,
    Permissions,
    ManifestDrift,
    Oversize,
    BackendUpgrade,
    Metadata,
    Cache,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub level: IssueLevel,
    pub category: IssueCategory,
    pub description: String,
    pub auto_fixable: bool,
    #[serde(default)]
    pub hint: Option<String>,
}

#[derive(Debug)]
pub struct DiagnosticReport {
    /// `None` for the system-wide (cache) report.
    pub target: Option<String>,
    pub issues: Vec<Issue>,
    pub health: HealthStatus,
}

impl DiagnosticReport {
    fn from_issues(target: Option<String>, issues: Vec<Issue>) -> Self {
        let health = overall_health(&issues);
        Self {
            target,
            issues,
            health,
        }
    }
}

/// The health grade is a pure function of the worst issue present.
fn overall_health(issues: &[Issue]) -> HealthStatus {
    let worst = issues.iter().map(|issue| issue.level).max();
    match worst {
        Some(IssueLevel::Critical) => HealthStatus::Corrupted,
        Some(IssueLevel::Error) => HealthStatus::HasErrors,
        Some(IssueLevel::Warning) => HealthStatus::HasWarnings,
        Some(IssueLevel::Info) => {
            if issues
                .iter()
                .any(|issue| issue.category == IssueCategory::BackendUpgrade)
            {
                HealthStatus::NeedsUpdate
            } else {
                HealthStatus::Healthy
            }
        }
        None => HealthStatus::Healthy,
    }
}

struct CheckContext<'a> {
    registry: &'a BackendRegistry,
}

#[async_trait]
trait HealthCheck: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, environment: &EnvironmentInfo, context: &CheckContext<'_>) -> Vec<Issue>;
}

fn issue(
    level: IssueLevel,
    category: IssueCategory,
    description: impl Into<String>,
    auto_fixable: bool,
) -> Issue {
    Issue {
        level,
        category,
        description: description.into(),
        auto_fixable,
        hint: None,
    }
}

struct RootExists;

#[async_trait]
impl HealthCheck for RootExists {
    fn name(&self) -> &'static str {
        "root-exists"
    }

    async fn run(&self, environment: &EnvironmentInfo, _: &CheckContext<'_>) -> Vec<Issue> {
        if environment.path.is_dir() {
            Vec::new()
        } else {
            vec![issue(
                IssueLevel::Critical,
                IssueCategory::Existence,
                format!("environment root `{}` does not exist", environment.path.display()),
                false,
            )]
        }
    }
}

struct PythonExecutable;

#[async_trait]
impl HealthCheck for PythonExecutable {
    fn name(&self) -> &'static str {
        "python-executable"
    }

    async fn run(&self, environment: &EnvironmentInfo, _: &CheckContext<'_>) -> Vec<Issue> {
        let layout = environment.layout();
        let python = match layout.existing_python() {
            Ok(python) => python,
            Err(err) => {
                return vec![issue(
                    IssueLevel::Critical,
                    IssueCategory::Interpreter,
                    err.to_string(),
                    false,
                )];
            }
        };
        match CommandSpec::new(&python)
            .arg("--version")
            .timeout(PROBE_TIMEOUT)
            .output()
            .await
        {
            Ok(output) if output.success() => Vec::new(),
            Ok(output) => vec![issue(
                IssueLevel::Error,
                IssueCategory::Interpreter,
                format!(
                    "python at `{}` exited with {:?}: {}",
                    python.display(),
                    output.code,
                    output.stderr.trim()
                ),
                false,
            )],
            Err(err) => vec![issue(
                IssueLevel::Error,
                IssueCategory::Interpreter,
                format!("python at `{}` could not be invoked: {err}", python.display()),
                false,
            )],
        }
    }
}

struct InstallerExecutable;

#[async_trait]
impl HealthCheck for InstallerExecutable {
    fn name(&self) -> &'static str {
        "installer-executable"
    }

    async fn run(&self, environment: &EnvironmentInfo, context: &CheckContext<'_>) -> Vec<Issue> {
        let mut issues = Vec::new();
        if !context.registry.is_available(environment.backend) {
            issues.push(issue(
                IssueLevel::Error,
                IssueCategory::Installer,
                format!(
                    "backend `{}` recorded for this environment is not available",
                    environment.backend
                ),
                false,
            ));
        }
        issues
    }
}

struct ReadWriteAccess;

#[async_trait]
impl HealthCheck for ReadWriteAccess {
    fn name(&self) -> &'static str {
        "read-write-access"
    }

    async fn run(&self, environment: &EnvironmentInfo, _: &CheckContext<'_>) -> Vec<Issue> {
        if !environment.path.is_dir() {
            return Vec::new();
        }
        let probe = environment.path.join(".gestvenv-doctor-probe");
        match fs_err::write(&probe, b"probe") {
            Ok(()) => {
                let _ = fs_err::remove_file(&probe);
                Vec::new()
            }
            Err(err) => vec![Issue {
                level: IssueLevel::Error,
                category: IssueCategory::Permissions,
                description: format!(
                    "environment root `{}` is not writable: {err}",
                    environment.path.display()
                ),
                auto_fixable: true,
                hint: Some("permission reset is recorded but not applied automatically".to_string()),
            }],
        }
    }
}

struct ManifestDrift;

#[async_trait]
impl HealthCheck for ManifestDrift {
    fn name(&self) -> &'static str {
        "manifest-drift"
    }

    async fn run(&self, environment: &EnvironmentInfo, _: &CheckContext<'_>) -> Vec<Issue> {
        let Some(manifest) = &environment.manifest_path else {
            return Vec::new();
        };
        let set = match parse_manifest(manifest) {
            Ok(set) => set,
            Err(err) => {
                return vec![issue(
                    IssueLevel::Warning,
                    IssueCategory::ManifestDrift,
                    format!("manifest `{}` is unreadable: {err}", manifest.display()),
                    false,
                )];
            }
        };
        let installed: Vec<String> = environment
            .packages
            .iter()
            .map(|package| fold_name(&package.name))
            .collect();
        let missing: Vec<String> = set
            .main
            .iter()
            .filter(|spec| !installed.contains(&spec.normalized_name()))
            .map(|spec| spec.name.clone())
            .collect();
        if missing.is_empty() {
            Vec::new()
        } else {
            vec![Issue {
                level: IssueLevel::Warning,
                category: IssueCategory::ManifestDrift,
                description: format!(
                    "manifest lists packages that are not installed: {}",
                    missing.join(", ")
                ),
                auto_fixable: true,
                hint: Some("run sync to reconcile".to_string()),
            }]
        }
    }
}

struct Oversize;

#[async_trait]
impl HealthCheck for Oversize {
    fn name(&self) -> &'static str {
        "oversize"
    }

    async fn run(&self, environment: &EnvironmentInfo, _: &CheckContext<'_>) -> Vec<Issue> {
        if !environment.path.is_dir() {
            return Vec::new();
        }
        let size: u64 = WalkDir::new(&environment.path)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|metadata| metadata.len())
            .sum();
        if size > OVERSIZE_THRESHOLD_BYTES {
            vec![issue(
                IssueLevel::Warning,
                IssueCategory::Oversize,
                format!(
                    "environment occupies {} MB",
                    size / (1024 * 1024)
                ),
                false,
            )]
        } else {
            Vec::new()
        }
    }
}

struct DependencyConflicts;

#[async_trait]
impl HealthCheck for DependencyConflicts {
    fn name(&self) -> &'static str {
        "dependency-conflicts"
    }

    async fn run(&self, environment: &EnvironmentInfo, context: &CheckContext<'_>) -> Vec<Issue> {
        let Ok(backend) = context.registry.get(environment.backend) else {
            // The installer checker already covers a missing backend.
            return Vec::new();
        };
        match backend.check(&environment.layout()).await {
            Ok(conflicts) => conflicts
                .into_iter()
                .map(|conflict| {
                    issue(
                        IssueLevel::Error,
                        IssueCategory::ManifestDrift,
                        conflict.message,
                        false,
                    )
                })
                .collect(),
            Err(err) => vec![issue(
                IssueLevel::Warning,
                IssueCategory::Installer,
                format!("dependency check could not run: {err}"),
                false,
            )],
        }
    }
}

struct BackendUpgradeHint;

#[async_trait]
impl HealthCheck for BackendUpgradeHint {
    fn name(&self) -> &'static str {
        "backend-upgrade-hint"
    }

    async fn run(&self, environment: &EnvironmentInfo, context: &CheckContext<'_>) -> Vec<Issue> {
        let current_score = context
            .registry
            .descriptor(environment.backend)
            .map(|descriptor| descriptor.performance_score)
            .unwrap_or(0);
        let best = context
            .registry
            .descriptors()
            .iter()
            .filter(|descriptor| descriptor.available)
            .max_by_key(|descriptor| descriptor.performance_score);
        match best {
            Some(best) if best.name != environment.backend && best.performance_score > current_score => {
                vec![Issue {
                    level: IssueLevel::Info,
                    category: IssueCategory::BackendUpgrade,
                    description: format!(
                        "backend `{}` is available and outscores `{}`",
                        best.name, environment.backend
                    ),
                    auto_fixable: false,
                    hint: Some(format!("recreate or clone the environment with `{}`", best.name)),
                }]
            }
            _ => Vec::new(),
        }
    }
}

struct MetadataPresent;

#[async_trait]
impl HealthCheck for MetadataPresent {
    fn name(&self) -> &'static str {
        "metadata-present"
    }

    async fn run(&self, environment: &EnvironmentInfo, _: &CheckContext<'_>) -> Vec<Issue> {
        let metadata = environment.layout().metadata_file();
        if metadata.is_file() {
            Vec::new()
        } else {
            vec![Issue {
                level: IssueLevel::Warning,
                category: IssueCategory::Metadata,
                description: "environment has no metadata record".to_string(),
                auto_fixable: true,
                hint: Some("the record can be rebuilt from the filesystem".to_string()),
            }]
        }
    }
}

fn checkers() -> Vec<Box<dyn HealthCheck>> {
    vec![
        Box::new(RootExists),
        Box::new(PythonExecutable),
        Box::new(InstallerExecutable),
        Box::new(ReadWriteAccess),
        Box::new(ManifestDrift),
        Box::new(DependencyConflicts),
        Box::new(Oversize),
        Box::new(BackendUpgradeHint),
        Box::new(MetadataPresent),
    ]
}

impl EnvironmentManager {
    /// Run the checker pipeline for one environment, or for every
    /// environment plus the cache when `name` is `None`. Health grades
    /// are persisted onto the records.
    pub async fn doctor(&self, name: Option<&str>) -> Result<Vec<DiagnosticReport>, CoreError> {
        let names = match name {
            Some(name) => vec![name.to_string()],
            None => self.store().list_names()?,
        };
        let context = CheckContext {
            registry: self.package_service().registry(),
        };
        let mut reports = Vec::new();
        for env_name in names {
            let Some(mut environment) = self.store().load(&env_name) else {
                if name.is_some() {
                    return Err(CoreError::NotFound(env_name));
                }
                continue;
            };
            let mut issues = Vec::new();
            for checker in checkers() {
                let found = checker.run(&environment, &context).await;
                debug!("checker {} found {} issue(s)", checker.name(), found.len());
                issues.extend(found);
            }
            let report = DiagnosticReport::from_issues(Some(env_name), issues);
            environment.health = report.health;
            self.store().save(&environment)?;
            reports.push(report);
        }

        if name.is_none() {
            reports.push(self.cache_health().await);
        }
        Ok(reports)
    }

    async fn cache_health(&self) -> DiagnosticReport {
        let cache = self.package_service().cache();
        let stats = cache.stats().await;
        let mut issues = Vec::new();
        if !stats.enabled {
            issues.push(issue(
                IssueLevel::Info,
                IssueCategory::Cache,
                "package cache is disabled",
                false,
            ));
        }
        let limit = self.config().cache.max_size_mb * 1024 * 1024;
        if stats.total_size_bytes > limit {
            issues.push(Issue {
                level: IssueLevel::Warning,
                category: IssueCategory::Cache,
                description: format!(
                    "cache holds {} MB, over its {} MB limit",
                    stats.total_size_bytes / (1024 * 1024),
                    self.config().cache.max_size_mb
                ),
                auto_fixable: true,
                hint: Some("run optimize to evict".to_string()),
            });
        }
        DiagnosticReport::from_issues(None, issues)
    }

    /// Apply fixes for the auto-fixable issues of one environment.
    /// Returns a description of each action taken.
    pub async fn auto_fix(&self, name: &str, issues: &[Issue]) -> Result<Vec<String>, CoreError> {
        let mut environment = self
            .store()
            .load(name)
            .ok_or_else(|| CoreError::NotFound(name.to_string()))?;
        let mut actions = Vec::new();
        for item in issues.iter().filter(|item| item.auto_fixable) {
            match item.category {
                IssueCategory::ManifestDrift => {
                    let report = self
                        .sync(name, &crate::manager::SyncOptions::default())
                        .await?;
                    actions.push(format!(
                        "reinstalled {} missing package(s) from the manifest",
                        report.packages_added.len()
                    ));
                    environment = self
                        .store()
                        .load(name)
                        .ok_or_else(|| CoreError::NotFound(name.to_string()))?;
                }
                IssueCategory::Metadata => {
                    self.store().save(&environment)?;
                    actions.push("rebuilt the metadata record".to_string());
                }
                IssueCategory::Permissions => {
                    // No platform policy for permission resets yet.
                    actions.push(
                        "permission reset requested but skipped: no platform policy".to_string(),
                    );
                }
                IssueCategory::Cache => {
                    self.package_service().cache().optimize().await?;
                    actions.push("optimized the package cache".to_string());
                }
                _ => {}
            }
        }
        info!("auto-fix for `{name}`: {} action(s)", actions.len());
        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::CreateRequest;
    use crate::test_support::{manager_with_stub, StubBackend};

    #[tokio::test]
    async fn healthy_environment_reports_healthy() {
        let (_dir, manager) = manager_with_stub(StubBackend::default());
        manager.create(CreateRequest::named("svc")).await.unwrap();
        let reports = manager.doctor(Some("svc")).await.unwrap();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert!(report.issues.is_empty(), "unexpected issues: {:?}", report.issues);
        assert_eq!(report.health, HealthStatus::Healthy);

        let persisted = manager.store().load("svc").unwrap();
        assert_eq!(persisted.health, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn vanished_root_is_critical() {
        let (_dir, manager) = manager_with_stub(StubBackend::default());
        let outcome = manager.create(CreateRequest::named("svc")).await.unwrap();
        // Remove the tree behind the manager's back, keeping the record
        // loadable through reconstruction.
        fs_err::remove_dir_all(&outcome.environment.path).unwrap();

        let reports = manager.doctor(None).await.unwrap();
        // Directory enumeration is the registry, so the env is simply gone;
        // only the cache report remains.
        assert_eq!(reports.len(), 1);
        assert!(reports[0].target.is_none());
    }

    #[tokio::test]
    async fn manifest_drift_is_flagged_and_fixable() {
        let (dir, manager) = manager_with_stub(StubBackend::default());
        let manifest = dir.path().join("requirements.txt");
        fs_err::write(&manifest, "requests==2.31.0\n").unwrap();
        manager
            .create_from_manifest(&manifest, CreateRequest::named("svc"), &[])
            .await
            .unwrap();

        // Manifest grows a new dependency the env lacks.
        fs_err::write(&manifest, "requests==2.31.0\nrich==13.7.1\n").unwrap();
        let reports = manager.doctor(Some("svc")).await.unwrap();
        let drift: Vec<_> = reports[0]
            .issues
            .iter()
            .filter(|issue| issue.category == IssueCategory::ManifestDrift)
            .collect();
        assert_eq!(drift.len(), 1);
        assert!(drift[0].auto_fixable);
        assert_eq!(reports[0].health, HealthStatus::HasWarnings);

        let actions = manager
            .auto_fix("svc", &reports[0].issues)
            .await
            .unwrap();
        assert!(!actions.is_empty());
        let environment = manager.store().load("svc").unwrap();
        assert!(environment.package("rich").is_some());
    }

    #[tokio::test]
    async fn unknown_environment_is_not_found() {
        let (_dir, manager) = manager_with_stub(StubBackend::default());
        assert!(matches!(
            manager.doctor(Some("ghost")).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn worst_level_drives_health() {
        let warning = issue(IssueLevel::Warning, IssueCategory::Oversize, "w", false);
        let critical = issue(IssueLevel::Critical, IssueCategory::Existence, "c", false);
        assert_eq!(overall_health(&[]), HealthStatus::Healthy);
        assert_eq!(
            overall_health(&[warning.clone()]),
            HealthStatus::HasWarnings
        );
        assert_eq!(
            overall_health(&[warning, critical]),
            HealthStatus::Corrupted
        );
        let upgrade = issue(IssueLevel::Info, IssueCategory::BackendUpgrade, "u", false);
        assert_eq!(overall_health(&[upgrade]), HealthStatus::NeedsUpdate);
    }
}
