//! End-to-end lifecycle flows through the assembled container.

mod common;

use common::{stub_container, test_config};
use gestvenv::{CoreError, CreateRequest, ExportFormat, ListFilter, Requirement, SyncOptions};

fn req(text: &str) -> Requirement {
    text.parse().unwrap()
}

#[tokio::test]
async fn create_list_delete_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let app = stub_container(test_config(dir.path())).await;

    let outcome = app
        .environments()
        .create(CreateRequest::named("svc"))
        .await
        .unwrap();
    assert!(outcome.environment.path.join("pyvenv.cfg").is_file());
    assert!(outcome
        .environment
        .path
        .join(".gestvenv-metadata.json")
        .is_file());

    let listed = app.environments().list(&ListFilter::default()).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "svc");

    app.environments().delete("svc", false).await.unwrap();
    assert!(!outcome.environment.path.exists());
    assert!(app
        .environments()
        .list(&ListFilter::default())
        .unwrap()
        .is_empty());

    // Second deletion is NotFound with no side effects.
    assert!(matches!(
        app.environments().delete("svc", false).await,
        Err(CoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn auto_selection_downgrades_to_the_available_backend() {
    // Only the pip stub is registered; auto must settle on it.
    let dir = tempfile::tempdir().unwrap();
    let app = stub_container(test_config(dir.path())).await;
    let outcome = app
        .environments()
        .create(CreateRequest::named("auto-pick"))
        .await
        .unwrap();
    assert_eq!(outcome.environment.backend, gestvenv::BackendKind::Pip);
}

#[tokio::test]
async fn pyproject_driven_create_and_sync() {
    let dir = tempfile::tempdir().unwrap();
    let app = stub_container(test_config(dir.path())).await;

    let manifest = dir.path().join("pyproject.toml");
    fs_err::write(
        &manifest,
        r#"
[project]
name = "webapp"
requires-python = ">=3.11"
dependencies = ["requests==2.31.0", "click==8.1.7"]
"#,
    )
    .unwrap();

    let outcome = app
        .environments()
        .create_from_manifest(&manifest, CreateRequest::default(), &[])
        .await
        .unwrap();
    assert_eq!(outcome.environment.name, "webapp");
    assert_eq!(outcome.environment.python_version, "3.11");
    assert!(outcome.environment.package("click").is_some());

    // The manifest drops click and gains rich.
    fs_err::write(
        &manifest,
        r#"
[project]
name = "webapp"
requires-python = ">=3.11"
dependencies = ["requests==2.31.0", "rich==13.7.1"]
"#,
    )
    .unwrap();

    let report = app
        .environments()
        .sync(
            "webapp",
            &SyncOptions {
                clean: true,
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(report.packages_added.iter().any(|name| name == "rich"));
    assert!(report.packages_removed.iter().any(|name| name == "click"));

    let environment = app.environments().store().load("webapp").unwrap();
    let installed: Vec<&str> = environment
        .packages
        .iter()
        .map(|package| package.name.as_str())
        .collect();
    assert!(installed.contains(&"requests"));
    assert!(installed.contains(&"rich"));
    assert!(!installed.contains(&"click"));
}

#[tokio::test]
async fn export_import_preserves_identity_and_packages() {
    let dir = tempfile::tempdir().unwrap();
    let app = stub_container(test_config(dir.path())).await;

    let request = CreateRequest {
        initial_packages: vec![req("requests==2.31.0"), req("rich==13.7.1")],
        ..CreateRequest::named("origin")
    };
    app.environments().create(request).await.unwrap();

    let payload = app
        .environments()
        .export("origin", ExportFormat::Json)
        .unwrap();
    let export_path = dir.path().join(&payload.file_name);
    fs_err::write(&export_path, &payload.content).unwrap();

    let imported = app
        .environments()
        .import(&export_path, Some("replica"))
        .await
        .unwrap();
    let original = app.environments().store().load("origin").unwrap();
    let replica = imported.environment;
    assert_eq!(replica.python_version, original.python_version);
    assert_eq!(replica.backend, original.backend);
    for package in original
        .packages
        .iter()
        .filter(|package| !["pip", "setuptools", "wheel"].contains(&package.name.as_str()))
    {
        let copied = replica
            .package(&package.name)
            .unwrap_or_else(|| panic!("{} missing from the replica", package.name));
        assert_eq!(copied.version, package.version);
    }
}

#[tokio::test]
async fn doctor_reports_and_persists_health() {
    let dir = tempfile::tempdir().unwrap();
    let app = stub_container(test_config(dir.path())).await;
    app.environments()
        .create(CreateRequest::named("svc"))
        .await
        .unwrap();

    let reports = app.environments().doctor(None).await.unwrap();
    // One per environment plus the cache report.
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().any(|report| report.target.is_none()));

    let environment = app.environments().store().load("svc").unwrap();
    assert_ne!(environment.health, gestvenv::HealthStatus::Unknown);
}
