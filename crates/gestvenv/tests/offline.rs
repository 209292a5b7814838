//! Offline-mode flows: cache hits install with no network path, misses
//! surface instead of falling back.

mod common;

use common::{stub_container, test_config};
use gestvenv::{CoreError, CreateRequest, PlatformTag, Requirement};
use gestvenv_backend::BackendKind;

fn req(text: &str) -> Requirement {
    text.parse().unwrap()
}

#[tokio::test]
async fn create_and_install_from_cache_while_offline() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.cache.offline_mode = true;
    let app = stub_container(config).await;

    // Precondition: the artifact is already cached for this platform.
    app.cache()
        .cache(
            "requests",
            &"2.31.0".parse().unwrap(),
            &PlatformTag::current(),
            b"wheel payload",
            BackendKind::Pip,
        )
        .await
        .unwrap();
    let hits_before = app.cache().stats().await.counters.cache_hits;

    let request = CreateRequest {
        initial_packages: vec![req("requests>=2.31")],
        ..CreateRequest::named("svc")
    };
    let outcome = app.environments().create(request).await.unwrap();
    assert!(outcome.warnings.is_empty());

    let requests = outcome
        .environment
        .package("requests")
        .expect("requests is installed");
    assert_eq!(requests.version, "2.31.0");
    assert_eq!(requests.source, "cache");

    let stats = app.cache().stats().await;
    assert_eq!(stats.counters.cache_hits, hits_before + 1);
}

#[tokio::test]
async fn offline_miss_fails_creation_and_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.cache.offline_mode = true;
    let app = stub_container(config).await;

    let request = CreateRequest {
        initial_packages: vec![req("not-cached==1.0")],
        ..CreateRequest::named("svc")
    };
    let err = app.environments().create(request).await.unwrap_err();
    match err {
        CoreError::OfflineMiss { package } => assert_eq!(package, "not-cached"),
        other => panic!("expected OfflineMiss, got {other}"),
    }
    // The partially created environment was rolled back.
    assert!(!app.environments().store().exists("svc"));
}

#[tokio::test]
async fn cache_archive_round_trip_preserves_keys() {
    let dir = tempfile::tempdir().unwrap();
    let app = stub_container(test_config(dir.path())).await;
    for (name, version) in [("requests", "2.31.0"), ("rich", "13.7.1")] {
        app.cache()
            .cache(
                name,
                &version.parse().unwrap(),
                &PlatformTag::current(),
                name.as_bytes(),
                BackendKind::Pip,
            )
            .await
            .unwrap();
    }
    let mut before = app.cache().keys().await;
    before.sort();

    let archive = dir.path().join("cache-export.tar.gz");
    app.cache().export(&archive).await.unwrap();
    app.cache().clear(false).await.unwrap();
    app.cache().import(&archive, false).await.unwrap();

    let mut after = app.cache().keys().await;
    after.sort();
    assert_eq!(before, after);
}
