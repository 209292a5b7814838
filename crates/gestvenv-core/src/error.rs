use std::io;
use std::path::PathBuf;

use thiserror::Error;

use gestvenv_backend::BackendError;
use gestvenv_cache::CacheError;
use gestvenv_manifest::ManifestError;
use gestvenv_platform::PathResolutionError;

/// Everything a core operation can fail with.
///
/// Expected outcomes (not-found, validation, offline miss) are ordinary
/// variants; operations return these rather than panicking, and partial
/// failures ride along as warnings on successful outcomes.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("environment `{0}` was not found")]
    NotFound(String),
    #[error("environment `{0}` already exists")]
    AlreadyExists(String),
    #[error("environment `{name}` is active; deletion requires force")]
    ActiveEnvironment { name: String },
    #[error("refusing to delete `{}`: {reason}", path.display())]
    UnsafeDeletion { path: PathBuf, reason: String },
    #[error("`{package}` is not cached and offline mode is on")]
    OfflineMiss { package: String },
    #[error("environment `{name}` has no manifest reference to sync against")]
    NoManifest { name: String },
    #[error("cannot import `{}`: {reason}", path.display())]
    UnsupportedImport { path: PathBuf, reason: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Path(#[from] PathResolutionError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
