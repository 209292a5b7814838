//! Per-environment metadata persistence.
//!
//! There is no global index: the environments directory enumeration *is*
//! the registry. Reads tolerate absent or unreadable metadata by
//! reconstructing a minimum-viable record from the filesystem; writes are
//! temp-file-then-rename.

use std::io::Write;
use std::path::{Path, PathBuf};

use jiff::Timestamp;
use tracing::{debug, warn};

use gestvenv_backend::BackendKind;
use gestvenv_platform::{VenvLayout, METADATA_FILE_NAME};

use crate::models::{EnvironmentInfo, HealthStatus};
use crate::CoreError;

#[derive(Debug, Clone)]
pub struct MetadataStore {
    environments_path: PathBuf,
}

impl MetadataStore {
    pub fn new(environments_path: impl Into<PathBuf>) -> Self {
        Self {
            environments_path: environments_path.into(),
        }
    }

    pub fn environments_path(&self) -> &Path {
        &self.environments_path
    }

    pub fn env_root(&self, name: &str) -> PathBuf {
        self.environments_path.join(name)
    }

    fn metadata_path(&self, env_root: &Path) -> PathBuf {
        env_root.join(METADATA_FILE_NAME)
    }

    /// Whether an environment directory exists under this store.
    pub fn exists(&self, name: &str) -> bool {
        self.env_root(name).is_dir()
    }

    /// Load the record for `name`, reconstructing one from the filesystem
    /// when metadata is absent or corrupt. `None` when the directory
    /// itself is gone.
    pub fn load(&self, name: &str) -> Option<EnvironmentInfo> {
        let root = self.env_root(name);
        if !root.is_dir() {
            return None;
        }
        let metadata_path = self.metadata_path(&root);
        match fs_err::read(&metadata_path) {
            Ok(bytes) => match serde_json::from_slice::<EnvironmentInfo>(&bytes) {
                Ok(mut record) => {
                    // The directory on disk wins over a stale path field.
                    record.path = root;
                    Some(record)
                }
                Err(err) => {
                    warn!("metadata for `{name}` is corrupt ({err}), reconstructing");
                    Some(detect_existing_environment(name, &root))
                }
            },
            Err(_) => {
                debug!("no metadata for `{name}`, reconstructing from the filesystem");
                Some(detect_existing_environment(name, &root))
            }
        }
    }

    /// Persist the record into its environment root.
    pub fn save(&self, record: &EnvironmentInfo) -> Result<(), CoreError> {
        let metadata_path = self.metadata_path(&record.path);
        let parent = metadata_path
            .parent()
            .expect("metadata path always has the env root as parent");
        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        temp.write_all(&serde_json::to_vec_pretty(record)?)?;
        temp.as_file().sync_all()?;
        temp.persist(&metadata_path).map_err(|err| err.error)?;
        Ok(())
    }

    /// Every environment name under the store, sorted.
    pub fn list_names(&self) -> Result<Vec<String>, CoreError> {
        if !self.environments_path.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs_err::read_dir(&self.environments_path)? {
            let entry = entry?;
            // Follow symlinks so custom-path environments stay listed.
            if !entry.path().is_dir() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }
}

/// Build a minimum-viable record for a venv directory we did not create
/// or whose metadata is unreadable.
pub(crate) fn detect_existing_environment(name: &str, root: &Path) -> EnvironmentInfo {
    let layout = VenvLayout::new(root);
    let python_version = read_pyvenv_version(&layout.pyvenv_cfg()).unwrap_or_default();
    let now = Timestamp::now();
    EnvironmentInfo {
        name: name.to_string(),
        path: root.to_path_buf(),
        python_version,
        backend: BackendKind::Pip,
        health: HealthStatus::Unknown,
        created_at: now,
        last_modified: now,
        last_used: now,
        is_active: false,
        manifest_path: None,
        packages: Vec::new(),
        dependency_groups: indexmap::IndexMap::new(),
        lock_file: None,
    }
}

/// Pull `major.minor` out of `pyvenv.cfg`, which records either
/// `version = 3.11.4` (stdlib venv) or `version_info = 3.11.4` (uv et al).
fn read_pyvenv_version(path: &Path) -> Option<String> {
    let content = fs_err::read_to_string(path).ok()?;
    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key == "version" || key == "version_info" {
            let value = value.trim();
            let mut parts = value.split('.');
            let major = parts.next()?;
            let minor = parts.next()?;
            return Some(format!("{major}.{minor}"));
        }
    }
    None
}
