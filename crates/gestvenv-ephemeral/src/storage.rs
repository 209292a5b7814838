//! Storage allocation for ephemeral roots: plain disk, tmpfs, or POSIX
//! shared memory, with optional preallocation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::models::{EphemeralConfig, StorageBackend};
use crate::EphemeralError;

/// Directories older than this with no live owner are orphans.
const ORPHAN_AGE: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug)]
pub struct StorageAllocator {
    backend: StorageBackend,
    base_path: PathBuf,
    preallocate: bool,
}

impl StorageAllocator {
    pub fn new(config: &EphemeralConfig) -> Result<Self, EphemeralError> {
        let base_path = config
            .base_storage_path
            .clone()
            .unwrap_or_else(|| default_base(config.storage_backend));
        let allocator = Self {
            backend: config.storage_backend,
            base_path,
            preallocate: config.enable_preallocation,
        };
        allocator.ensure_base()?;
        Ok(allocator)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn ensure_base(&self) -> Result<(), EphemeralError> {
        match self.backend {
            StorageBackend::Memory => {
                if !Path::new("/dev/shm").exists() {
                    return Err(EphemeralError::Creation {
                        message: "/dev/shm is not available for memory storage".to_string(),
                    });
                }
            }
            StorageBackend::Tmpfs => {
                if !Path::new("/tmp").exists() {
                    return Err(EphemeralError::Creation {
                        message: "tmpfs is not available".to_string(),
                    });
                }
            }
            StorageBackend::Disk => {}
        }
        fs_err::create_dir_all(&self.base_path)?;
        Ok(())
    }

    /// Allocate a dedicated storage root for `id`, mode 0700.
    pub fn allocate(&self, id: &str, estimated_mb: u64) -> Result<PathBuf, EphemeralError> {
        let root = self.base_path.join(id);
        fs_err::create_dir_all(&root)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs_err::set_permissions(&root, std::fs::Permissions::from_mode(0o700))?;
        }
        if self.preallocate {
            self.preallocate_space(&root, estimated_mb);
        }
        debug!("allocated storage for {id} at `{}`", root.display());
        Ok(root)
    }

    /// Reserve space ahead of time; failure is non-critical.
    fn preallocate_space(&self, root: &Path, estimated_mb: u64) {
        let marker = root.join(".preallocate");
        #[allow(clippy::cast_possible_wrap)]
        let length = (estimated_mb * 1024 * 1024) as i64;
        let result = (|| -> std::io::Result<()> {
            let (mut file, _path) = fs_err::File::create(&marker)?.into_parts();
            #[cfg(target_os = "linux")]
            {
                if nix::fcntl::posix_fallocate(&file, 0, length).is_ok() {
                    return Ok(());
                }
            }
            // Sparse-file fallback.
            use std::io::{Seek, SeekFrom, Write};
            file.seek(SeekFrom::Start((length as u64).saturating_sub(1)))?;
            file.write_all(&[0])?;
            Ok(())
        })();
        if let Err(err) = result {
            debug!("preallocation failed (non-critical): {err}");
        }
    }

    /// Recursive removal. Memory-backed roots are removed synchronously;
    /// other backends offload to a blocking worker.
    pub async fn release(&self, root: &Path) -> Result<(), EphemeralError> {
        if !root.exists() {
            return Ok(());
        }
        match self.backend {
            StorageBackend::Memory => {
                fs_err::remove_dir_all(root)?;
            }
            _ => {
                let root = root.to_path_buf();
                tokio::task::spawn_blocking(move || fs_err::remove_dir_all(&root))
                    .await
                    .map_err(|err| EphemeralError::Cleanup {
                        message: format!("storage release worker failed: {err}"),
                    })??;
            }
        }
        debug!("released storage at `{}`", root.display());
        Ok(())
    }

    /// Remove directories with no live owner that have been idle for two
    /// hours. Returns how many were reaped.
    pub async fn cleanup_orphaned(&self, live_ids: &[String]) -> usize {
        let Ok(entries) = fs_err::read_dir(&self.base_path) else {
            return 0;
        };
        let mut reaped = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if live_ids.contains(&name) {
                continue;
            }
            let old_enough = entry
                .metadata()
                .and_then(|metadata| metadata.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age > ORPHAN_AGE);
            if !old_enough {
                continue;
            }
            warn!("removing orphaned storage `{}`", path.display());
            if self.release(&path).await.is_ok() {
                reaped += 1;
            }
        }
        reaped
    }
}

fn default_base(backend: StorageBackend) -> PathBuf {
    match backend {
        StorageBackend::Tmpfs => PathBuf::from("/tmp/gestvenv-ephemeral"),
        StorageBackend::Memory => PathBuf::from("/dev/shm/gestvenv-ephemeral"),
        StorageBackend::Disk => dirs_cache().join("gestvenv").join("ephemeral"),
    }
}

fn dirs_cache() -> PathBuf {
    std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}
