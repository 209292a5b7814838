//! Cache export/import archives: a gzipped tar with `packages/`,
//! `metadata/`, `index.json` and `stats.json` at the top level.
//!
//! Import refuses any entry whose resolved path would land outside the
//! cache root, and merges or replaces the live index accordingly.

use std::collections::HashMap;
use std::path::{Component, Path};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info};

use crate::index::{CacheEntryMetadata, CacheState};
use crate::{CacheError, PackageCache};

impl PackageCache {
    /// Write the whole cache into a gzipped tar archive. Returns the
    /// number of exported entries.
    pub async fn export(&self, archive_path: &Path) -> Result<usize, CacheError> {
        // Quiesce mutations for a consistent snapshot.
        let state = self.state.lock().await;

        let file = fs_err::File::create(archive_path)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let packages = self.root().join("packages");
        if packages.is_dir() {
            builder.append_dir_all("packages", &packages)?;
        }
        let metadata = self.root().join("metadata");
        if metadata.is_dir() {
            builder.append_dir_all("metadata", &metadata)?;
        }
        for name in ["index.json", "stats.json"] {
            let path = self.root().join(name);
            if path.is_file() {
                builder.append_path_with_name(&path, name)?;
            }
        }
        builder.into_inner()?.finish()?;
        info!(
            "exported {} cache entries to `{}`",
            state.index.len(),
            archive_path.display()
        );
        Ok(state.index.len())
    }

    /// Import an archive. With `merge = false` the live cache is replaced;
    /// with `merge = true` imported entries are added next to existing
    /// ones (imported metadata wins on key collisions).
    pub async fn import(&self, archive_path: &Path, merge: bool) -> Result<usize, CacheError> {
        // Extract to a staging directory first so a malicious or truncated
        // archive cannot leave the live cache half-written.
        let staging = tempfile::tempdir_in(
            self.root()
                .parent()
                .unwrap_or_else(|| Path::new(".")),
        )?;

        let file = fs_err::File::open(archive_path)?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            validate_entry_path(&path)?;
            entry.unpack_in(staging.path())?;
        }

        let imported_index_path = staging.path().join("index.json");
        if !imported_index_path.is_file() {
            return Err(CacheError::ArchiveIndexMissing);
        }
        let imported_index: HashMap<String, CacheEntryMetadata> =
            serde_json::from_slice(&fs_err::read(&imported_index_path)?)?;

        if !merge {
            self.clear(false).await?;
        }

        let mut state = self.state.lock().await;
        let mut imported = 0usize;
        for (key, metadata) in imported_index {
            let source = staging
                .path()
                .join("packages")
                .join(&metadata.backend)
                .join(format!("{key}.whl"));
            if !source.is_file() {
                debug!("skipping `{key}`: archive has no artifact for it");
                continue;
            }
            let destination = self.artifact_path(&metadata.backend, &key);
            if let Some(parent) = destination.parent() {
                fs_err::create_dir_all(parent)?;
            }
            fs_err::rename(&source, &destination)?;
            crate::write_json_atomic(&self.metadata_path(&key), &metadata)?;
            state.index.insert(key, metadata);
            imported += 1;
        }
        state.persist_index(&self.index_path())?;
        state.persist_stats(&self.stats_path())?;
        info!(
            "imported {imported} cache entries from `{}`",
            archive_path.display()
        );
        Ok(imported)
    }
}

/// Reject absolute paths, parent traversal, and entries outside the four
/// known top-level names.
fn validate_entry_path(path: &Path) -> Result<(), CacheError> {
    let mut components = path.components();
    let first = components.next();
    let top_level_ok = matches!(
        first,
        Some(Component::Normal(name))
            if name == "packages" || name == "metadata" || name == "index.json" || name == "stats.json"
    );
    if !top_level_ok {
        return Err(CacheError::ArchiveEscape {
            entry: path.to_path_buf(),
        });
    }
    for component in components {
        if !matches!(component, Component::Normal(_)) {
            return Err(CacheError::ArchiveEscape {
                entry: path.to_path_buf(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::{CacheConfig, PackageCache};
    use gestvenv_backend::BackendKind;
    use gestvenv_manifest::Version;
    use gestvenv_platform::PlatformTag;

    fn tag() -> PlatformTag {
        "linux_x86_64".parse().unwrap()
    }

    fn version(text: &str) -> Version {
        text.parse().unwrap()
    }

    async fn seeded_cache(root: &Path) -> PackageCache {
        let cache = PackageCache::open(root.join("cache"), CacheConfig::default()).unwrap();
        for (name, v) in [("requests", "2.31.0"), ("rich", "13.7.1")] {
            cache
                .cache(name, &version(v), &tag(), name.as_bytes(), BackendKind::Pip)
                .await
                .unwrap();
        }
        cache
    }

    #[tokio::test]
    async fn export_then_import_reproduces_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(dir.path()).await;
        let archive = dir.path().join("cache.tar.gz");
        let exported = cache.export(&archive).await.unwrap();
        assert_eq!(exported, 2);

        let mut keys_before = cache.keys().await;
        keys_before.sort();

        cache.clear(false).await.unwrap();
        assert_eq!(cache.entry_count().await, 0);

        let imported = cache.import(&archive, false).await.unwrap();
        assert_eq!(imported, 2);
        let mut keys_after = cache.keys().await;
        keys_after.sort();
        assert_eq!(keys_before, keys_after);

        // Artifacts still round-trip after import.
        let hit = cache
            .get("requests", Some(&version("2.31.0")), Some(&tag()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.bytes, b"requests");
    }

    #[tokio::test]
    async fn import_with_merge_keeps_existing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(dir.path()).await;
        let archive = dir.path().join("cache.tar.gz");
        cache.export(&archive).await.unwrap();

        cache.clear(false).await.unwrap();
        cache
            .cache("local", &version("0.1"), &tag(), b"local", BackendKind::Pip)
            .await
            .unwrap();

        cache.import(&archive, true).await.unwrap();
        assert_eq!(cache.entry_count().await, 3);
        assert!(cache.is_cached("local", Some(&version("0.1")), Some(&tag())).await);
    }

    #[tokio::test]
    async fn import_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PackageCache::open(dir.path().join("cache"), CacheConfig::default()).unwrap();

        // Hand-build an archive with an escaping member.
        let archive_path = dir.path().join("evil.tar.gz");
        {
            let file = fs_err::File::create(&archive_path).unwrap();
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let payload = b"pwned";
            let mut header = tar::Header::new_gnu();
            header.set_size(payload.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "../escape.txt", payload.as_slice())
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap().flush().unwrap();
        }

        let err = cache.import(&archive_path, true).await.unwrap_err();
        assert!(matches!(err, CacheError::ArchiveEscape { .. }));
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn entry_path_validation() {
        assert!(validate_entry_path(Path::new("packages/pip/abc.whl")).is_ok());
        assert!(validate_entry_path(Path::new("index.json")).is_ok());
        assert!(validate_entry_path(Path::new("../outside")).is_err());
        assert!(validate_entry_path(Path::new("/etc/passwd")).is_err());
        assert!(validate_entry_path(Path::new("packages/../../x")).is_err());
        assert!(validate_entry_path(Path::new("unknown/top")).is_err());
    }
}
