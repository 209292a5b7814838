//! Content-addressed offline package cache.
//!
//! Artifacts live at `packages/<backend>/<key>.whl` with a metadata record
//! at `metadata/<key>.json`; `index.json` mirrors all metadata and
//! `stats.json` holds counters. The key is `md5(name-version-platform)`,
//! an opaque identifier, never a security boundary; integrity is SHA-256
//! over the uncompressed bytes.
//!
//! Concurrency: one index-wide lock guards `index.json` and the in-memory
//! index; a lock per key guards artifact files. Readers take a single
//! snapshot of the index and never hold the lock across file I/O.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use jiff::Timestamp;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use gestvenv_backend::{Backend, BackendError, BackendKind};
use gestvenv_manifest::Version;
use gestvenv_platform::{PlatformTag, VenvLayout};

pub use crate::index::{CacheEntryMetadata, CacheStats};
use crate::index::CacheState;
use crate::memory::MemoryTier;
pub use crate::key::{cache_key, checksum};

mod archive;
mod index;
mod key;
mod memory;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("cached artifact for {package} {version} failed checksum verification")]
    Integrity { package: String, version: String },
    #[error("archive entry `{}` would land outside the cache root", entry.display())]
    ArchiveEscape { entry: PathBuf },
    #[error("archive is missing its index")]
    ArchiveIndexMissing,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Cache behavior knobs, immutable after open except for offline mode.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_size_mb: u64,
    pub compression: bool,
    pub offline_mode: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_mb: 1000,
            compression: true,
            offline_mode: false,
        }
    }
}

/// A successful cache read.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub bytes: Vec<u8>,
    pub metadata: CacheEntryMetadata,
}

/// Result of installing straight out of the cache.
#[derive(Debug, Clone)]
pub struct InstalledFromCache {
    pub package: String,
    pub version: String,
}

/// Aggregate view for status surfaces and the doctor.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    #[serde(flatten)]
    pub counters: CacheStats,
    pub total_size_bytes: u64,
    pub entry_count: usize,
    pub enabled: bool,
    pub offline_mode: bool,
    pub compression: bool,
}

pub struct PackageCache {
    root: PathBuf,
    config: CacheConfig,
    offline: AtomicBool,
    state: tokio::sync::Mutex<CacheState>,
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    memory: MemoryTier,
}

impl std::fmt::Debug for PackageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageCache")
            .field("root", &self.root)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PackageCache {
    /// Open (creating if needed) the cache rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, config: CacheConfig) -> Result<Self, CacheError> {
        let root = root.into();
        ensure_structure(&root)?;
        let state = CacheState::load(&root.join("index.json"), &root.join("stats.json"));
        let offline = AtomicBool::new(config.offline_mode);
        Ok(Self {
            root,
            config,
            offline,
            state: tokio::sync::Mutex::new(state),
            key_locks: Mutex::new(HashMap::new()),
            memory: MemoryTier::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn offline_mode(&self) -> bool {
        self.offline.load(Ordering::Relaxed)
    }

    pub fn set_offline_mode(&self, enabled: bool) {
        self.offline.store(enabled, Ordering::Relaxed);
    }

    fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    fn metadata_dir(&self) -> PathBuf {
        self.root.join("metadata")
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    fn stats_path(&self) -> PathBuf {
        self.root.join("stats.json")
    }

    fn artifact_path(&self, backend: &str, key: &str) -> PathBuf {
        self.packages_dir().join(backend).join(format!("{key}.whl"))
    }

    fn metadata_path(&self, key: &str) -> PathBuf {
        self.metadata_dir().join(format!("{key}.json"))
    }

    fn max_bytes(&self) -> u64 {
        self.config.max_size_mb * 1024 * 1024
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock().expect("key lock table poisoned");
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Store an artifact. Atomic per key and idempotent for identical
    /// `(package, version, platform)` triples.
    pub async fn cache(
        &self,
        package: &str,
        version: &Version,
        platform: &PlatformTag,
        bytes: &[u8],
        backend: BackendKind,
    ) -> Result<(), CacheError> {
        if !self.config.enabled {
            debug!("cache disabled, not storing {package} {version}");
            return Ok(());
        }
        let key = cache_key(package, &version.to_string(), platform);
        let key_lock = self.key_lock(&key);
        let _artifact_guard = key_lock.lock().await;

        let digest = checksum(bytes);
        let stored: Vec<u8> = if self.config.compression {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(bytes)?;
            encoder.finish()?
        } else {
            bytes.to_vec()
        };

        let mut state = self.state.lock().await;
        // Size accounting treats an overwrite of the same key as a swap.
        let replaced = state.index.get(&key).map(|entry| entry.size).unwrap_or(0);
        let projected = state.total_size() - replaced + stored.len() as u64;
        if projected > self.max_bytes() {
            self.evict_lru(
                &mut state,
                self.max_bytes() * 8 / 10,
                stored.len() as u64,
                Some(&key),
            )?;
        }

        let backend_dir = self.packages_dir().join(backend.as_str());
        fs_err::create_dir_all(&backend_dir)?;
        write_bytes_atomic(&self.artifact_path(backend.as_str(), &key), &stored)?;

        let now = Timestamp::now();
        let metadata = CacheEntryMetadata {
            package: package.to_string(),
            version: version.to_string(),
            platform: platform.to_string(),
            backend: backend.as_str().to_string(),
            size: stored.len() as u64,
            checksum_sha256: digest,
            compressed: self.config.compression,
            cached_at: now,
            last_used: now,
        };
        write_json_atomic(&self.metadata_path(&key), &metadata)?;

        state.index.insert(key, metadata);
        state.stats.cache_add += 1;
        state.persist_index(&self.index_path())?;
        state.persist_stats(&self.stats_path())?;
        debug!("cached {package}=={version} for {platform}");
        Ok(())
    }

    /// Look up an artifact. With a version, the lookup is exact; without,
    /// the PEP 440-latest entry for the platform wins. Never downloads.
    pub async fn get(
        &self,
        package: &str,
        version: Option<&Version>,
        platform: Option<&PlatformTag>,
    ) -> Result<Option<CacheHit>, CacheError> {
        if !self.config.enabled {
            return Ok(None);
        }
        let platform = platform.cloned().unwrap_or_else(PlatformTag::current);

        if let Some(version) = version {
            if let Some(bytes) =
                self.memory
                    .get(package, &version.to_string(), &platform.to_string())
            {
                let key = cache_key(package, &version.to_string(), &platform);
                let mut state = self.state.lock().await;
                if let Some(entry) = state.index.get_mut(&key) {
                    // A hot-tier hit is still a use; keep the LRU order
                    // honest so the entry is not evicted out from under
                    // the memory tier.
                    entry.last_used = Timestamp::now();
                    let metadata = entry.clone();
                    state.stats.cache_hits += 1;
                    state.persist_index(&self.index_path())?;
                    state.persist_stats(&self.stats_path())?;
                    return Ok(Some(CacheHit { bytes, metadata }));
                }
            }
        }

        // One snapshot of the index; no lock held during file I/O.
        let selected = {
            let state = self.state.lock().await;
            select_entry(&state.index, package, version, &platform)
        };
        let Some((key, metadata)) = selected else {
            let mut state = self.state.lock().await;
            state.stats.cache_misses += 1;
            state.persist_stats(&self.stats_path())?;
            return Ok(None);
        };

        let key_lock = self.key_lock(&key);
        let _artifact_guard = key_lock.lock().await;
        let artifact = self.artifact_path(&metadata.backend, &key);
        let stored = match fs_err::read(&artifact) {
            Ok(stored) => stored,
            Err(_) => {
                // Dangling index entry; the next optimize pass reconciles.
                let mut state = self.state.lock().await;
                state.stats.cache_misses += 1;
                state.persist_stats(&self.stats_path())?;
                return Ok(None);
            }
        };
        let bytes = if metadata.compressed {
            let mut decoder = GzDecoder::new(stored.as_slice());
            let mut decompressed = Vec::new();
            decoder.read_to_end(&mut decompressed)?;
            decompressed
        } else {
            stored
        };

        if checksum(&bytes) != metadata.checksum_sha256 {
            warn!(
                "evicting {} {}: artifact failed checksum verification",
                metadata.package, metadata.version
            );
            let mut state = self.state.lock().await;
            self.remove_entry(&mut state, &key)?;
            state.stats.cache_misses += 1;
            state.persist_index(&self.index_path())?;
            state.persist_stats(&self.stats_path())?;
            return Ok(None);
        }

        {
            let mut state = self.state.lock().await;
            if let Some(entry) = state.index.get_mut(&key) {
                entry.last_used = Timestamp::now();
            }
            state.stats.cache_hits += 1;
            state.persist_index(&self.index_path())?;
            state.persist_stats(&self.stats_path())?;
        }
        self.memory.admit(
            &metadata.package,
            &metadata.version,
            &metadata.platform,
            bytes.clone(),
        );
        Ok(Some(CacheHit { bytes, metadata }))
    }

    /// Whether a matching entry exists, without touching artifact files.
    pub async fn is_cached(
        &self,
        package: &str,
        version: Option<&Version>,
        platform: Option<&PlatformTag>,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }
        let platform = platform.cloned().unwrap_or_else(PlatformTag::current);
        let state = self.state.lock().await;
        select_entry(&state.index, package, version, &platform).is_some()
    }

    /// Materialize a cached artifact and hand it to the backend's local
    /// wheel-install path. `None` when the cache has no match.
    pub async fn install_from_cache(
        &self,
        env: &VenvLayout,
        backend: &dyn Backend,
        package: &str,
        version: Option<&Version>,
    ) -> Result<Option<InstalledFromCache>, CacheError> {
        let Some(hit) = self.get(package, version, None).await? else {
            return Ok(None);
        };
        let staging = tempfile::tempdir()?;
        let wheel_name = format!(
            "{}-{}-py3-none-any.whl",
            hit.metadata.package.replace('-', "_"),
            hit.metadata.version
        );
        let wheel_path = staging.path().join(wheel_name);
        fs_err::write(&wheel_path, &hit.bytes)?;
        backend.install_wheel(env, &wheel_path).await?;
        Ok(Some(InstalledFromCache {
            package: hit.metadata.package,
            version: hit.metadata.version,
        }))
    }

    /// `selective = false` wipes and recreates the cache; `true` runs an
    /// LRU pass down to 80% of the limit.
    pub async fn clear(&self, selective: bool) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        if selective {
            self.evict_lru(&mut state, self.max_bytes() * 8 / 10, 0, None)?;
            state.persist_index(&self.index_path())?;
            state.persist_stats(&self.stats_path())?;
            return Ok(());
        }
        if self.root.exists() {
            fs_err::remove_dir_all(&self.root)?;
        }
        ensure_structure(&self.root)?;
        state.index.clear();
        state.stats = CacheStats::new();
        state.persist_index(&self.index_path())?;
        state.persist_stats(&self.stats_path())?;
        self.memory.clear();
        Ok(())
    }

    /// LRU pass, checksum deduplication, orphan reconciliation and a
    /// memory-tier sweep. After this, index and disk agree.
    pub async fn optimize(&self) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;

        if state.total_size() > self.max_bytes() {
            self.evict_lru(&mut state, self.max_bytes() * 8 / 10, 0, None)?;
        }

        // Identical bytes cached under several keys: keep the most
        // recently used copy.
        let mut by_checksum: HashMap<String, Vec<String>> = HashMap::new();
        for (key, entry) in &state.index {
            by_checksum
                .entry(entry.checksum_sha256.clone())
                .or_default()
                .push(key.clone());
        }
        for (_, mut keys) in by_checksum {
            if keys.len() < 2 {
                continue;
            }
            keys.sort_by_key(|key| state.index[key].last_used);
            for key in &keys[..keys.len() - 1] {
                self.remove_entry(&mut state, key)?;
            }
        }

        // Dangling index entries (artifact gone).
        let dangling: Vec<String> = state
            .index
            .iter()
            .filter(|(key, entry)| !self.artifact_path(&entry.backend, key).is_file())
            .map(|(key, _)| key.clone())
            .collect();
        for key in dangling {
            self.remove_entry(&mut state, &key)?;
        }

        // Orphan metadata files (no index entry).
        if let Ok(entries) = fs_err::read_dir(self.metadata_dir()) {
            for entry in entries.flatten() {
                let path = entry.path();
                let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                    continue;
                };
                if !state.index.contains_key(stem) {
                    let _ = fs_err::remove_file(&path);
                }
            }
        }
        // Orphan artifacts (no index entry).
        if let Ok(backends) = fs_err::read_dir(self.packages_dir()) {
            for backend_dir in backends.flatten() {
                let Ok(files) = fs_err::read_dir(backend_dir.path()) else {
                    continue;
                };
                for file in files.flatten() {
                    let path = file.path();
                    let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                        continue;
                    };
                    if !state.index.contains_key(stem) {
                        let _ = fs_err::remove_file(&path);
                    }
                }
            }
        }

        self.memory.sweep();
        state.persist_index(&self.index_path())?;
        state.persist_stats(&self.stats_path())?;
        Ok(())
    }

    pub async fn stats(&self) -> CacheStatsSnapshot {
        let state = self.state.lock().await;
        CacheStatsSnapshot {
            counters: state.stats.clone(),
            total_size_bytes: state.total_size(),
            entry_count: state.index.len(),
            enabled: self.config.enabled,
            offline_mode: self.offline_mode(),
            compression: self.config.compression,
        }
    }

    pub async fn size_bytes(&self) -> u64 {
        self.state.lock().await.total_size()
    }

    pub async fn entry_count(&self) -> usize {
        self.state.lock().await.index.len()
    }

    /// Keys currently present, for tests and diagnostics.
    pub async fn keys(&self) -> Vec<String> {
        self.state.lock().await.index.keys().cloned().collect()
    }

    /// Evict by ascending `last_used` until `current + incoming ≤ target`.
    fn evict_lru(
        &self,
        state: &mut CacheState,
        target: u64,
        incoming: u64,
        protect: Option<&str>,
    ) -> Result<(), CacheError> {
        for key in state.keys_by_last_used() {
            if state.total_size() + incoming <= target {
                break;
            }
            if protect == Some(key.as_str()) {
                continue;
            }
            debug!("evicting {key} to make room");
            self.remove_entry(state, &key)?;
            state.stats.cache_evictions += 1;
        }
        Ok(())
    }

    fn remove_entry(&self, state: &mut CacheState, key: &str) -> Result<(), CacheError> {
        let Some(entry) = state.index.remove(key) else {
            return Ok(());
        };
        let artifact = self.artifact_path(&entry.backend, key);
        if artifact.exists() {
            fs_err::remove_file(&artifact)?;
        }
        let metadata = self.metadata_path(key);
        if metadata.exists() {
            fs_err::remove_file(&metadata)?;
        }
        self.memory
            .remove(&entry.package, &entry.version, &entry.platform);
        Ok(())
    }
}

/// Pick the entry for a lookup: exact key with a version, otherwise the
/// PEP 440-latest for `(package, platform)`.
fn select_entry(
    index: &HashMap<String, CacheEntryMetadata>,
    package: &str,
    version: Option<&Version>,
    platform: &PlatformTag,
) -> Option<(String, CacheEntryMetadata)> {
    if let Some(version) = version {
        let key = cache_key(package, &version.to_string(), platform);
        return index.get(&key).map(|entry| (key, entry.clone()));
    }
    let package = package.to_lowercase();
    let platform = platform.to_string();
    index
        .iter()
        .filter(|(_, entry)| {
            entry.package.to_lowercase() == package && entry.platform == platform
        })
        .filter_map(|(key, entry)| {
            let version: Version = entry.version.parse().ok()?;
            Some((key.clone(), entry.clone(), version))
        })
        .max_by(|left, right| left.2.cmp(&right.2))
        .map(|(key, entry, _)| (key, entry))
}

fn ensure_structure(root: &Path) -> Result<(), CacheError> {
    fs_err::create_dir_all(root.join("packages"))?;
    fs_err::create_dir_all(root.join("metadata"))?;
    let index = root.join("index.json");
    if !index.exists() {
        write_json_atomic(&index, &HashMap::<String, CacheEntryMetadata>::new())?;
    }
    let stats = root.join("stats.json");
    if !stats.exists() {
        write_json_atomic(&stats, &CacheStats::new())?;
    }
    Ok(())
}

/// Serialize as pretty JSON to a temp file and rename into place.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), CacheError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_bytes_atomic(path, &bytes)
}

pub(crate) fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag() -> PlatformTag {
        "linux_x86_64".parse().unwrap()
    }

    fn version(text: &str) -> Version {
        text.parse().unwrap()
    }

    fn open_cache(dir: &Path, config: CacheConfig) -> PackageCache {
        PackageCache::open(dir.join("cache"), config).unwrap()
    }

    #[tokio::test]
    async fn round_trip_preserves_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), CacheConfig::default());
        let payload = b"wheel-bytes".to_vec();
        cache
            .cache("requests", &version("2.31.0"), &tag(), &payload, BackendKind::Pip)
            .await
            .unwrap();
        let hit = cache
            .get("requests", Some(&version("2.31.0")), Some(&tag()))
            .await
            .unwrap()
            .expect("entry is present");
        assert_eq!(hit.bytes, payload);
        assert_eq!(checksum(&hit.bytes), hit.metadata.checksum_sha256);
        assert!(hit.metadata.compressed);
    }

    #[tokio::test]
    async fn round_trip_without_compression() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(
            dir.path(),
            CacheConfig {
                compression: false,
                ..CacheConfig::default()
            },
        );
        let payload = vec![7u8; 4096];
        cache
            .cache("rich", &version("13.7.1"), &tag(), &payload, BackendKind::Uv)
            .await
            .unwrap();
        let hit = cache
            .get("rich", Some(&version("13.7.1")), Some(&tag()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.bytes, payload);
        assert!(!hit.metadata.compressed);
    }

    #[tokio::test]
    async fn versionless_lookup_selects_latest() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), CacheConfig::default());
        for v in ["1.0", "2.0rc1", "1.9"] {
            cache
                .cache("demo", &version(v), &tag(), v.as_bytes(), BackendKind::Pip)
                .await
                .unwrap();
        }
        let hit = cache.get("demo", None, Some(&tag())).await.unwrap().unwrap();
        assert_eq!(hit.metadata.version, "2.0rc1");
    }

    #[tokio::test]
    async fn miss_counts_and_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), CacheConfig::default());
        assert!(cache
            .get("absent", Some(&version("1.0")), Some(&tag()))
            .await
            .unwrap()
            .is_none());
        let stats = cache.stats().await;
        assert_eq!(stats.counters.cache_misses, 1);
        assert_eq!(stats.counters.cache_hits, 0);
    }

    #[tokio::test]
    async fn hit_increments_counter_and_updates_last_used() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), CacheConfig::default());
        cache
            .cache("demo", &version("1.0"), &tag(), b"x", BackendKind::Pip)
            .await
            .unwrap();
        let before = cache.stats().await.counters.cache_hits;
        cache
            .get("demo", Some(&version("1.0")), Some(&tag()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cache.stats().await.counters.cache_hits, before + 1);
    }

    #[tokio::test]
    async fn hot_tier_hits_advance_last_used() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), CacheConfig::default());
        cache
            .cache("demo", &version("1.0"), &tag(), b"payload", BackendKind::Pip)
            .await
            .unwrap();

        // First read comes from disk and admits the entry to the hot tier.
        let first = cache
            .get("demo", Some(&version("1.0")), Some(&tag()))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        // Second read is served from memory but must still count as a use.
        let second = cache
            .get("demo", Some(&version("1.0")), Some(&tag()))
            .await
            .unwrap()
            .unwrap();
        assert!(second.metadata.last_used > first.metadata.last_used);
    }

    #[tokio::test]
    async fn corrupted_artifact_is_evicted_and_missed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(
            dir.path(),
            CacheConfig {
                compression: false,
                ..CacheConfig::default()
            },
        );
        cache
            .cache("demo", &version("1.0"), &tag(), b"good bytes", BackendKind::Pip)
            .await
            .unwrap();
        let key = cache_key("demo", "1.0", &tag());
        let artifact = cache.artifact_path("pip", &key);
        fs_err::write(&artifact, b"tampered").unwrap();

        assert!(cache
            .get("demo", Some(&version("1.0")), Some(&tag()))
            .await
            .unwrap()
            .is_none());
        // The entry is gone entirely.
        assert!(!artifact.exists());
        assert!(cache.keys().await.is_empty());
    }

    #[tokio::test]
    async fn eviction_keeps_usage_under_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(
            dir.path(),
            CacheConfig {
                compression: false,
                max_size_mb: 10,
                ..CacheConfig::default()
            },
        );
        let megabyte = vec![0u8; 1024 * 1024];
        for index in 0..12 {
            cache
                .cache(
                    &format!("pkg{index}"),
                    &version("1.0"),
                    &tag(),
                    &megabyte,
                    BackendKind::Pip,
                )
                .await
                .unwrap();
            // Distinct last_used ordering.
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let stats = cache.stats().await;
        assert_eq!(stats.counters.cache_add, 12);
        assert!(stats.total_size_bytes <= 10 * 1024 * 1024);
        // The oldest keys were evicted first.
        assert!(!cache.is_cached("pkg0", Some(&version("1.0")), Some(&tag())).await);
        assert!(!cache.is_cached("pkg1", Some(&version("1.0")), Some(&tag())).await);
        assert!(!cache.is_cached("pkg2", Some(&version("1.0")), Some(&tag())).await);
        assert!(cache.is_cached("pkg11", Some(&version("1.0")), Some(&tag())).await);
    }

    #[tokio::test]
    async fn concurrent_writes_to_one_key_leave_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = std::sync::Arc::new(open_cache(dir.path(), CacheConfig::default()));
        let left = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .cache("demo", &version("1.0"), &tag(), b"payload", BackendKind::Pip)
                    .await
            })
        };
        let right = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .cache("demo", &version("1.0"), &tag(), b"payload", BackendKind::Pip)
                    .await
            })
        };
        left.await.unwrap().unwrap();
        right.await.unwrap().unwrap();
        assert_eq!(cache.entry_count().await, 1);
        let key = cache_key("demo", "1.0", &tag());
        assert!(cache.artifact_path("pip", &key).is_file());
        assert!(cache.metadata_path(&key).is_file());
    }

    #[tokio::test]
    async fn optimize_reconciles_index_and_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(
            dir.path(),
            CacheConfig {
                compression: false,
                ..CacheConfig::default()
            },
        );
        cache
            .cache("keep", &version("1.0"), &tag(), b"keep", BackendKind::Pip)
            .await
            .unwrap();
        cache
            .cache("dangling", &version("1.0"), &tag(), b"dangling", BackendKind::Pip)
            .await
            .unwrap();
        // Break invariants behind the cache's back.
        let dangling_key = cache_key("dangling", "1.0", &tag());
        fs_err::remove_file(cache.artifact_path("pip", &dangling_key)).unwrap();
        fs_err::write(cache.metadata_path("feedfacefeedface"), b"{}").unwrap();

        cache.optimize().await.unwrap();

        assert_eq!(cache.entry_count().await, 1);
        assert!(!cache.metadata_path(&dangling_key).exists());
        assert!(!cache.metadata_path("feedfacefeedface").exists());
        assert!(cache
            .get("keep", Some(&version("1.0")), Some(&tag()))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn optimize_deduplicates_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(
            dir.path(),
            CacheConfig {
                compression: false,
                ..CacheConfig::default()
            },
        );
        cache
            .cache("first", &version("1.0"), &tag(), b"same-bytes", BackendKind::Pip)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cache
            .cache("second", &version("1.0"), &tag(), b"same-bytes", BackendKind::Pip)
            .await
            .unwrap();
        cache.optimize().await.unwrap();
        assert_eq!(cache.entry_count().await, 1);
        assert!(cache.is_cached("second", Some(&version("1.0")), Some(&tag())).await);
    }

    #[tokio::test]
    async fn clear_wipes_and_recreates() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), CacheConfig::default());
        cache
            .cache("demo", &version("1.0"), &tag(), b"x", BackendKind::Pip)
            .await
            .unwrap();
        cache.clear(false).await.unwrap();
        assert_eq!(cache.entry_count().await, 0);
        assert!(cache.root().join("index.json").is_file());
        assert!(cache.root().join("packages").is_dir());
    }

    #[tokio::test]
    async fn disabled_cache_is_inert() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(
            dir.path(),
            CacheConfig {
                enabled: false,
                ..CacheConfig::default()
            },
        );
        cache
            .cache("demo", &version("1.0"), &tag(), b"x", BackendKind::Pip)
            .await
            .unwrap();
        assert!(cache
            .get("demo", Some(&version("1.0")), Some(&tag()))
            .await
            .unwrap()
            .is_none());
        assert_eq!(cache.entry_count().await, 0);
    }

    #[tokio::test]
    async fn offline_flag_toggles() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), CacheConfig::default());
        assert!(!cache.offline_mode());
        cache.set_offline_mode(true);
        assert!(cache.offline_mode());
    }
}
