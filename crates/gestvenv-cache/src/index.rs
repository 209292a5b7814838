//! On-disk index and statistics records.

use std::collections::HashMap;
use std::path::Path;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::write_json_atomic;
use crate::CacheError;

/// Metadata for one cached artifact, mirrored at `metadata/<key>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntryMetadata {
    pub package: String,
    pub version: String,
    pub platform: String,
    /// Which backend produced the artifact.
    pub backend: String,
    /// Stored size in bytes (after compression, when enabled).
    pub size: u64,
    /// SHA-256 of the *uncompressed* bytes.
    pub checksum_sha256: String,
    pub compressed: bool,
    pub cached_at: Timestamp,
    pub last_used: Timestamp,
}

/// Counters persisted at `stats.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_add: u64,
    pub cache_evictions: u64,
    pub created_at: Timestamp,
}

impl CacheStats {
    pub(crate) fn new() -> Self {
        Self {
            cache_hits: 0,
            cache_misses: 0,
            cache_add: 0,
            cache_evictions: 0,
            created_at: Timestamp::now(),
        }
    }
}

/// The in-memory mirror of `index.json` plus the stats counters. All
/// mutations happen under the cache's index lock.
#[derive(Debug)]
pub(crate) struct CacheState {
    pub(crate) index: HashMap<String, CacheEntryMetadata>,
    pub(crate) stats: CacheStats,
}

impl CacheState {
    /// Load from disk, tolerating absent or corrupt files: an unreadable
    /// index starts empty and is rebuilt by the next `optimize` pass.
    pub(crate) fn load(index_path: &Path, stats_path: &Path) -> Self {
        let index = match fs_err::read(index_path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(index) => index,
                Err(err) => {
                    warn!("cache index unreadable, starting empty: {err}");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        let stats = fs_err::read(stats_path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_else(CacheStats::new);
        Self { index, stats }
    }

    /// Total stored bytes according to the index.
    pub(crate) fn total_size(&self) -> u64 {
        self.index.values().map(|entry| entry.size).sum()
    }

    /// Keys ordered by ascending `last_used`, the LRU eviction order.
    pub(crate) fn keys_by_last_used(&self) -> Vec<String> {
        let mut entries: Vec<(&String, &CacheEntryMetadata)> = self.index.iter().collect();
        entries.sort_by_key(|(_, metadata)| metadata.last_used);
        entries.into_iter().map(|(key, _)| key.clone()).collect()
    }

    pub(crate) fn persist_index(&self, index_path: &Path) -> Result<(), CacheError> {
        write_json_atomic(index_path, &self.index)
    }

    pub(crate) fn persist_stats(&self, stats_path: &Path) -> Result<(), CacheError> {
        write_json_atomic(stats_path, &self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(last_used_seconds: i64) -> CacheEntryMetadata {
        CacheEntryMetadata {
            package: "demo".to_string(),
            version: "1.0".to_string(),
            platform: "linux_x86_64".to_string(),
            backend: "pip".to_string(),
            size: 100,
            checksum_sha256: String::new(),
            compressed: false,
            cached_at: Timestamp::UNIX_EPOCH,
            last_used: Timestamp::from_second(last_used_seconds).unwrap(),
        }
    }

    #[test]
    fn lru_order_is_ascending_last_used() {
        let mut state = CacheState {
            index: HashMap::new(),
            stats: CacheStats::new(),
        };
        state.index.insert("newer".to_string(), entry(2_000));
        state.index.insert("oldest".to_string(), entry(1_000));
        state.index.insert("newest".to_string(), entry(3_000));
        assert_eq!(state.keys_by_last_used(), ["oldest", "newer", "newest"]);
        assert_eq!(state.total_size(), 300);
    }

    #[test]
    fn load_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let state = CacheState::load(&dir.path().join("index.json"), &dir.path().join("stats.json"));
        assert!(state.index.is_empty());
        assert_eq!(state.stats.cache_hits, 0);
    }

    #[test]
    fn load_tolerates_corrupt_index() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("index.json");
        fs_err::write(&index_path, b"{broken").unwrap();
        let state = CacheState::load(&index_path, &dir.path().join("stats.json"));
        assert!(state.index.is_empty());
    }
}
