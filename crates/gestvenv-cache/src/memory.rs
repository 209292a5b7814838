//! The bounded in-memory hot tier in front of the on-disk cache.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Entries older than this are treated as absent.
const DEFAULT_TTL: Duration = Duration::from_secs(300);
/// Ceiling on bytes held hot at once.
const DEFAULT_CAPACITY_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug)]
struct MemoryEntry {
    bytes: Vec<u8>,
    inserted: Instant,
}

/// `(name, version, platform)` → recently served bytes.
#[derive(Debug)]
pub(crate) struct MemoryTier {
    entries: Mutex<HashMap<(String, String, String), MemoryEntry>>,
    ttl: Duration,
    capacity_bytes: u64,
}

impl MemoryTier {
    pub(crate) fn new() -> Self {
        Self::with_limits(DEFAULT_TTL, DEFAULT_CAPACITY_BYTES)
    }

    pub(crate) fn with_limits(ttl: Duration, capacity_bytes: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            capacity_bytes,
        }
    }

    pub(crate) fn get(&self, package: &str, version: &str, platform: &str) -> Option<Vec<u8>> {
        let key = (
            package.to_lowercase(),
            version.to_string(),
            platform.to_string(),
        );
        let mut entries = self.entries.lock().expect("memory tier lock poisoned");
        match entries.get(&key) {
            Some(entry) if entry.inserted.elapsed() <= self.ttl => Some(entry.bytes.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub(crate) fn admit(&self, package: &str, version: &str, platform: &str, bytes: Vec<u8>) {
        if bytes.len() as u64 > self.capacity_bytes {
            return;
        }
        let key = (
            package.to_lowercase(),
            version.to_string(),
            platform.to_string(),
        );
        let mut entries = self.entries.lock().expect("memory tier lock poisoned");
        entries.insert(
            key,
            MemoryEntry {
                bytes,
                inserted: Instant::now(),
            },
        );
        // Drop oldest entries until the tier fits its byte budget.
        loop {
            let total: u64 = entries.values().map(|entry| entry.bytes.len() as u64).sum();
            if total <= self.capacity_bytes {
                break;
            }
            let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            entries.remove(&oldest);
        }
    }

    pub(crate) fn remove(&self, package: &str, version: &str, platform: &str) {
        let key = (
            package.to_lowercase(),
            version.to_string(),
            platform.to_string(),
        );
        self.entries
            .lock()
            .expect("memory tier lock poisoned")
            .remove(&key);
    }

    /// Drop expired entries; part of `optimize()`.
    pub(crate) fn sweep(&self) {
        let mut entries = self.entries.lock().expect("memory tier lock poisoned");
        entries.retain(|_, entry| entry.inserted.elapsed() <= self.ttl);
    }

    pub(crate) fn clear(&self) {
        self.entries
            .lock()
            .expect("memory tier lock poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_within_ttl() {
        let tier = MemoryTier::new();
        tier.admit("requests", "2.31.0", "linux_x86_64", vec![1, 2, 3]);
        assert_eq!(
            tier.get("Requests", "2.31.0", "linux_x86_64"),
            Some(vec![1, 2, 3])
        );
    }

    #[test]
    fn expired_entries_are_absent() {
        let tier = MemoryTier::with_limits(Duration::ZERO, DEFAULT_CAPACITY_BYTES);
        tier.admit("requests", "2.31.0", "linux_x86_64", vec![1]);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(tier.get("requests", "2.31.0", "linux_x86_64"), None);
    }

    #[test]
    fn capacity_is_bounded() {
        let tier = MemoryTier::with_limits(DEFAULT_TTL, 10);
        tier.admit("a", "1", "linux_x86_64", vec![0; 6]);
        std::thread::sleep(Duration::from_millis(2));
        tier.admit("b", "1", "linux_x86_64", vec![0; 6]);
        // The older entry was displaced to fit the budget.
        assert_eq!(tier.get("a", "1", "linux_x86_64"), None);
        assert!(tier.get("b", "1", "linux_x86_64").is_some());
    }

    #[test]
    fn oversize_values_are_never_admitted() {
        let tier = MemoryTier::with_limits(DEFAULT_TTL, 4);
        tier.admit("big", "1", "linux_x86_64", vec![0; 100]);
        assert_eq!(tier.get("big", "1", "linux_x86_64"), None);
    }
}
