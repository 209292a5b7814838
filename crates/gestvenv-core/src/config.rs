//! The process-wide configuration record.
//!
//! Loaded once at startup; environment variables override matching fields.
//! The record is immutable afterwards; runtime mutations re-emit a new
//! snapshot through the owning container.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use gestvenv_backend::BackendPreference;

use crate::validate;
use crate::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub max_size_mb: u64,
    pub compression: bool,
    pub offline_mode: bool,
    pub path: PathBuf,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_mb: 1000,
            compression: true,
            offline_mode: false,
            path: data_root().join("cache"),
        }
    }
}

/// Plain-data ephemeral settings; the ephemeral runtime maps these onto
/// its own configuration type at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EphemeralSettings {
    pub max_concurrent: usize,
    pub max_total_memory_mb: u64,
    pub max_total_disk_mb: u64,
    /// `disk`, `tmpfs` or `memory`.
    pub storage_backend: String,
    /// Storage root; a backend-specific default applies when unset.
    pub base_storage_path: Option<PathBuf>,
    /// `process`, `namespace`, `container` or `chroot`.
    pub default_isolation: String,
    pub cleanup_interval: u64,
    pub force_cleanup_after: u64,
    pub default_ttl: u64,
    pub default_max_idle: u64,
    pub monitoring_interval: u64,
    pub enable_preallocation: bool,
}

impl Default for EphemeralSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 50,
            max_total_memory_mb: 8192,
            max_total_disk_mb: 20480,
            storage_backend: "tmpfs".to_string(),
            base_storage_path: None,
            default_isolation: "process".to_string(),
            cleanup_interval: 60,
            force_cleanup_after: 7200,
            default_ttl: 3600,
            default_max_idle: 300,
            monitoring_interval: 5,
            enable_preallocation: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GestvenvConfig {
    pub default_python_version: String,
    /// `auto` or a backend name; consumed by registry selection.
    pub preferred_backend: String,
    pub environments_path: PathBuf,
    pub cache: CacheSettings,
    pub ephemeral: EphemeralSettings,
}

impl Default for GestvenvConfig {
    fn default() -> Self {
        Self {
            default_python_version: "3.11".to_string(),
            preferred_backend: "auto".to_string(),
            environments_path: data_root().join("environments"),
            cache: CacheSettings::default(),
            ephemeral: EphemeralSettings::default(),
        }
    }
}

fn data_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".gestvenv")
}

/// `true|1|yes|on`, case-insensitive.
pub(crate) fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

impl GestvenvConfig {
    /// Default configuration with environment-variable overrides applied.
    pub fn from_env() -> Result<Self, CoreError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validated()
    }

    /// Apply the `GESTVENV_*` overrides recognized at startup.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(backend) = std::env::var("GESTVENV_BACKEND") {
            self.preferred_backend = backend;
        }
        if let Ok(version) = std::env::var("GESTVENV_PYTHON_VERSION") {
            self.default_python_version = version;
        }
        if let Ok(enabled) = std::env::var("GESTVENV_CACHE_ENABLED") {
            self.cache.enabled = parse_bool(&enabled);
        }
        if let Ok(size) = std::env::var("GESTVENV_CACHE_SIZE_MB") {
            if let Ok(size) = size.parse() {
                self.cache.max_size_mb = size;
            }
        }
        if let Ok(offline) = std::env::var("GESTVENV_OFFLINE_MODE") {
            self.cache.offline_mode = parse_bool(&offline);
        }
        if let Ok(path) = std::env::var("GESTVENV_ENVIRONMENTS_PATH") {
            self.environments_path = PathBuf::from(path);
        }
    }

    /// Check field invariants, consuming and returning the record.
    pub fn validated(self) -> Result<Self, CoreError> {
        validate::python_version(&self.default_python_version)?;
        self.preferred_backend
            .parse::<BackendPreference>()
            .map_err(|err| CoreError::Validation(err.to_string()))?;
        if self.cache.max_size_mb == 0 {
            return Err(CoreError::Validation(
                "cache.max_size_mb must be positive".to_string(),
            ));
        }
        if self.ephemeral.max_concurrent == 0 {
            return Err(CoreError::Validation(
                "ephemeral.max_concurrent must be positive".to_string(),
            ));
        }
        Ok(self)
    }

    pub fn backend_preference(&self) -> BackendPreference {
        self.preferred_backend
            .parse()
            .unwrap_or(BackendPreference::Auto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        GestvenvConfig::default().validated().unwrap();
    }

    #[test]
    fn boolean_parsing() {
        for yes in ["true", "1", "yes", "on", "TRUE", "Yes", "ON"] {
            assert!(parse_bool(yes), "{yes} should parse true");
        }
        for no in ["false", "0", "no", "off", "maybe", ""] {
            assert!(!parse_bool(no), "{no} should parse false");
        }
    }

    #[test]
    fn version_bounds_are_enforced() {
        let mut config = GestvenvConfig::default();
        config.default_python_version = "3.8".to_string();
        assert!(config.validated().is_err());

        let mut config = GestvenvConfig::default();
        config.default_python_version = "3.21".to_string();
        assert!(config.validated().is_err());

        let mut config = GestvenvConfig::default();
        config.default_python_version = "3.20".to_string();
        assert!(config.validated().is_ok());
    }

    #[test]
    fn bad_backend_preference_is_rejected() {
        let mut config = GestvenvConfig::default();
        config.preferred_backend = "mamba".to_string();
        assert!(config.validated().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var("GESTVENV_PYTHON_VERSION", "3.12");
        std::env::set_var("GESTVENV_OFFLINE_MODE", "yes");
        std::env::set_var("GESTVENV_CACHE_SIZE_MB", "123");
        let mut config = GestvenvConfig::default();
        config.apply_env_overrides();
        std::env::remove_var("GESTVENV_PYTHON_VERSION");
        std::env::remove_var("GESTVENV_OFFLINE_MODE");
        std::env::remove_var("GESTVENV_CACHE_SIZE_MB");

        assert_eq!(config.default_python_version, "3.12");
        assert!(config.cache.offline_mode);
        assert_eq!(config.cache.max_size_mb, 123);
    }
}
