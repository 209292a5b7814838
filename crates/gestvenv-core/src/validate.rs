//! Input validation: environment names, python versions, deletion safety.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::models::PythonVersion;
use crate::CoreError;

/// First and last characters alphanumeric, middle may add `._-`, total
/// length 2 to 100.
static ENV_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,98}[A-Za-z0-9]$").expect("static pattern compiles")
});

/// Windows device names are rejected on every platform so that records
/// stay portable.
const RESERVED_NAMES: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

pub fn env_name(name: &str) -> Result<(), CoreError> {
    if !ENV_NAME.is_match(name) {
        return Err(CoreError::Validation(format!(
            "environment name `{name}` must be 2-100 characters of [A-Za-z0-9._-] \
             starting and ending alphanumeric"
        )));
    }
    if RESERVED_NAMES.contains(&name.to_lowercase().as_str()) {
        return Err(CoreError::Validation(format!(
            "environment name `{name}` is a reserved device name"
        )));
    }
    Ok(())
}

pub fn python_version(version: &str) -> Result<PythonVersion, CoreError> {
    let parsed: PythonVersion = version.parse()?;
    if !parsed.in_supported_range() {
        return Err(CoreError::Validation(format!(
            "python version `{version}` is outside the supported range {}..={}",
            PythonVersion::FLOOR,
            PythonVersion::CEILING
        )));
    }
    Ok(parsed)
}

/// Paths we refuse to delete no matter what the metadata says.
pub fn safe_to_delete(path: &Path) -> Result<(), CoreError> {
    let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    for root in ["/", "/home", "/usr", "/etc", "/var", "/opt", "/bin"] {
        if resolved == Path::new(root) {
            return Err(CoreError::UnsafeDeletion {
                path: resolved,
                reason: "path is a system root".to_string(),
            });
        }
    }
    if let Some(home) = dirs::home_dir() {
        let documents = home.join("Documents");
        if resolved.starts_with(&documents) {
            return Err(CoreError::UnsafeDeletion {
                path: resolved,
                reason: "path is inside the user's Documents directory".to_string(),
            });
        }
        if resolved == home {
            return Err(CoreError::UnsafeDeletion {
                path: resolved,
                reason: "path is the home directory".to_string(),
            });
        }
    }
    Ok(())
}
