use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{PathResolutionError, METADATA_FILE_NAME, PYVENV_CFG};

/// The two virtualenv layout families.
///
/// Unix-likes expose a `bin/` directory with bare executable names; Windows
/// exposes `Scripts/` with `.exe` suffixes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Unix,
    Windows,
}

impl OsFamily {
    /// The family of the host we are running on.
    pub fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Unix
        }
    }

    fn scripts_dir(self) -> &'static str {
        match self {
            Self::Unix => "bin",
            Self::Windows => "Scripts",
        }
    }

    fn executable(self, name: &str) -> String {
        match self {
            Self::Unix => name.to_string(),
            Self::Windows => format!("{name}.exe"),
        }
    }

    fn activate_script(self) -> &'static str {
        match self {
            Self::Unix => "activate",
            Self::Windows => "activate.bat",
        }
    }
}

/// Absolute paths inside a virtual environment, resolved for one OS family.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VenvLayout {
    root: PathBuf,
    family: OsFamily,
}

impl VenvLayout {
    /// Layout of the venv at `root` for the host platform.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_family(root, OsFamily::current())
    }

    pub fn with_family(root: impl Into<PathBuf>, family: OsFamily) -> Self {
        Self {
            root: root.into(),
            family,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn family(&self) -> OsFamily {
        self.family
    }

    /// The directory holding executables, `bin` or `Scripts`.
    pub fn scripts_dir(&self) -> PathBuf {
        self.root.join(self.family.scripts_dir())
    }

    /// The python interpreter inside the venv.
    pub fn python(&self) -> PathBuf {
        self.scripts_dir().join(self.family.executable("python"))
    }

    /// The package installer inside the venv (`pip` unless told otherwise).
    pub fn installer(&self, name: &str) -> PathBuf {
        self.scripts_dir().join(self.family.executable(name))
    }

    /// The shell activation script.
    pub fn activate(&self) -> PathBuf {
        self.scripts_dir().join(self.family.activate_script())
    }

    /// The `pyvenv.cfg` a backend writes at venv creation.
    pub fn pyvenv_cfg(&self) -> PathBuf {
        self.root.join(PYVENV_CFG)
    }

    /// The metadata record owned by the core.
    pub fn metadata_file(&self) -> PathBuf {
        self.root.join(METADATA_FILE_NAME)
    }

    /// Whether `root` looks like a virtual environment at all.
    pub fn is_venv(&self) -> bool {
        self.pyvenv_cfg().is_file()
    }

    /// The python interpreter, verified to exist on disk.
    pub fn existing_python(&self) -> Result<PathBuf, PathResolutionError> {
        Self::existing("python interpreter", self.python())
    }

    /// The installer, verified to exist on disk.
    pub fn existing_installer(&self, name: &str) -> Result<PathBuf, PathResolutionError> {
        Self::existing("package installer", self.installer(name))
    }

    /// The activation script, verified to exist on disk.
    pub fn existing_activate(&self) -> Result<PathBuf, PathResolutionError> {
        Self::existing("activation script", self.activate())
    }

    fn existing(kind: &'static str, path: PathBuf) -> Result<PathBuf, PathResolutionError> {
        if path.is_file() {
            Ok(path)
        } else {
            Err(PathResolutionError::Missing { kind, path })
        }
    }
}
