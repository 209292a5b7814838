//! A uniform interface over the external package tools that create and
//! populate virtual environments: `pip`, `uv`, `poetry` and `pdm`.
//!
//! Every operation runs an explicit argument vector (never a shell) with an
//! explicit working directory, environment map and timeout; stdout and
//! stderr are captured with lossy UTF-8 decoding.

use std::fmt;
use std::io;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use gestvenv_platform::PathResolutionError;

pub use crate::capabilities::BackendCapabilities;
pub use crate::process::{CommandOutput, CommandSpec};
pub use crate::registry::{BackendDescriptor, BackendPreference, BackendRegistry};
pub use crate::traits::{Backend, Conflict, InstallOptions, InstallOutcome, InstalledPackage};

pub use crate::pdm::PdmBackend;
pub use crate::pip::PipBackend;
pub use crate::poetry::PoetryBackend;
pub use crate::uv::UvBackend;

mod capabilities;
mod pdm;
mod pip;
mod poetry;
mod process;
mod registry;
mod traits;
mod uv;

/// The package tools the core knows how to drive.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Pip,
    Uv,
    Poetry,
    Pdm,
}

impl BackendKind {
    pub const ALL: [Self; 4] = [Self::Uv, Self::Pdm, Self::Poetry, Self::Pip];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pip => "pip",
            Self::Uv => "uv",
            Self::Poetry => "poetry",
            Self::Pdm => "pdm",
        }
    }

    /// Tie-break rank for selection: lower is preferred.
    pub(crate) fn preference_rank(self) -> u8 {
        match self {
            Self::Uv => 0,
            Self::Pdm => 1,
            Self::Poetry => 2,
            Self::Pip => 3,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pip" => Ok(Self::Pip),
            "uv" => Ok(Self::Uv),
            "poetry" => Ok(Self::Poetry),
            "pdm" => Ok(Self::Pdm),
            other => Err(BackendError::UnknownBackend(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unknown backend `{0}`")]
    UnknownBackend(String),
    #[error("backend `{0}` is not available on this system")]
    NotAvailable(BackendKind),
    #[error("no package backend is available")]
    NoneAvailable,
    #[error("failed to create virtual environment: {stderr}")]
    VenvCreationFailed { stderr: String },
    #[error("`{program}` failed with {code:?}:\n--- stdout:\n{stdout}\n--- stderr:\n{stderr}\n---")]
    ExecutionFailed {
        program: String,
        args: Vec<String>,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("`{program}` did not finish within {seconds}s and was killed")]
    Timeout { program: String, seconds: u64 },
    #[error("could not parse `{program}` output: {message}")]
    OutputParse { program: String, message: String },
    #[error(transparent)]
    Path(#[from] PathResolutionError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BackendError {
    pub(crate) fn from_command_output(spec: &CommandSpec, output: &CommandOutput) -> Self {
        Self::ExecutionFailed {
            program: spec.program_name(),
            args: spec.args_slice().to_vec(),
            code: output.code,
            stdout: output.stdout.trim().to_string(),
            stderr: output.stderr.trim().to_string(),
        }
    }
}
