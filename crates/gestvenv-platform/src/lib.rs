//! Abstractions for the current platform and the on-disk layout of a
//! virtual environment.
//!
//! Nothing outside this crate is allowed to branch on the operating-system
//! family: callers resolve executables, activation scripts and metadata
//! files exclusively through [`VenvLayout`].

use std::path::PathBuf;

use thiserror::Error;

pub use crate::layout::{OsFamily, VenvLayout};
pub use crate::tag::{PlatformTag, PlatformTagError};

mod layout;
mod tag;

/// Name of the metadata file the core writes into every environment root.
pub const METADATA_FILE_NAME: &str = ".gestvenv-metadata.json";

/// Name of the interpreter configuration file a backend writes into a venv.
pub const PYVENV_CFG: &str = "pyvenv.cfg";

#[derive(Debug, Error)]
pub enum PathResolutionError {
    #[error("expected {kind} at `{}` but it does not exist", path.display())]
    Missing { kind: &'static str, path: PathBuf },
}
