//! Short-lived Python environments with guaranteed teardown.
//!
//! An ephemeral environment is allocated storage, built by a package
//! backend, wrapped in an isolation strategy, constrained by a cgroups v2
//! controller and watched by a monitor; whatever way its scope ends, the
//! lifecycle controller releases every acquired resource, and the cleanup
//! scheduler independently reaps anything a guard failed to release.

use std::io;

use thiserror::Error;

use gestvenv_backend::BackendError;

pub use crate::cgroups::{CgroupController, CgroupError, CgroupHandle, CgroupStats};
pub use crate::cleanup::CleanupStats;
pub use crate::isolation::{AppliedIsolation, IsolationProvider};
pub use crate::manager::{AggregateUsage, EphemeralHandle, EphemeralManager, EphemeralSummary};
pub use crate::models::{
    EphemeralConfig, EphemeralEnvironment, EphemeralRequest, EphemeralStatus, ExecOutcome,
    IsolationLevel, ResourceLimits, ResourceUsage, SecurityMode, StorageBackend,
};
pub use crate::storage::StorageAllocator;

mod cgroups;
mod cleanup;
mod isolation;
mod lifecycle;
mod manager;
mod models;
mod monitor;
mod storage;

#[derive(Debug, Error)]
pub enum EphemeralError {
    #[error("admission refused: {0}")]
    ResourceExhausted(String),
    #[error("ephemeral environment `{0}` was not found")]
    NotFound(String),
    #[error("ephemeral environment `{id}` is not in a runnable state")]
    NotActive { id: String },
    #[error("creation failed: {message}")]
    Creation { message: String },
    #[error("cleanup failed: {message}")]
    Cleanup { message: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Cgroup(#[from] CgroupError),
    #[error(transparent)]
    Io(#[from] io::Error),
}
