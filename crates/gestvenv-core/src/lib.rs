//! The environment lifecycle engine: long-lived environment creation,
//! activation, synchronization, cloning, deletion and metadata
//! persistence, plus install orchestration through the package cache and
//! the diagnostic pipeline.

pub use crate::config::{CacheSettings, EphemeralSettings, GestvenvConfig};
pub use crate::doctor::{DiagnosticReport, Issue, IssueCategory, IssueLevel};
pub use crate::error::CoreError;
pub use crate::manager::{
    ActivationOutcome, CreateRequest, EnvironmentManager, ExportFormat, ExportPayload, ListFilter,
    SyncOptions, SyncReport,
};
pub use crate::metadata::MetadataStore;
pub use crate::models::{
    EnvironmentInfo, EnvironmentOutcome, HealthStatus, InstallMode, PackageInfo, PythonVersion,
};
pub use crate::packages::{InstallReport, PackageService};

mod config;
mod doctor;
mod error;
mod manager;
mod metadata;
mod models;
mod packages;
#[cfg(test)]
mod test_support;
pub mod validate;
