//! Static capability flags per backend, used by registry scoring and by
//! callers that need to know whether a feature can be dispatched at all.

use serde::{Deserialize, Serialize};

use gestvenv_manifest::SourceKind;

use crate::BackendKind;

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    pub supports_lock_files: bool,
    pub supports_dependency_groups: bool,
    pub supports_parallel_install: bool,
    pub supports_editable_installs: bool,
    pub supports_workspaces: bool,
    pub supports_pyproject_sync: bool,
    pub max_parallel_jobs: u32,
    pub supported_manifest_formats: Vec<SourceKind>,
}

impl BackendCapabilities {
    pub fn for_kind(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Uv => Self {
                supports_lock_files: true,
                supports_dependency_groups: true,
                supports_parallel_install: true,
                supports_editable_installs: true,
                supports_workspaces: true,
                supports_pyproject_sync: true,
                max_parallel_jobs: 8,
                supported_manifest_formats: vec![SourceKind::Pyproject, SourceKind::Requirements],
            },
            BackendKind::Pdm => Self {
                supports_lock_files: true,
                supports_dependency_groups: true,
                supports_parallel_install: false,
                supports_editable_installs: true,
                supports_workspaces: true,
                supports_pyproject_sync: true,
                max_parallel_jobs: 1,
                supported_manifest_formats: vec![SourceKind::Pyproject],
            },
            BackendKind::Poetry => Self {
                supports_lock_files: true,
                supports_dependency_groups: true,
                supports_parallel_install: false,
                supports_editable_installs: true,
                supports_workspaces: false,
                supports_pyproject_sync: false,
                max_parallel_jobs: 1,
                supported_manifest_formats: vec![SourceKind::Pyproject],
            },
            BackendKind::Pip => Self {
                supports_lock_files: false,
                supports_dependency_groups: false,
                supports_parallel_install: false,
                supports_editable_installs: true,
                supports_workspaces: false,
                supports_pyproject_sync: false,
                max_parallel_jobs: 1,
                supported_manifest_formats: vec![SourceKind::Requirements, SourceKind::Pyproject],
            },
        }
    }

    /// The score used by auto-selection. Availability gates separately.
    pub fn performance_score(&self) -> u32 {
        let mut score = 0;
        if self.supports_lock_files {
            score += 3;
        }
        if self.supports_dependency_groups {
            score += 2;
        }
        if self.supports_parallel_install {
            score += 3;
        }
        if self.supports_pyproject_sync {
            score += 1;
        }
        score
    }
}
