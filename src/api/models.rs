//! API request and response models

use crate::error::CacheError;
use crate::models::descriptor::{ModelDescriptor, ModelId};
use crate::models::locator::{CacheLocator, SnapshotLayout, directory_size};
use crate::models::validator::{self, ValidationResult};
use crate::readiness::{ReadinessSnapshot, ReadyModel};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Cache status of one catalog model
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: ModelId,
    pub name: String,
    pub repo_id: String,
    /// A candidate directory exists and validates
    pub cached: bool,
    pub path: Option<PathBuf>,
    pub snapshot: Option<String>,
    pub layout: Option<SnapshotLayout>,
    pub size_bytes: Option<u64>,
    /// Why the model is not cached: nothing found, or the first validation
    /// problem of the best candidate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
}

impl ModelInfo {
    /// Inspect the cache for `descriptor`; performs blocking filesystem I/O
    pub fn inspect(locator: &CacheLocator, descriptor: &ModelDescriptor) -> Self {
        let mut info = Self {
            id: descriptor.id,
            name: descriptor.name.to_string(),
            repo_id: descriptor.repo_id.to_string(),
            cached: false,
            path: None,
            snapshot: None,
            layout: None,
            size_bytes: None,
            problem: None,
        };

        let candidates = locator.locate_all(descriptor);
        let mut first_problem = None;

        for resolved in &candidates {
            match validator::validate(&resolved.snapshot_dir, descriptor.required_files) {
                ValidationResult::Complete => {
                    info.cached = true;
                    info.path = Some(resolved.snapshot_dir.clone());
                    info.snapshot = Some(resolved.snapshot_id.clone());
                    info.layout = Some(resolved.layout);
                    info.size_bytes = Some(directory_size(&resolved.model_dir));
                    return info;
                }
                ValidationResult::Incomplete(problem) => {
                    if first_problem.is_none() {
                        first_problem = Some(format!("{}: {}", problem.file, problem.reason));
                    }
                }
            }
        }

        match candidates.first() {
            Some(resolved) => {
                info.path = Some(resolved.snapshot_dir.clone());
                info.snapshot = Some(resolved.snapshot_id.clone());
                info.layout = Some(resolved.layout);
                info.size_bytes = Some(directory_size(&resolved.model_dir));
                info.problem = first_problem;
            }
            None => {
                let missing = CacheError::NotFound(descriptor.repo_id.to_string());
                info.problem = Some(missing.to_string());
            }
        }
        info
    }
}

/// GET /readiness response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    /// Debounced existence check of the active model
    pub ready_now: bool,
    #[serde(flatten)]
    pub snapshot: ReadinessSnapshot,
}

/// Query parameters for POST /readiness/wait
#[derive(Debug, Default, Deserialize)]
pub struct WaitParams {
    /// Give up after this many seconds and report the current state
    pub timeout_secs: Option<u64>,
}

/// POST /readiness/wait response when the wait timed out
#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub pending: bool,
    pub snapshot: ReadinessSnapshot,
}

/// POST /models/{model}/ensure response
#[derive(Debug, Serialize)]
pub struct EnsureResponse {
    pub model: ModelId,
    pub path: PathBuf,
    pub ready: bool,
}

impl From<ReadyModel> for EnsureResponse {
    fn from(ready: ReadyModel) -> Self {
        Self {
            model: ready.model,
            path: ready.path,
            ready: true,
        }
    }
}
