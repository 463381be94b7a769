//! Best-effort cache cleanup
//!
//! Every removal is attempted on its own. A file that cannot be removed is
//! logged and reported in the [`CleanupReport`], and the pass moves on.
//! Directories belonging to a model that is being downloaded by an external
//! process are left untouched.

use super::descriptor::{ModelDescriptor, ModelId};
use super::external::ExternalActivityDetector;
use super::locator::resolve_model_dir;
use super::validator::{self, is_marker_name};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A removal that did not succeed
#[derive(Debug, Clone, Serialize)]
pub struct CleanupFailure {
    pub path: PathBuf,
    pub error: String,
}

/// What a cleanup pass did
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<CleanupFailure>,
    /// Left alone because an external download owns them
    pub skipped: Vec<PathBuf>,
}

impl CleanupReport {
    pub fn merge(&mut self, other: CleanupReport) {
        self.removed.extend(other.removed);
        self.failed.extend(other.failed);
        self.skipped.extend(other.skipped);
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn remove(&mut self, path: &Path) {
        match remove_path(path) {
            Ok(true) => {
                tracing::debug!(path = ?path, "Removed");
                self.removed.push(path.to_path_buf());
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(path = ?path, error = %e, "Failed to remove, continuing");
                self.failed.push(CleanupFailure {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                });
            }
        }
    }
}

/// Remove a file, symlink or directory tree; `Ok(false)` if it was already gone
fn remove_path(path: &Path) -> io::Result<bool> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    let result = if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };

    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Removes interrupted downloads and invalid model directories
pub struct CacheJanitor {
    detector: Arc<ExternalActivityDetector>,
}

impl CacheJanitor {
    pub fn new(detector: Arc<ExternalActivityDetector>) -> Self {
        Self { detector }
    }

    /// Remove every interrupted-download marker below `dir`
    pub fn cleanup_markers(&self, dir: &Path) -> CleanupReport {
        let mut report = CleanupReport::default();
        for marker in validator::has_corruption_markers(dir) {
            report.remove(&marker);
        }
        report
    }

    /// Delete the model directory in `root` if it does not validate
    ///
    /// Skipped entirely while an external download is active for the model.
    pub fn cleanup_invalid_model_directories(
        &self,
        root: &Path,
        descriptor: &ModelDescriptor,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();
        let model_dir = root.join(descriptor.cache_dir_name);

        if !model_dir.is_dir() {
            return report;
        }

        if self.detector.is_external_acquisition_active(descriptor) {
            tracing::info!(
                model = %descriptor.id,
                dir = ?model_dir,
                "External download active, leaving model directory alone"
            );
            report.skipped.push(model_dir);
            return report;
        }

        let valid = resolve_model_dir(descriptor, root).is_some_and(|resolved| {
            validator::validate(&resolved.snapshot_dir, descriptor.required_files).is_complete()
        });

        if valid {
            return report;
        }

        tracing::info!(model = %descriptor.id, dir = ?model_dir, "Removing invalid model directory");
        report.remove(&model_dir);
        crate::metrics::record_cleanup(&report);
        report
    }

    /// Clean a whole cache root
    ///
    /// Removes markers everywhere except below models with active external
    /// downloads, then removes invalid directories of every known model.
    pub fn cleanup_all(&self, root: &Path) -> CleanupReport {
        let mut report = CleanupReport::default();

        let protected: Vec<&'static str> = ModelId::ALL
            .iter()
            .map(|id| id.descriptor())
            .filter(|descriptor| root.join(descriptor.cache_dir_name).is_dir())
            .filter(|descriptor| self.detector.is_external_acquisition_active(descriptor))
            .map(|descriptor| descriptor.cache_dir_name)
            .collect();

        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(root = ?root, error = %e, "Cannot read cache root for cleanup");
                report.failed.push(CleanupFailure {
                    path: root.to_path_buf(),
                    error: e.to_string(),
                });
                return report;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let path = entry.path();

            if protected.contains(&name.as_str()) {
                report.skipped.push(path);
                continue;
            }
            // Hub client lock files are not ours to delete
            if name == ".locks" {
                continue;
            }

            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                report.merge(self.cleanup_markers(&path));
            } else if is_marker_name(&name) {
                report.remove(&path);
            }
        }

        for id in ModelId::ALL {
            let descriptor = id.descriptor();
            if protected.contains(&descriptor.cache_dir_name) {
                continue;
            }
            report.merge(self.cleanup_invalid_model_directories(root, descriptor));
        }

        tracing::info!(
            root = ?root,
            removed = report.removed.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Cache cleanup finished"
        );

        report
    }

    /// Remove one invalid required file so the next download refetches it
    ///
    /// Hub snapshots hold symlinks into `blobs/`; the blob is removed as well,
    /// otherwise the hub client would consider the file cached.
    pub fn remove_artifact(&self, snapshot_dir: &Path, file: &str) -> CleanupReport {
        let mut report = CleanupReport::default();
        let path = snapshot_dir.join(file);

        if let Ok(target) = std::fs::read_link(&path) {
            let blob = if target.is_absolute() {
                target
            } else {
                snapshot_dir.join(target)
            };
            report.remove(&blob);
        }

        report.remove(&path);
        crate::metrics::record_cleanup(&report);
        report
    }
}
