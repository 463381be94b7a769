//! Artifact set validation
//!
//! Checks that a snapshot directory holds every required file, that none of
//! them is a zero-length placeholder, and that structured files parse.
//!
//! Weights files are only checked for existence and a non-trivial size. Hashing
//! a multi-gigabyte file on every readiness probe would cost far more than the
//! probe is worth, so integrity beyond that is left to the loader.

use serde::de::IgnoredAny;
use std::io;
use std::path::{Path, PathBuf};

/// Files at or below this size are treated as interrupted-write stubs
pub const MIN_ARTIFACT_BYTES: u64 = 1;

/// Name fragments left behind by interrupted downloads
pub const MARKER_SUBSTRINGS: &[&str] = &["incomplete", "tmp"];

/// How deep the marker scan descends below the directory it was given
const MAX_MARKER_DEPTH: usize = 6;

/// Why a required file was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    Missing,
    TooSmall { size: u64 },
    UnparseableJson,
    Io(io::ErrorKind),
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => write!(f, "missing"),
            Self::TooSmall { size } => write!(f, "too small ({} bytes)", size),
            Self::UnparseableJson => write!(f, "unparseable JSON"),
            Self::Io(kind) => write!(f, "I/O error ({})", kind),
        }
    }
}

/// A required file together with the reason it failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactProblem {
    pub file: String,
    pub reason: InvalidReason,
}

impl ArtifactProblem {
    /// The file exists on disk but its contents are unusable
    pub fn is_corruption(&self) -> bool {
        matches!(
            self.reason,
            InvalidReason::TooSmall { .. } | InvalidReason::UnparseableJson
        )
    }
}

/// Outcome of validating one directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Complete,
    Incomplete(ArtifactProblem),
}

impl ValidationResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }

    pub fn problem(&self) -> Option<&ArtifactProblem> {
        match self {
            Self::Complete => None,
            Self::Incomplete(problem) => Some(problem),
        }
    }
}

/// Validate the required files in `dir`, stopping at the first failure
pub fn validate(dir: &Path, required_files: &[&str]) -> ValidationResult {
    for file in required_files {
        if let Err(reason) = check_file(&dir.join(file)) {
            tracing::debug!(dir = ?dir, file = %file, reason = %reason, "Artifact check failed");
            return ValidationResult::Incomplete(ArtifactProblem {
                file: (*file).to_string(),
                reason,
            });
        }
    }

    ValidationResult::Complete
}

/// Validate every required file and collect all problems
pub fn validate_all(dir: &Path, required_files: &[&str]) -> Vec<ArtifactProblem> {
    required_files
        .iter()
        .filter_map(|file| {
            check_file(&dir.join(file))
                .err()
                .map(|reason| ArtifactProblem {
                    file: (*file).to_string(),
                    reason,
                })
        })
        .collect()
}

/// Existence-only check used by cheap readiness probes
pub fn files_exist(dir: &Path, required_files: &[&str]) -> bool {
    required_files.iter().all(|file| dir.join(file).is_file())
}

fn check_file(path: &Path) -> Result<(), InvalidReason> {
    let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => InvalidReason::Missing,
        kind => InvalidReason::Io(kind),
    })?;

    if !metadata.is_file() {
        return Err(InvalidReason::Missing);
    }

    let size = metadata.len();
    if size <= MIN_ARTIFACT_BYTES {
        return Err(InvalidReason::TooSmall { size });
    }

    if is_structured(path) {
        let bytes = std::fs::read(path).map_err(|e| InvalidReason::Io(e.kind()))?;
        serde_json::from_slice::<IgnoredAny>(&bytes).map_err(|_| InvalidReason::UnparseableJson)?;
    }

    Ok(())
}

fn is_structured(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

/// Whether a file name carries an interrupted-download marker
pub fn is_marker_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    MARKER_SUBSTRINGS.iter().any(|marker| lower.contains(marker))
}

/// Find stray interrupted-download files anywhere below `dir`
///
/// Unlike [`validate`], this looks at every entry, not just required files.
/// Directories are never reported themselves. Symlinks are reported but
/// never followed.
pub fn has_corruption_markers(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    collect_markers(dir, 0, &mut found);
    found.sort();
    found
}

fn collect_markers(dir: &Path, depth: usize, found: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!(dir = ?dir, error = %e, "Cannot scan directory for markers");
            }
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();

        // Markers are files; a directory is searched whatever its name
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            if depth < MAX_MARKER_DEPTH {
                collect_markers(&path, depth + 1, found);
            }
        } else if is_marker_name(&name) {
            found.push(path);
        }
    }
}
