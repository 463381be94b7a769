//! Readiness states, failure classification and outcomes

use crate::error::CacheError;
use crate::models::descriptor::ModelId;
use crate::models::download::DownloadError;
use crate::models::validator::{ArtifactProblem, InvalidReason};
use serde::Serialize;
use std::io;
use std::path::PathBuf;

/// Where the single process-wide acquisition workflow currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReadinessState {
    NotStarted,
    CheckingCache,
    WaitingForExternalActivity,
    Downloading,
    Validating,
    Ready,
    /// `retrying` is set while a recoverable failure is being retried
    Failed { class: FailureClass, retrying: bool },
}

impl ReadinessState {
    /// `Ready`, or a failure that will not be retried
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed { retrying: false, .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::CheckingCache => "checking_cache",
            Self::WaitingForExternalActivity => "waiting_for_external_activity",
            Self::Downloading => "downloading",
            Self::Validating => "validating",
            Self::Ready => "ready",
            Self::Failed { .. } => "failed",
        }
    }
}

impl std::fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Failure classes; they drive retry policy as well as messaging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    DownloadCorrupted,
    ConfigurationMissing,
    TokenizerCorrupted,
    /// Permission or disk space problems; retrying cannot help
    DiskOrPermission,
    Cancelled,
    Generic,
}

impl FailureClass {
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::DiskOrPermission | Self::Cancelled)
    }

    /// Stable category handed to the UI layer
    pub fn category(self) -> &'static str {
        match self {
            Self::DownloadCorrupted | Self::TokenizerCorrupted => "download_interrupted",
            Self::ConfigurationMissing => "files_missing",
            Self::DiskOrPermission => "disk_or_permission",
            Self::Cancelled => "cancelled",
            Self::Generic => "unknown",
        }
    }

    pub fn user_message(self) -> &'static str {
        match self {
            Self::DownloadCorrupted | Self::TokenizerCorrupted => {
                "The model download was interrupted. Please try again."
            }
            Self::ConfigurationMissing => "Some model files are missing.",
            Self::DiskOrPermission => {
                "The model could not be saved. Check free disk space and folder permissions."
            }
            Self::Cancelled => "Model preparation was cancelled.",
            Self::Generic => "The model could not be prepared.",
        }
    }

    /// Classify a validation problem
    pub fn from_problem(problem: &ArtifactProblem) -> Self {
        match problem.reason {
            InvalidReason::Io(kind) if is_disk_or_permission(kind) => Self::DiskOrPermission,
            InvalidReason::Io(_) => Self::Generic,
            InvalidReason::Missing if problem.file == "config.json" => Self::ConfigurationMissing,
            InvalidReason::TooSmall { .. } | InvalidReason::UnparseableJson
                if problem.file.starts_with("tokenizer") =>
            {
                Self::TokenizerCorrupted
            }
            _ => Self::DownloadCorrupted,
        }
    }

    /// Classify a failed transfer
    pub fn from_download(err: &DownloadError) -> Self {
        match err {
            DownloadError::PermissionDenied(_) | DownloadError::StorageFull(_) => {
                Self::DiskOrPermission
            }
            DownloadError::Network(_) | DownloadError::Other(_) => Self::Generic,
        }
    }
}

fn is_disk_or_permission(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::PermissionDenied
            | io::ErrorKind::ReadOnlyFilesystem
            | io::ErrorKind::StorageFull
            | io::ErrorKind::QuotaExceeded
    )
}

/// Terminal failure shared by every waiter of one attempt
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error}")]
pub struct ReadinessFailure {
    pub class: FailureClass,
    pub error: CacheError,
    /// Number of acquisition attempts made
    pub attempts: u32,
}

impl ReadinessFailure {
    pub fn new(class: FailureClass, error: CacheError, attempts: u32) -> Self {
        Self {
            class,
            error,
            attempts,
        }
    }

    pub fn cancelled(attempts: u32) -> Self {
        Self::new(FailureClass::Cancelled, CacheError::Cancelled, attempts)
    }

    pub fn is_cancelled(&self) -> bool {
        self.class == FailureClass::Cancelled
    }
}

/// A model whose artifact set is present, valid and safe to load
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadyModel {
    pub model: ModelId,
    pub path: PathBuf,
}

/// Result every waiter of one attempt receives
pub type Outcome = Result<ReadyModel, ReadinessFailure>;

/// Point-in-time view of the coordinator
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessSnapshot {
    pub generation: u64,
    pub model: Option<ModelId>,
    #[serde(flatten)]
    pub state: ReadinessState,
    pub attempt: u32,
    pub progress: f32,
    pub ready_path: Option<PathBuf>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<ArtifactProblem> for CacheError {
    fn from(problem: ArtifactProblem) -> Self {
        match problem.reason {
            InvalidReason::Missing => CacheError::Incomplete { file: problem.file },
            InvalidReason::TooSmall { .. } | InvalidReason::UnparseableJson => {
                CacheError::Corrupted {
                    file: problem.file,
                    reason: problem.reason,
                }
            }
            InvalidReason::Io(kind)
                if matches!(
                    kind,
                    io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem
                ) =>
            {
                CacheError::PermissionDenied { path: problem.file }
            }
            InvalidReason::Io(io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded) => {
                CacheError::StorageFull
            }
            InvalidReason::Io(kind) => CacheError::Io {
                message: format!("{}: {}", problem.file, kind),
            },
        }
    }
}

impl From<DownloadError> for CacheError {
    fn from(err: DownloadError) -> Self {
        match err {
            DownloadError::PermissionDenied(path) => CacheError::PermissionDenied { path },
            DownloadError::StorageFull(_) => CacheError::StorageFull,
            other => CacheError::Download {
                message: other.to_string(),
            },
        }
    }
}
