//! Download collaborator
//!
//! The coordinator only decides whether a download is needed and validates its
//! result. The transfer itself goes through the [`Downloader`] trait; the
//! production implementation uses the native Rust hf-hub crate and writes into
//! the standard hub cache structure.

use super::descriptor::ModelDescriptor;
use async_trait::async_trait;
use hf_hub::api::tokio::ApiBuilder;
use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Reports fractional progress in `[0, 1]` to whoever is watching
#[derive(Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<f32>>,
}

impl ProgressReporter {
    pub fn new(tx: Arc<watch::Sender<f32>>) -> Self {
        Self { tx }
    }

    /// Reporter whose updates go nowhere
    pub fn detached() -> Self {
        let (tx, _) = watch::channel(0.0);
        Self { tx: Arc::new(tx) }
    }

    pub fn report(&self, fraction: f32) {
        let fraction = fraction.clamp(0.0, 1.0);
        self.tx.send_replace(fraction);
    }

    pub fn current(&self) -> f32 {
        *self.tx.borrow()
    }
}

/// Why a download did not complete
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownloadError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not enough disk space: {0}")]
    StorageFull(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("{0}")]
    Other(String),
}

impl DownloadError {
    /// Classify an arbitrary error by the first I/O error in its source chain
    pub fn classify(err: &(dyn StdError + 'static)) -> Self {
        let message = err.to_string();

        let mut current: Option<&(dyn StdError + 'static)> = Some(err);
        while let Some(e) = current {
            if let Some(io_err) = e.downcast_ref::<io::Error>() {
                return match io_err.kind() {
                    io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
                        Self::PermissionDenied(message)
                    }
                    io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => {
                        Self::StorageFull(message)
                    }
                    io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::NotConnected => Self::Network(message),
                    _ => Self::Other(message),
                };
            }
            current = e.source();
        }

        Self::Other(message)
    }
}

/// Transfers a model's artifact files into the cache
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Download every required file of `descriptor`
    ///
    /// Returns the snapshot directory the files were written into.
    async fn download(
        &self,
        descriptor: &ModelDescriptor,
        progress: ProgressReporter,
    ) -> Result<PathBuf, DownloadError>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Downloads from the Hugging Face Hub using hf-hub
pub struct HfHubDownloader {
    cache_dir: Option<PathBuf>,
}

impl HfHubDownloader {
    /// Downloader writing into `cache_dir`, or the hub default when `None`
    pub fn new(cache_dir: Option<PathBuf>) -> Self {
        Self { cache_dir }
    }
}

#[async_trait]
impl Downloader for HfHubDownloader {
    async fn download(
        &self,
        descriptor: &ModelDescriptor,
        progress: ProgressReporter,
    ) -> Result<PathBuf, DownloadError> {
        tracing::info!(
            model = %descriptor.id,
            repo = %descriptor.repo_id,
            cache_dir = ?self.cache_dir,
            "Starting model download via hf-hub"
        );

        let mut builder = ApiBuilder::new().with_progress(false);
        if let Some(dir) = &self.cache_dir {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                return Err(DownloadError::classify(&e));
            }
            builder = builder.with_cache_dir(dir.clone());
        }
        let api = builder.build().map_err(|e| DownloadError::classify(&e))?;
        let repo = api.model(descriptor.repo_id.to_string());

        let total = descriptor.required_files.len().max(1) as f32;
        let mut snapshot_dir: Option<PathBuf> = None;

        for (index, file) in descriptor.required_files.iter().enumerate() {
            tracing::debug!(model = %descriptor.id, file = %file, "Downloading file");
            let path = repo.get(file).await.map_err(|e| {
                tracing::warn!(model = %descriptor.id, file = %file, error = %e, "File download failed");
                DownloadError::classify(&e)
            })?;

            if snapshot_dir.is_none() {
                snapshot_dir = path.parent().map(|p| p.to_path_buf());
            }
            progress.report((index + 1) as f32 / total);
        }

        snapshot_dir.ok_or_else(|| {
            DownloadError::Other(format!(
                "Model downloaded but snapshot path not found for {}",
                descriptor.repo_id
            ))
        })
    }
}
