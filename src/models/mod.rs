//! Model cache management
//!
//! Provides functionality for:
//! - The catalog of supported models and their required artifact files
//! - Locating model directories across hub cache roots
//! - Validating artifact sets and spotting interrupted downloads
//! - Detecting downloads started by other processes
//! - Cleaning up invalid cache entries
//! - Downloading models from the Hugging Face Hub

pub mod descriptor;
pub mod download;
pub mod external;
pub mod janitor;
pub mod locator;
pub mod validator;

pub use descriptor::{ModelDescriptor, ModelId, REQUIRED_FILES, catalog};
pub use download::{DownloadError, Downloader, HfHubDownloader, ProgressReporter};
pub use external::{ExternalActivityConfig, ExternalActivityDetector, ProcessProbe, SystemProcessProbe};
pub use janitor::{CacheJanitor, CleanupReport};
pub use locator::{CacheLocator, LocatorConfig, ResolvedModelDirectory};
pub use validator::{ArtifactProblem, InvalidReason, ValidationResult};
