//! Model Warden - model artifact cache readiness
//!
//! Decides whether a locally cached model is present, complete and safe to
//! load, triggers at most one acquisition workflow at a time, cleans up
//! interrupted downloads and publishes a single readiness state.

pub mod api;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod readiness;

pub use config::WardenConfig;
pub use error::{ApiError, CacheError, CacheResult};
pub use models::{
    CacheJanitor, CacheLocator, CleanupReport, Downloader, ExternalActivityDetector,
    HfHubDownloader, ModelDescriptor, ModelId,
};
pub use readiness::{
    CoordinatorConfig, FailureClass, Outcome, ReadinessCoordinator, ReadinessFailure,
    ReadinessSnapshot, ReadinessState, ReadyModel,
};
