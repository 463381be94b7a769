//! Configuration structures and loading logic

use crate::models::descriptor::ModelId;
use crate::models::external::{
    ExternalActivityConfig, default_acquisition_signatures, default_lock_dir,
};
use crate::models::locator::{LocatorConfig, default_cache_roots};
use crate::readiness::CoordinatorConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main warden configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WardenConfig {
    pub api_port: u16,
    pub default_model: ModelId,

    /// Cache roots in priority order; empty means the hub defaults
    pub cache_roots: Vec<PathBuf>,
    /// Where new downloads go; defaults to the first cache root
    pub download_dir: Option<PathBuf>,
    /// Directory for per-model sentinel lock files
    pub lock_dir: Option<PathBuf>,
    /// Accept flat `<root>/<model-id>/` directories
    pub allow_legacy_layout: bool,
    pub nested_search_depth: usize,
    pub root_cache_ttl_secs: u64,

    pub external_activity_ttl_ms: u64,
    pub stale_lock_secs: u64,
    pub acquisition_signatures: Vec<String>,

    pub ready_debounce_ms: u64,
    pub external_poll_interval_ms: u64,
    pub external_wait_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            default_model: ModelId::Qwen3_0_6B,
            cache_roots: Vec::new(),
            download_dir: None,
            lock_dir: None,
            allow_legacy_layout: false,
            nested_search_depth: default_nested_search_depth(),
            root_cache_ttl_secs: default_root_cache_ttl(),
            external_activity_ttl_ms: default_external_activity_ttl(),
            stale_lock_secs: default_stale_lock(),
            acquisition_signatures: default_acquisition_signatures(),
            ready_debounce_ms: default_ready_debounce(),
            external_poll_interval_ms: default_external_poll_interval(),
            external_wait_timeout_secs: default_external_wait_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl WardenConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(port) = std::env::var("MODEL_WARDEN_API_PORT") {
            config.api_port = port.parse().context("Invalid MODEL_WARDEN_API_PORT value")?;
        }
        if let Ok(model) = std::env::var("MODEL_WARDEN_DEFAULT_MODEL") {
            config.default_model = model
                .parse()
                .context("Invalid MODEL_WARDEN_DEFAULT_MODEL value")?;
        }
        if let Ok(cache_dir) = std::env::var("MODEL_WARDEN_CACHE_DIR") {
            config.cache_roots = vec![PathBuf::from(cache_dir)];
        }
        if let Ok(lock_dir) = std::env::var("MODEL_WARDEN_LOCK_DIR") {
            config.lock_dir = Some(PathBuf::from(lock_dir));
        }
        if let Ok(retries) = std::env::var("MODEL_WARDEN_MAX_RETRIES") {
            config.max_retries = retries
                .parse()
                .context("Invalid MODEL_WARDEN_MAX_RETRIES value")?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_port < 1024 {
            anyhow::bail!("API port must be >= 1024 (got {})", self.api_port);
        }
        if self.external_poll_interval_ms == 0 {
            anyhow::bail!("external_poll_interval_ms must be greater than 0");
        }
        if self.max_retries > 10 {
            anyhow::bail!("max_retries must be <= 10 (got {})", self.max_retries);
        }
        if self.nested_search_depth > 8 {
            anyhow::bail!(
                "nested_search_depth must be <= 8 (got {})",
                self.nested_search_depth
            );
        }
        if self.acquisition_signatures.iter().any(|s| s.trim().is_empty()) {
            anyhow::bail!("acquisition_signatures cannot contain empty entries");
        }
        for root in &self.cache_roots {
            if root.as_os_str().is_empty() {
                anyhow::bail!("cache_roots cannot contain empty paths");
            }
        }
        if self
            .download_dir
            .as_ref()
            .is_some_and(|dir| dir.as_os_str().is_empty())
        {
            anyhow::bail!("download_dir cannot be empty");
        }

        Ok(())
    }

    fn configured_roots(&self) -> Vec<PathBuf> {
        if self.cache_roots.is_empty() {
            default_cache_roots()
        } else {
            self.cache_roots.clone()
        }
    }

    /// Configured cache roots, or the hub defaults, plus the download directory
    ///
    /// A model downloaded into `download_dir` must be found again by the
    /// locator and cleaned by the janitor, so it is always searched.
    pub fn resolved_cache_roots(&self) -> Vec<PathBuf> {
        let mut roots = self.configured_roots();
        if let Some(dir) = &self.download_dir
            && !roots.contains(dir)
        {
            roots.push(dir.clone());
        }
        roots
    }

    /// Directory new downloads are written into
    pub fn resolved_download_dir(&self) -> Option<PathBuf> {
        self.download_dir
            .clone()
            .or_else(|| self.configured_roots().into_iter().next())
    }

    pub fn locator_config(&self) -> LocatorConfig {
        LocatorConfig {
            cache_roots: self.resolved_cache_roots(),
            root_cache_ttl: Duration::from_secs(self.root_cache_ttl_secs),
            nested_search_depth: self.nested_search_depth,
            allow_legacy_layout: self.allow_legacy_layout,
        }
    }

    pub fn external_config(&self) -> ExternalActivityConfig {
        ExternalActivityConfig {
            lock_dir: self.lock_dir.clone().unwrap_or_else(default_lock_dir),
            cache_roots: self.resolved_cache_roots(),
            ttl: Duration::from_millis(self.external_activity_ttl_ms),
            stale_lock_after: Duration::from_secs(self.stale_lock_secs),
            acquisition_signatures: self.acquisition_signatures.clone(),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            default_model: self.default_model,
            ready_debounce: Duration::from_millis(self.ready_debounce_ms),
            external_poll_interval: Duration::from_millis(self.external_poll_interval_ms),
            external_wait_timeout: Duration::from_secs(self.external_wait_timeout_secs),
            max_retries: self.max_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

// Default functions
fn default_api_port() -> u16 {
    9100
}
fn default_nested_search_depth() -> usize {
    3
}
fn default_root_cache_ttl() -> u64 {
    30
}
fn default_external_activity_ttl() -> u64 {
    2000
}
fn default_stale_lock() -> u64 {
    600
}
fn default_ready_debounce() -> u64 {
    1500
}
fn default_external_poll_interval() -> u64 {
    2000
}
fn default_external_wait_timeout() -> u64 {
    300
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_backoff() -> u64 {
    500
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = WardenConfig::default();
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.default_model, ModelId::Qwen3_0_6B);
        assert_eq!(config.max_retries, 2);
        assert!(!config.allow_legacy_layout);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_port_validation() {
        let config = WardenConfig {
            api_port: 500, // Below 1024
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let config = WardenConfig {
            external_poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_download_dir_outside_roots_is_searched() {
        let config = WardenConfig {
            cache_roots: vec![PathBuf::from("/srv/hub")],
            download_dir: Some(PathBuf::from("/data/models")),
            ..Default::default()
        };

        let expected = vec![PathBuf::from("/srv/hub"), PathBuf::from("/data/models")];
        assert_eq!(config.resolved_cache_roots(), expected);
        assert_eq!(config.locator_config().cache_roots, expected);
        assert_eq!(config.external_config().cache_roots, expected);
        assert_eq!(config.resolved_download_dir(), Some(PathBuf::from("/data/models")));
    }

    #[test]
    fn test_download_dir_inside_roots_is_not_duplicated() {
        let config = WardenConfig {
            cache_roots: vec![PathBuf::from("/srv/hub")],
            download_dir: Some(PathBuf::from("/srv/hub")),
            ..Default::default()
        };
        assert_eq!(config.resolved_cache_roots(), vec![PathBuf::from("/srv/hub")]);
    }

    #[test]
    fn test_model_in_download_dir_is_located() {
        let roots = tempfile::TempDir::new().unwrap();
        let downloads = tempfile::TempDir::new().unwrap();
        let config = WardenConfig {
            cache_roots: vec![roots.path().to_path_buf()],
            download_dir: Some(downloads.path().to_path_buf()),
            ..Default::default()
        };
        let descriptor = ModelId::Qwen3_0_6B.descriptor();
        let snapshot = downloads
            .path()
            .join(descriptor.cache_dir_name)
            .join("snapshots/main");
        crate::models::validator::tests::write_valid_artifacts(&snapshot);

        let locator = crate::models::CacheLocator::new(config.locator_config());
        let found = locator.locate_all(descriptor);

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].snapshot_dir, snapshot);
    }

    #[test]
    fn test_empty_download_dir_rejected() {
        let config = WardenConfig {
            download_dir: Some(PathBuf::new()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let config: WardenConfig = toml::from_str(
            r#"
            api_port = 9200
            default_model = "gemma3-1b"
            cache_roots = ["/srv/hub"]
            allow_legacy_layout = true
            max_retries = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.api_port, 9200);
        assert_eq!(config.default_model, ModelId::Gemma3_1B);
        assert_eq!(config.resolved_cache_roots(), vec![PathBuf::from("/srv/hub")]);
        assert_eq!(config.resolved_download_dir(), Some(PathBuf::from("/srv/hub")));
        assert!(config.locator_config().allow_legacy_layout);
        assert_eq!(config.coordinator_config().max_retries, 4);
        // Unset fields keep their defaults
        assert_eq!(config.ready_debounce_ms, 1500);
    }

    #[test]
    fn test_unknown_model_in_toml_fails() {
        let result: std::result::Result<WardenConfig, _> =
            toml::from_str(r#"default_model = "gpt-2""#);
        assert!(result.is_err());
    }

    #[test]
    fn test_durations_convert() {
        let config = WardenConfig::default();
        let coordinator = config.coordinator_config();
        assert_eq!(coordinator.ready_debounce, Duration::from_millis(1500));
        assert_eq!(coordinator.external_wait_timeout, Duration::from_secs(300));
        assert_eq!(config.external_config().ttl, Duration::from_secs(2));
        assert_eq!(config.locator_config().root_cache_ttl, Duration::from_secs(30));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        // SAFETY: serialized with the other env-mutating tests
        unsafe {
            std::env::set_var("MODEL_WARDEN_API_PORT", "9333");
            std::env::set_var("MODEL_WARDEN_DEFAULT_MODEL", "llama3.2-1b");
            std::env::set_var("MODEL_WARDEN_CACHE_DIR", "/tmp/warden-hub");
        }

        let config = WardenConfig::load(None);

        unsafe {
            std::env::remove_var("MODEL_WARDEN_API_PORT");
            std::env::remove_var("MODEL_WARDEN_DEFAULT_MODEL");
            std::env::remove_var("MODEL_WARDEN_CACHE_DIR");
        }

        let config = config.unwrap();
        assert_eq!(config.api_port, 9333);
        assert_eq!(config.default_model, ModelId::Llama3_2_1B);
        assert_eq!(config.cache_roots, vec![PathBuf::from("/tmp/warden-hub")]);
    }

    #[test]
    #[serial]
    fn test_invalid_env_override_fails() {
        unsafe {
            std::env::set_var("MODEL_WARDEN_MAX_RETRIES", "many");
        }
        let result = WardenConfig::load(None);
        unsafe {
            std::env::remove_var("MODEL_WARDEN_MAX_RETRIES");
        }
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.toml");
        std::fs::write(&path, "api_port = 9400\nretry_backoff_ms = 50\n").unwrap();

        let config = WardenConfig::load(Some(path)).unwrap();
        assert_eq!(config.api_port, 9400);
        assert_eq!(
            config.coordinator_config().retry_backoff,
            Duration::from_millis(50)
        );
    }
}
