//! Detection of downloads running outside this process
//!
//! A user may start a hub download by hand (`huggingface-cli download ...`)
//! while the warden is checking the same cache. Either of two signals marks
//! such activity:
//!
//! - a fresh lock file: the warden's own sentinel `<lock_dir>/<model-id>.lock`,
//!   or a `*.lock` file under `<root>/.locks/<model-dir>/` left by the hub client
//! - a running process whose command line names a known download tool and the
//!   model's repository
//!
//! Results are cached per model for a short TTL so a waiting coordinator can
//! poll without rescanning the process table every time.

use super::descriptor::{ModelDescriptor, ModelId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

// ============================================================================
// Trait Definitions
// ============================================================================

/// Source of running process command lines
pub trait ProcessProbe: Send + Sync {
    /// Full command line of every running process
    fn command_lines(&self) -> std::io::Result<Vec<String>>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Reads the process table through `ps`
#[derive(Debug, Default)]
pub struct SystemProcessProbe;

impl ProcessProbe for SystemProcessProbe {
    fn command_lines(&self) -> std::io::Result<Vec<String>> {
        let output = Command::new("ps").args(["-A", "-o", "command="]).output()?;

        if !output.status.success() {
            return Err(std::io::Error::other(format!(
                "ps exited with {}",
                output.status
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }
}

// ============================================================================
// Detector
// ============================================================================

/// Detector settings
#[derive(Debug, Clone)]
pub struct ExternalActivityConfig {
    /// Directory holding per-model sentinel lock files
    pub lock_dir: PathBuf,
    /// Cache roots whose `.locks` directories are inspected
    pub cache_roots: Vec<PathBuf>,
    /// How long a detection result is reused
    pub ttl: Duration,
    /// Lock files older than this are leftovers and ignored
    pub stale_lock_after: Duration,
    /// Command line fragments identifying a download tool
    pub acquisition_signatures: Vec<String>,
}

impl Default for ExternalActivityConfig {
    fn default() -> Self {
        Self {
            lock_dir: default_lock_dir(),
            cache_roots: super::locator::default_cache_roots(),
            ttl: Duration::from_secs(2),
            stale_lock_after: Duration::from_secs(600),
            acquisition_signatures: default_acquisition_signatures(),
        }
    }
}

pub fn default_lock_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("model-warden")
        .join("locks")
}

pub fn default_acquisition_signatures() -> Vec<String> {
    vec![
        "huggingface-cli download".to_string(),
        "hf download".to_string(),
        "hf_transfer".to_string(),
    ]
}

/// Which signal reported external activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivitySource {
    LockFile(PathBuf),
    Process(String),
}

/// Cached detection result for one model
#[derive(Debug, Clone, Copy)]
pub struct ExternalActivitySignal {
    pub active: bool,
    pub checked_at: Instant,
}

/// Detects acquisition running outside this process
pub struct ExternalActivityDetector {
    config: ExternalActivityConfig,
    probe: Arc<dyn ProcessProbe>,
    cache: Mutex<HashMap<ModelId, ExternalActivitySignal>>,
}

impl ExternalActivityDetector {
    pub fn new(config: ExternalActivityConfig, probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            config,
            probe,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Detector reading the real process table
    pub fn with_system_probe(config: ExternalActivityConfig) -> Self {
        Self::new(config, Arc::new(SystemProcessProbe))
    }

    pub fn config(&self) -> &ExternalActivityConfig {
        &self.config
    }

    /// Sentinel lock file scoped to one model
    pub fn lock_marker_path(&self, descriptor: &ModelDescriptor) -> PathBuf {
        self.config
            .lock_dir
            .join(format!("{}.lock", descriptor.id.as_str()))
    }

    /// Whether an external acquisition is populating this model's cache
    ///
    /// No signal within the TTL window means "not active"; ambiguity never
    /// blocks the caller.
    pub fn is_external_acquisition_active(&self, descriptor: &ModelDescriptor) -> bool {
        if let Some(signal) = self.cached(descriptor.id) {
            return signal.active;
        }

        let source = self.detect(descriptor);
        let active = source.is_some();

        if let Some(source) = source {
            tracing::info!(model = %descriptor.id, source = ?source, "External acquisition detected");
        }

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                descriptor.id,
                ExternalActivitySignal {
                    active,
                    checked_at: Instant::now(),
                },
            );

        active
    }

    fn cached(&self, id: ModelId) -> Option<ExternalActivitySignal> {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache
            .get(&id)
            .filter(|signal| signal.checked_at.elapsed() < self.config.ttl)
            .copied()
    }

    /// Drop all cached results
    pub fn invalidate(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Uncached detection, reporting the first signal found
    pub fn detect(&self, descriptor: &ModelDescriptor) -> Option<ActivitySource> {
        if let Some(lock) = self.find_fresh_lock(descriptor) {
            return Some(ActivitySource::LockFile(lock));
        }

        self.find_process(descriptor).map(ActivitySource::Process)
    }

    fn find_fresh_lock(&self, descriptor: &ModelDescriptor) -> Option<PathBuf> {
        let sentinel = self.lock_marker_path(descriptor);
        if self.is_fresh_lock(&sentinel) {
            return Some(sentinel);
        }

        for root in &self.config.cache_roots {
            let hub_locks = root.join(".locks").join(descriptor.cache_dir_name);
            let Ok(entries) = std::fs::read_dir(&hub_locks) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "lock") && self.is_fresh_lock(&path) {
                    return Some(path);
                }
            }
        }

        None
    }

    fn is_fresh_lock(&self, path: &Path) -> bool {
        let Ok(metadata) = std::fs::metadata(path) else {
            return false;
        };
        if !metadata.is_file() {
            return false;
        }

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .unwrap_or_default();

        if age > self.config.stale_lock_after {
            tracing::debug!(path = ?path, age_secs = age.as_secs(), "Ignoring stale lock file");
            return false;
        }

        true
    }

    fn find_process(&self, descriptor: &ModelDescriptor) -> Option<String> {
        let lines = match self.probe.command_lines() {
            Ok(lines) => lines,
            Err(e) => {
                tracing::debug!(error = %e, "Process scan failed, assuming no external download");
                return None;
            }
        };

        lines.into_iter().find(|line| {
            line.contains(descriptor.repo_id)
                && self
                    .config
                    .acquisition_signatures
                    .iter()
                    .any(|signature| line.contains(signature.as_str()))
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Probe returning a fixed, mutable process list
    #[derive(Default)]
    pub(crate) struct FakeProbe {
        pub(crate) lines: Mutex<Vec<String>>,
        pub(crate) calls: AtomicUsize,
        pub(crate) fail: bool,
    }

    impl FakeProbe {
        pub(crate) fn set(&self, lines: Vec<&str>) {
            *self.lines.lock().unwrap() = lines.into_iter().map(String::from).collect();
        }
    }

    impl ProcessProbe for FakeProbe {
        fn command_lines(&self) -> std::io::Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(std::io::Error::other("no ps"));
            }
            Ok(self.lines.lock().unwrap().clone())
        }
    }

    pub(crate) fn test_config(lock_dir: &Path, roots: Vec<PathBuf>) -> ExternalActivityConfig {
        ExternalActivityConfig {
            lock_dir: lock_dir.to_path_buf(),
            cache_roots: roots,
            ttl: Duration::from_secs(2),
            stale_lock_after: Duration::from_secs(600),
            acquisition_signatures: default_acquisition_signatures(),
        }
    }

    fn qwen() -> &'static ModelDescriptor {
        ModelId::Qwen3_0_6B.descriptor()
    }

    #[test]
    fn test_no_signals_means_inactive() {
        let locks = TempDir::new().unwrap();
        let probe = Arc::new(FakeProbe::default());
        let detector = ExternalActivityDetector::new(test_config(locks.path(), vec![]), probe);

        assert!(!detector.is_external_acquisition_active(qwen()));
    }

    #[test]
    fn test_sentinel_lock_is_detected() {
        let locks = TempDir::new().unwrap();
        let probe = Arc::new(FakeProbe::default());
        let detector = ExternalActivityDetector::new(test_config(locks.path(), vec![]), probe);
        std::fs::write(detector.lock_marker_path(qwen()), b"").unwrap();

        assert_eq!(
            detector.detect(qwen()),
            Some(ActivitySource::LockFile(locks.path().join("qwen3-0.6b.lock")))
        );
        assert!(!detector.is_external_acquisition_active(ModelId::Gemma3_1B.descriptor()));
    }

    #[test]
    fn test_hub_lock_dir_is_detected() {
        let locks = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let hub_locks = root.path().join(".locks").join(qwen().cache_dir_name);
        std::fs::create_dir_all(&hub_locks).unwrap();
        std::fs::write(hub_locks.join("0123abcd.lock"), b"").unwrap();

        let detector = ExternalActivityDetector::new(
            test_config(locks.path(), vec![root.path().to_path_buf()]),
            Arc::new(FakeProbe::default()),
        );
        assert!(detector.is_external_acquisition_active(qwen()));
    }

    #[test]
    fn test_stale_lock_is_ignored() {
        let locks = TempDir::new().unwrap();
        let mut config = test_config(locks.path(), vec![]);
        config.stale_lock_after = Duration::ZERO;
        let detector = ExternalActivityDetector::new(config, Arc::new(FakeProbe::default()));
        std::fs::write(detector.lock_marker_path(qwen()), b"").unwrap();
        std::thread::sleep(Duration::from_millis(10));

        assert!(detector.detect(qwen()).is_none());
    }

    #[test]
    fn test_matching_process_is_detected() {
        let locks = TempDir::new().unwrap();
        let probe = Arc::new(FakeProbe::default());
        probe.set(vec![
            "/usr/bin/zsh",
            "/usr/local/bin/python3 /usr/local/bin/huggingface-cli download mlx-community/Qwen3-0.6B-4bit",
        ]);
        let detector =
            ExternalActivityDetector::new(test_config(locks.path(), vec![]), probe.clone());

        assert!(matches!(detector.detect(qwen()), Some(ActivitySource::Process(_))));
        assert!(detector.detect(ModelId::Gemma3_1B.descriptor()).is_none());
    }

    #[test]
    fn test_process_without_signature_is_ignored() {
        let locks = TempDir::new().unwrap();
        let probe = Arc::new(FakeProbe::default());
        probe.set(vec!["vim notes-about-mlx-community/Qwen3-0.6B-4bit.md"]);
        let detector = ExternalActivityDetector::new(test_config(locks.path(), vec![]), probe);

        assert!(!detector.is_external_acquisition_active(qwen()));
    }

    #[test]
    fn test_probe_failure_means_inactive() {
        let locks = TempDir::new().unwrap();
        let probe = Arc::new(FakeProbe {
            fail: true,
            ..Default::default()
        });
        let detector = ExternalActivityDetector::new(test_config(locks.path(), vec![]), probe);

        assert!(!detector.is_external_acquisition_active(qwen()));
    }

    #[test]
    fn test_result_is_cached_within_ttl() {
        let locks = TempDir::new().unwrap();
        let probe = Arc::new(FakeProbe::default());
        let detector =
            ExternalActivityDetector::new(test_config(locks.path(), vec![]), probe.clone());

        assert!(!detector.is_external_acquisition_active(qwen()));
        probe.set(vec!["hf download mlx-community/Qwen3-0.6B-4bit"]);
        assert!(!detector.is_external_acquisition_active(qwen()));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        detector.invalidate();
        assert!(detector.is_external_acquisition_active(qwen()));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cache_expires_after_ttl() {
        let locks = TempDir::new().unwrap();
        let probe = Arc::new(FakeProbe::default());
        let mut config = test_config(locks.path(), vec![]);
        config.ttl = Duration::from_millis(10);
        let detector = ExternalActivityDetector::new(config, probe.clone());

        assert!(!detector.is_external_acquisition_active(qwen()));
        probe.set(vec!["hf download mlx-community/Qwen3-0.6B-4bit"]);
        std::thread::sleep(Duration::from_millis(25));
        assert!(detector.is_external_acquisition_active(qwen()));
    }

    #[test]
    fn test_system_probe_lists_processes() {
        // ps is present on every supported platform; tolerate sandboxes without it
        if let Ok(lines) = SystemProcessProbe.command_lines() {
            assert!(!lines.is_empty());
        }
    }
}
