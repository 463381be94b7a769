//! Cache root discovery and snapshot resolution
//!
//! Hub cache layout:
//! ```text
//! ~/.cache/huggingface/hub/
//! ├── .locks/
//! │   └── models--mlx-community--Qwen3-0.6B-4bit/
//! ├── models--mlx-community--Qwen3-0.6B-4bit/
//! │   ├── blobs/
//! │   ├── refs/
//! │   │   └── main
//! │   └── snapshots/
//! │       └── {revision}/
//! │           ├── config.json
//! │           ├── model.safetensors
//! │           └── tokenizer.json
//! └── ...
//! ```
//!
//! A model directory without a `snapshots` child is never accepted. Flat
//! layouts from older releases are only matched through [`CacheLocator::resolve_legacy`],
//! by exact model id, and only when enabled.

use super::descriptor::ModelDescriptor;
use super::validator;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

/// Snapshot name preferred over any other revision
pub const CANONICAL_SNAPSHOT: &str = "main";

/// Only directories whose names contain one of these are entered by the nested search
pub const NESTED_MARKERS: &[&str] = &["huggingface", "hub", "cache", "models"];

/// How a resolved directory was laid out on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotLayout {
    /// `<root>/<model-dir>/snapshots/<id>/`
    Hub,
    /// `<root>/<model-id>/` holding files directly
    Legacy,
}

/// The concrete directory chosen for a model within one cache root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedModelDirectory {
    pub root: PathBuf,
    /// Top-level model directory (`models--org--name`)
    pub model_dir: PathBuf,
    /// Directory holding the artifact files
    pub snapshot_dir: PathBuf,
    pub snapshot_id: String,
    pub layout: SnapshotLayout,
}

/// Locator settings
#[derive(Debug, Clone)]
pub struct LocatorConfig {
    /// Candidate roots in priority order
    pub cache_roots: Vec<PathBuf>,
    /// How long the root existence check is reused
    pub root_cache_ttl: Duration,
    /// Maximum depth of the nested-layout search
    pub nested_search_depth: usize,
    /// Whether flat legacy directories are considered
    pub allow_legacy_layout: bool,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            cache_roots: default_cache_roots(),
            root_cache_ttl: Duration::from_secs(30),
            nested_search_depth: 3,
            allow_legacy_layout: false,
        }
    }
}

/// Well-known hub cache locations
///
/// Checks in order:
/// 1. `$HF_HUB_CACHE`
/// 2. `$HF_HOME/hub`
/// 3. `$XDG_CACHE_HOME/huggingface/hub`
/// 4. `~/.cache/huggingface/hub`
/// 5. the platform cache dir (`~/Library/Caches/huggingface/hub` on macOS)
pub fn default_cache_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(hub_cache) = std::env::var("HF_HUB_CACHE") {
        roots.push(PathBuf::from(hub_cache));
    }
    if let Ok(hf_home) = std::env::var("HF_HOME") {
        roots.push(PathBuf::from(hf_home).join("hub"));
    }
    if let Ok(xdg_cache) = std::env::var("XDG_CACHE_HOME") {
        roots.push(PathBuf::from(xdg_cache).join("huggingface/hub"));
    }
    if let Some(home) = dirs::home_dir() {
        roots.push(home.join(".cache/huggingface/hub"));
    }
    if let Some(cache) = dirs::cache_dir() {
        roots.push(cache.join("huggingface/hub"));
    }

    dedup_preserving_order(roots)
}

fn dedup_preserving_order(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut unique: Vec<PathBuf> = Vec::with_capacity(paths.len());
    for path in paths {
        if !unique.contains(&path) {
            unique.push(path);
        }
    }
    unique
}

struct CachedRoots {
    checked_at: Instant,
    roots: Vec<PathBuf>,
}

/// Finds cache roots and resolves model directories inside them
pub struct CacheLocator {
    config: LocatorConfig,
    cached: Mutex<Option<CachedRoots>>,
}

impl CacheLocator {
    pub fn new(mut config: LocatorConfig) -> Self {
        config.cache_roots = dedup_preserving_order(config.cache_roots);
        Self {
            config,
            cached: Mutex::new(None),
        }
    }

    /// Locator over an explicit list of roots with default settings
    pub fn with_roots(roots: Vec<PathBuf>) -> Self {
        Self::new(LocatorConfig {
            cache_roots: roots,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &LocatorConfig {
        &self.config
    }

    /// All configured candidates, whether they exist or not
    pub fn candidate_roots(&self) -> &[PathBuf] {
        &self.config.cache_roots
    }

    /// Root that new downloads are written into
    pub fn primary_root(&self) -> Option<&Path> {
        self.config.cache_roots.first().map(PathBuf::as_path)
    }

    /// Existing cache roots in priority order
    ///
    /// The existence check is reused until the TTL runs out.
    pub fn list_cache_roots(&self) -> Vec<PathBuf> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(entry) = cached.as_ref()
            && entry.checked_at.elapsed() < self.config.root_cache_ttl
        {
            return entry.roots.clone();
        }

        let roots: Vec<PathBuf> = self
            .config
            .cache_roots
            .iter()
            .filter(|root| root.is_dir())
            .cloned()
            .collect();

        tracing::debug!(
            candidates = self.config.cache_roots.len(),
            existing = roots.len(),
            "Refreshed cache root list"
        );

        *cached = Some(CachedRoots {
            checked_at: Instant::now(),
            roots: roots.clone(),
        });

        roots
    }

    /// Drop the cached root list so the next call rescans
    pub fn invalidate(&self) {
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Resolve the snapshot directory for `descriptor` directly inside `root`
    pub fn resolve(
        &self,
        descriptor: &ModelDescriptor,
        root: &Path,
    ) -> Option<ResolvedModelDirectory> {
        resolve_model_dir(descriptor, root)
    }

    /// Search nested layouts below `root`, bounded in depth and breadth
    ///
    /// Only non-hidden directories whose names contain one of [`NESTED_MARKERS`]
    /// are entered, and model directories themselves are never descended into.
    pub fn resolve_nested(
        &self,
        descriptor: &ModelDescriptor,
        root: &Path,
    ) -> Option<ResolvedModelDirectory> {
        search_nested(descriptor, root, 1, self.config.nested_search_depth)
    }

    /// Compatibility check for flat directories named by the exact model id
    pub fn resolve_legacy(
        &self,
        descriptor: &ModelDescriptor,
        root: &Path,
    ) -> Option<ResolvedModelDirectory> {
        let dir = root.join(descriptor.id.as_str());
        if !dir.is_dir() || !validator::files_exist(&dir, descriptor.required_files) {
            return None;
        }

        tracing::debug!(model = %descriptor.id, dir = ?dir, "Matched legacy flat layout");

        Some(ResolvedModelDirectory {
            root: root.to_path_buf(),
            model_dir: dir.clone(),
            snapshot_dir: dir,
            snapshot_id: descriptor.id.as_str().to_string(),
            layout: SnapshotLayout::Legacy,
        })
    }

    /// Every candidate directory for `descriptor`, best first
    pub fn locate_all(&self, descriptor: &ModelDescriptor) -> Vec<ResolvedModelDirectory> {
        let mut found: Vec<ResolvedModelDirectory> = Vec::new();

        for root in self.list_cache_roots() {
            let candidates = [
                self.resolve(descriptor, &root),
                self.resolve_nested(descriptor, &root),
                if self.config.allow_legacy_layout {
                    self.resolve_legacy(descriptor, &root)
                } else {
                    None
                },
            ];

            for candidate in candidates.into_iter().flatten() {
                if !found.iter().any(|f| f.snapshot_dir == candidate.snapshot_dir) {
                    found.push(candidate);
                }
            }
        }

        found
    }

    /// First candidate directory for `descriptor`
    pub fn locate(&self, descriptor: &ModelDescriptor) -> Option<ResolvedModelDirectory> {
        self.locate_all(descriptor).into_iter().next()
    }
}

/// Resolve `descriptor` directly inside `root` without consulting any cache
pub fn resolve_model_dir(
    descriptor: &ModelDescriptor,
    root: &Path,
) -> Option<ResolvedModelDirectory> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(root = ?root, error = %e, "Cannot scan cache root");
            return None;
        }
    };

    let mut model_dir = None;
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(root = ?root, error = %e, "Skipping unreadable cache entry");
                continue;
            }
        };

        if entry.file_name().to_string_lossy() == descriptor.cache_dir_name {
            let path = entry.path();
            if path.is_dir() {
                model_dir = Some(path);
            }
            break;
        }
    }

    let model_dir = model_dir?;
    let snapshots_dir = model_dir.join("snapshots");
    if !snapshots_dir.is_dir() {
        tracing::debug!(
            model = %descriptor.id,
            dir = ?model_dir,
            "Model directory has no snapshots, ignoring"
        );
        return None;
    }

    let snapshot_id = pick_snapshot(&model_dir, &snapshots_dir)?;

    Some(ResolvedModelDirectory {
        root: root.to_path_buf(),
        snapshot_dir: snapshots_dir.join(&snapshot_id),
        model_dir,
        snapshot_id,
        layout: SnapshotLayout::Hub,
    })
}

/// A revision must name a single entry directly inside `snapshots/`
fn is_plain_revision(revision: &str) -> bool {
    let mut components = Path::new(revision).components();
    matches!(
        (components.next(), components.next()),
        (Some(std::path::Component::Normal(_)), None)
    ) && !revision.contains(['/', '\\'])
}

/// Choose a snapshot: `main`, then the `refs/main` revision, then the newest
fn pick_snapshot(model_dir: &Path, snapshots_dir: &Path) -> Option<String> {
    if snapshots_dir.join(CANONICAL_SNAPSHOT).is_dir() {
        return Some(CANONICAL_SNAPSHOT.to_string());
    }

    if let Ok(revision) = std::fs::read_to_string(model_dir.join("refs").join(CANONICAL_SNAPSHOT)) {
        let revision = revision.trim();
        if !is_plain_revision(revision) {
            tracing::warn!(model_dir = ?model_dir, revision, "Ignoring malformed refs/main");
        } else if snapshots_dir.join(revision).is_dir() {
            return Some(revision.to_string());
        }
    }

    let entries = match std::fs::read_dir(snapshots_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(dir = ?snapshots_dir, error = %e, "Cannot read snapshots");
            return None;
        }
    };

    entries
        .flatten()
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            if !metadata.is_dir() {
                return None;
            }
            let created = metadata
                .created()
                .or_else(|_| metadata.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            Some((created, entry.file_name().to_string_lossy().to_string()))
        })
        .max()
        .map(|(_, name)| name)
}

fn search_nested(
    descriptor: &ModelDescriptor,
    dir: &Path,
    depth: usize,
    max_depth: usize,
) -> Option<ResolvedModelDirectory> {
    if depth > max_depth {
        return None;
    }

    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if name.starts_with('.') || name.starts_with("models--") {
            continue;
        }
        if !NESTED_MARKERS.iter().any(|marker| name.contains(marker)) {
            continue;
        }
        // file_type does not follow symlinks, which keeps the walk inside this tree
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }

        let path = entry.path();
        if let Some(found) = resolve_model_dir(descriptor, &path) {
            tracing::debug!(model = %descriptor.id, dir = ?path, "Resolved model in nested layout");
            return Some(found);
        }
        if let Some(found) = search_nested(descriptor, &path, depth + 1, max_depth) {
            return Some(found);
        }
    }

    None
}

/// Total size of regular files below `path`; symlinks are not followed
pub fn directory_size(path: &Path) -> u64 {
    let mut size = 0;

    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if metadata.is_dir() {
                size += directory_size(&entry.path());
            } else if metadata.is_file() {
                size += metadata.len();
            }
        }
    }

    size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::descriptor::ModelId;
    use crate::models::validator::tests::write_valid_artifacts;
    use tempfile::TempDir;

    fn qwen() -> &'static ModelDescriptor {
        ModelId::Qwen3_0_6B.descriptor()
    }

    fn model_dir(root: &Path) -> PathBuf {
        root.join(qwen().cache_dir_name)
    }

    #[test]
    fn test_resolve_empty_root() {
        let root = TempDir::new().unwrap();
        let locator = CacheLocator::with_roots(vec![root.path().to_path_buf()]);
        assert!(locator.resolve(qwen(), root.path()).is_none());
        assert!(locator.locate(qwen()).is_none());
    }

    #[test]
    fn test_resolve_rejects_directory_without_snapshots() {
        let root = TempDir::new().unwrap();
        // Loose files directly in the model directory must not be accepted
        write_valid_artifacts(&model_dir(root.path()));

        let locator = CacheLocator::with_roots(vec![root.path().to_path_buf()]);
        assert!(locator.resolve(qwen(), root.path()).is_none());
        assert!(locator.locate_all(qwen()).is_empty());
    }

    #[test]
    fn test_resolve_prefers_canonical_snapshot() {
        let root = TempDir::new().unwrap();
        let snapshots = model_dir(root.path()).join("snapshots");
        write_valid_artifacts(&snapshots.join("main"));
        std::thread::sleep(Duration::from_millis(30));
        write_valid_artifacts(&snapshots.join("f00dbabe"));

        let locator = CacheLocator::with_roots(vec![root.path().to_path_buf()]);
        let resolved = locator.resolve(qwen(), root.path()).unwrap();
        assert_eq!(resolved.snapshot_id, "main");
        assert_eq!(resolved.snapshot_dir, snapshots.join("main"));
        assert_eq!(resolved.layout, SnapshotLayout::Hub);
    }

    #[test]
    fn test_refs_main_cannot_escape_snapshots() {
        let root = TempDir::new().unwrap();
        let model = root.path().join(qwen().cache_dir_name);
        std::fs::create_dir_all(model.join("snapshots")).unwrap();
        std::fs::create_dir_all(model.join("refs")).unwrap();
        std::fs::write(model.join("refs/main"), "../..\n").unwrap();

        assert!(resolve_model_dir(qwen(), root.path()).is_none());

        std::fs::write(model.join("refs/main"), "../blobs").unwrap();
        std::fs::create_dir_all(model.join("blobs")).unwrap();
        assert!(resolve_model_dir(qwen(), root.path()).is_none());
    }

    #[test]
    fn test_plain_revision() {
        assert!(is_plain_revision("aaa111"));
        assert!(!is_plain_revision(""));
        assert!(!is_plain_revision(".."));
        assert!(!is_plain_revision("."));
        assert!(!is_plain_revision("../x"));
        assert!(!is_plain_revision("a/b"));
        assert!(!is_plain_revision("/etc"));
    }

    #[test]
    fn test_resolve_follows_refs_main() {
        let root = TempDir::new().unwrap();
        let model = model_dir(root.path());
        std::fs::create_dir_all(model.join("snapshots/aaa111")).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        std::fs::create_dir_all(model.join("snapshots/bbb222")).unwrap();
        std::fs::create_dir_all(model.join("refs")).unwrap();
        std::fs::write(model.join("refs/main"), "aaa111\n").unwrap();

        let locator = CacheLocator::with_roots(vec![root.path().to_path_buf()]);
        assert_eq!(locator.resolve(qwen(), root.path()).unwrap().snapshot_id, "aaa111");
    }

    #[test]
    fn test_resolve_falls_back_to_newest_snapshot() {
        let root = TempDir::new().unwrap();
        let snapshots = model_dir(root.path()).join("snapshots");
        std::fs::create_dir_all(snapshots.join("zzz-older")).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        std::fs::create_dir_all(snapshots.join("aaa-newer")).unwrap();

        let locator = CacheLocator::with_roots(vec![root.path().to_path_buf()]);
        assert_eq!(locator.resolve(qwen(), root.path()).unwrap().snapshot_id, "aaa-newer");
    }

    #[test]
    fn test_resolve_ignores_files_in_snapshots() {
        let root = TempDir::new().unwrap();
        let snapshots = model_dir(root.path()).join("snapshots");
        std::fs::create_dir_all(&snapshots).unwrap();
        std::fs::write(snapshots.join("stray-file"), b"x").unwrap();

        let locator = CacheLocator::with_roots(vec![root.path().to_path_buf()]);
        assert!(locator.resolve(qwen(), root.path()).is_none());
    }

    #[test]
    fn test_list_cache_roots_filters_and_caches() {
        let existing = TempDir::new().unwrap();
        let missing_parent = TempDir::new().unwrap();
        let missing = missing_parent.path().join("later");

        let locator = CacheLocator::with_roots(vec![missing.clone(), existing.path().to_path_buf()]);
        assert_eq!(locator.list_cache_roots(), vec![existing.path().to_path_buf()]);

        // Created after the first check: hidden until the cache is dropped
        std::fs::create_dir(&missing).unwrap();
        assert_eq!(locator.list_cache_roots().len(), 1);

        locator.invalidate();
        assert_eq!(
            locator.list_cache_roots(),
            vec![missing.clone(), existing.path().to_path_buf()]
        );
    }

    #[test]
    fn test_root_cache_expires_after_ttl() {
        let parent = TempDir::new().unwrap();
        let root = parent.path().join("hub");
        let locator = CacheLocator::new(LocatorConfig {
            cache_roots: vec![root.clone()],
            root_cache_ttl: Duration::from_millis(20),
            ..Default::default()
        });

        assert!(locator.list_cache_roots().is_empty());
        std::fs::create_dir(&root).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(locator.list_cache_roots(), vec![root]);
    }

    #[test]
    fn test_duplicate_roots_are_collapsed() {
        let root = TempDir::new().unwrap();
        let locator = CacheLocator::with_roots(vec![
            root.path().to_path_buf(),
            root.path().to_path_buf(),
        ]);
        assert_eq!(locator.candidate_roots().len(), 1);
        assert_eq!(locator.primary_root(), Some(root.path()));
    }

    #[test]
    fn test_nested_search_finds_hub_under_marker_dirs() {
        let root = TempDir::new().unwrap();
        let nested = root.path().join("huggingface").join("hub");
        write_valid_artifacts(&model_dir(&nested).join("snapshots/main"));

        let locator = CacheLocator::with_roots(vec![root.path().to_path_buf()]);
        assert!(locator.resolve(qwen(), root.path()).is_none());

        let found = locator.resolve_nested(qwen(), root.path()).unwrap();
        assert_eq!(found.root, nested);
        assert_eq!(locator.locate(qwen()).unwrap().snapshot_dir, found.snapshot_dir);
    }

    #[test]
    fn test_nested_search_skips_hidden_and_unrelated_dirs() {
        let root = TempDir::new().unwrap();
        write_valid_artifacts(&model_dir(&root.path().join(".hub")).join("snapshots/main"));
        write_valid_artifacts(&model_dir(&root.path().join("projects")).join("snapshots/main"));

        let locator = CacheLocator::with_roots(vec![root.path().to_path_buf()]);
        assert!(locator.resolve_nested(qwen(), root.path()).is_none());
    }

    #[test]
    fn test_nested_search_is_depth_bounded() {
        let root = TempDir::new().unwrap();
        let deep = root.path().join("cache/hub/models/huggingface");
        write_valid_artifacts(&model_dir(&deep).join("snapshots/main"));

        let shallow = CacheLocator::new(LocatorConfig {
            cache_roots: vec![root.path().to_path_buf()],
            nested_search_depth: 2,
            ..Default::default()
        });
        assert!(shallow.resolve_nested(qwen(), root.path()).is_none());

        let deeper = CacheLocator::new(LocatorConfig {
            cache_roots: vec![root.path().to_path_buf()],
            nested_search_depth: 4,
            ..Default::default()
        });
        assert!(deeper.resolve_nested(qwen(), root.path()).is_some());
    }

    #[test]
    fn test_legacy_layout_only_when_enabled() {
        let root = TempDir::new().unwrap();
        write_valid_artifacts(&root.path().join(qwen().id.as_str()));

        let strict = CacheLocator::with_roots(vec![root.path().to_path_buf()]);
        assert!(strict.locate(qwen()).is_none());

        let lenient = CacheLocator::new(LocatorConfig {
            cache_roots: vec![root.path().to_path_buf()],
            allow_legacy_layout: true,
            ..Default::default()
        });
        let found = lenient.locate(qwen()).unwrap();
        assert_eq!(found.layout, SnapshotLayout::Legacy);
        assert_eq!(found.snapshot_dir, root.path().join("qwen3-0.6b"));
    }

    #[test]
    fn test_locate_all_orders_roots_by_priority() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        write_valid_artifacts(&model_dir(first.path()).join("snapshots/main"));
        write_valid_artifacts(&model_dir(second.path()).join("snapshots/main"));

        let locator =
            CacheLocator::with_roots(vec![second.path().to_path_buf(), first.path().to_path_buf()]);
        let all = locator.locate_all(qwen());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].root, second.path());
        assert_eq!(all[1].root, first.path());
    }

    #[test]
    fn test_directory_size_counts_regular_files() {
        let temp_dir = TempDir::new().unwrap();
        let subdir = temp_dir.path().join("subdir");
        std::fs::create_dir(&subdir).unwrap();
        std::fs::write(subdir.join("file1.txt"), "abc").unwrap();
        std::fs::write(temp_dir.path().join("file2.txt"), "defgh").unwrap();

        assert_eq!(directory_size(temp_dir.path()), 8);
    }

    #[test]
    fn test_directory_size_empty_dir() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(directory_size(temp_dir.path()), 0);
    }
}
