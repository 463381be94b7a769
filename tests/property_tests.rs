//! Property-based tests using proptest
//!
//! These tests verify invariants across randomized inputs, helping catch
//! edge cases that might be missed by example-based testing.

use model_warden::config::WardenConfig;
use model_warden::models::descriptor::{REQUIRED_FILES, repo_id_to_cache_name};
use model_warden::models::validator::{self, InvalidReason, MIN_ARTIFACT_BYTES, ValidationResult};
use model_warden::{FailureClass, ModelId};
use proptest::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Arbitrary Implementations
// =============================================================================

/// State of one required file on disk
#[derive(Debug, Clone)]
enum FileState {
    Absent,
    Empty,
    /// Valid JSON for `.json` files, `n` bytes of payload otherwise
    Valid(usize),
    Garbage,
}

fn arb_file_state() -> impl Strategy<Value = FileState> {
    prop_oneof![
        1 => Just(FileState::Absent),
        1 => Just(FileState::Empty),
        6 => (2usize..256).prop_map(FileState::Valid),
        1 => Just(FileState::Garbage),
    ]
}

fn arb_model_id() -> impl Strategy<Value = ModelId> {
    prop::sample::select(ModelId::ALL.to_vec())
}

/// Randomly flip the ASCII case of each character
fn arb_case_mix(s: &'static str) -> impl Strategy<Value = String> {
    prop::collection::vec(any::<bool>(), s.len()).prop_map(move |upper| {
        s.chars()
            .zip(upper)
            .map(|(c, up)| if up { c.to_ascii_uppercase() } else { c })
            .collect()
    })
}

fn write_state(dir: &std::path::Path, file: &str, state: &FileState) {
    let path = dir.join(file);
    let is_json = file.ends_with(".json");
    match state {
        FileState::Absent => {}
        FileState::Empty => std::fs::write(path, b"").unwrap(),
        FileState::Valid(n) if is_json => {
            std::fs::write(path, format!(r#"{{"padding": "{}"}}"#, "x".repeat(*n))).unwrap()
        }
        FileState::Valid(n) => std::fs::write(path, vec![0u8; *n]).unwrap(),
        FileState::Garbage if is_json => std::fs::write(path, b"{\"truncated\": ").unwrap(),
        FileState::Garbage => std::fs::write(path, b"\x00\x01").unwrap(),
    }
}

// =============================================================================
// Validator Properties
// =============================================================================

proptest! {
    /// A set is complete exactly when every file is present, non-trivial and parseable
    #[test]
    fn validation_matches_file_states(
        states in prop::collection::vec(arb_file_state(), REQUIRED_FILES.len())
    ) {
        let dir = TempDir::new().unwrap();
        for (file, state) in REQUIRED_FILES.iter().zip(&states) {
            write_state(dir.path(), file, state);
        }

        let expected_first_problem = REQUIRED_FILES.iter().zip(&states).find_map(|(file, state)| {
            let reason = match state {
                FileState::Absent => Some(InvalidReason::Missing),
                FileState::Empty => Some(InvalidReason::TooSmall { size: 0 }),
                FileState::Garbage if file.ends_with(".json") => Some(InvalidReason::UnparseableJson),
                _ => None,
            };
            reason.map(|r| (file.to_string(), r))
        });

        match validator::validate(dir.path(), REQUIRED_FILES) {
            ValidationResult::Complete => prop_assert!(expected_first_problem.is_none()),
            ValidationResult::Incomplete(problem) => {
                let (file, reason) = expected_first_problem.unwrap();
                prop_assert_eq!(problem.file, file);
                prop_assert_eq!(problem.reason, reason);
            }
        }
    }

    /// Anything at or below the minimum size is rejected regardless of contents
    #[test]
    fn tiny_weights_are_rejected(size in 0u64..=MIN_ARTIFACT_BYTES) {
        let dir = TempDir::new().unwrap();
        for file in REQUIRED_FILES {
            write_state(dir.path(), file, &FileState::Valid(8));
        }
        std::fs::write(dir.path().join("model.safetensors"), vec![1u8; size as usize]).unwrap();

        let result = validator::validate(dir.path(), REQUIRED_FILES);
        prop_assert!(!result.is_complete());
        prop_assert_eq!(result.problem().unwrap().file.as_str(), "model.safetensors");
    }

    /// Marker detection ignores case and position
    #[test]
    fn marker_names_detected_in_any_case(
        prefix in "[a-z0-9._-]{0,12}",
        marker in prop::sample::select(vec!["incomplete", "tmp"]),
        suffix in "[a-z0-9._-]{0,12}",
        upper in any::<bool>(),
    ) {
        let marker = if upper { marker.to_ascii_uppercase() } else { marker.to_string() };
        let name = format!("{}{}{}", prefix, marker, suffix);
        prop_assert!(validator::is_marker_name(&name));
    }

    /// Names built from letters that cannot spell a marker are never flagged
    #[test]
    fn plain_names_are_not_markers(name in "[abdfghjqrsuvwxyz0-9._-]{1,24}") {
        prop_assert!(!validator::is_marker_name(&name));
    }
}

// =============================================================================
// Catalog Properties
// =============================================================================

proptest! {
    /// Short ids parse in any letter case
    #[test]
    fn model_ids_parse_case_insensitively(
        (id, text) in arb_model_id().prop_flat_map(|id| (Just(id), arb_case_mix(id.as_str())))
    ) {
        prop_assert_eq!(text.parse::<ModelId>().unwrap(), id);
    }

    /// Cache directory names never contain a path separator
    #[test]
    fn cache_names_are_single_components(
        org in "[a-zA-Z0-9-]{1,20}",
        name in "[a-zA-Z0-9._-]{1,30}",
    ) {
        let cache_name = repo_id_to_cache_name(&format!("{}/{}", org, name));
        prop_assert!(!cache_name.contains('/'));
        prop_assert!(cache_name.starts_with("models--"));
        prop_assert!(cache_name.ends_with(&name));
    }

    /// Unknown ids are rejected rather than guessed
    #[test]
    fn unknown_ids_are_rejected(text in "[a-z]{1,8}-[0-9]{2,4}[a-z]") {
        prop_assume!(ModelId::ALL.iter().all(|id| !id.as_str().eq_ignore_ascii_case(&text)));
        prop_assert!(text.parse::<ModelId>().is_err());
    }
}

// =============================================================================
// Config and Classification Properties
// =============================================================================

proptest! {
    /// Port validation boundary
    #[test]
    fn port_validation_boundary(port in any::<u16>()) {
        let config = WardenConfig {
            api_port: port,
            ..Default::default()
        };
        prop_assert_eq!(config.validate().is_ok(), port >= 1024);
    }

    /// Permission and disk problems are never retried, whatever the file
    #[test]
    fn disk_problems_are_terminal(
        file in prop::sample::select(REQUIRED_FILES.to_vec()),
        kind in prop::sample::select(vec![
            std::io::ErrorKind::PermissionDenied,
            std::io::ErrorKind::ReadOnlyFilesystem,
            std::io::ErrorKind::StorageFull,
        ]),
    ) {
        let problem = validator::ArtifactProblem {
            file: file.to_string(),
            reason: InvalidReason::Io(kind),
        };
        let class = FailureClass::from_problem(&problem);
        prop_assert_eq!(class, FailureClass::DiskOrPermission);
        prop_assert!(!class.is_retryable());
    }

    /// Content problems are always retryable
    #[test]
    fn content_problems_are_retryable(
        file in prop::sample::select(REQUIRED_FILES.to_vec()),
        reason in prop_oneof![
            Just(InvalidReason::Missing),
            (0u64..=1).prop_map(|size| InvalidReason::TooSmall { size }),
            Just(InvalidReason::UnparseableJson),
        ],
    ) {
        let problem = validator::ArtifactProblem { file: file.to_string(), reason };
        prop_assert!(FailureClass::from_problem(&problem).is_retryable());
    }
}
