//! Static catalog of supported models
//!
//! Every model the warden can manage is listed here. The table is closed: an id
//! that is not in [`ModelId`] is rejected instead of being mapped onto a guessed
//! cache directory name.

use crate::error::CacheError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Files that together make up one usable model, checked in this order
pub const REQUIRED_FILES: &[&str] = &[
    "config.json",
    "tokenizer.json",
    "tokenizer_config.json",
    "special_tokens_map.json",
    "model.safetensors",
];

/// Closed set of supported models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelId {
    #[serde(rename = "qwen3-0.6b")]
    Qwen3_0_6B,
    #[serde(rename = "gemma3-1b")]
    Gemma3_1B,
    #[serde(rename = "llama3.2-1b")]
    Llama3_2_1B,
}

/// Immutable description of one logical model
#[derive(Debug, PartialEq, Eq)]
pub struct ModelDescriptor {
    /// Short internal id
    pub id: ModelId,
    /// Human readable name
    pub name: &'static str,
    /// Remote repository on the hub (e.g. "mlx-community/Qwen3-0.6B-4bit")
    pub repo_id: &'static str,
    /// Directory name inside a cache root (`models--{org}--{name}`)
    pub cache_dir_name: &'static str,
    /// Ordered list of files that must be present and valid
    pub required_files: &'static [&'static str],
}

static CATALOG: [ModelDescriptor; 3] = [
    ModelDescriptor {
        id: ModelId::Qwen3_0_6B,
        name: "Qwen3 0.6B",
        repo_id: "mlx-community/Qwen3-0.6B-4bit",
        cache_dir_name: "models--mlx-community--Qwen3-0.6B-4bit",
        required_files: REQUIRED_FILES,
    },
    ModelDescriptor {
        id: ModelId::Gemma3_1B,
        name: "Gemma 3 1B Instruct",
        repo_id: "mlx-community/gemma-3-1b-it-4bit",
        cache_dir_name: "models--mlx-community--gemma-3-1b-it-4bit",
        required_files: REQUIRED_FILES,
    },
    ModelDescriptor {
        id: ModelId::Llama3_2_1B,
        name: "Llama 3.2 1B Instruct",
        repo_id: "mlx-community/Llama-3.2-1B-Instruct-4bit",
        cache_dir_name: "models--mlx-community--Llama-3.2-1B-Instruct-4bit",
        required_files: REQUIRED_FILES,
    },
];

impl ModelId {
    pub const ALL: [ModelId; 3] = [ModelId::Qwen3_0_6B, ModelId::Gemma3_1B, ModelId::Llama3_2_1B];

    /// Short id used in config files, URLs and lock file names
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Qwen3_0_6B => "qwen3-0.6b",
            Self::Gemma3_1B => "gemma3-1b",
            Self::Llama3_2_1B => "llama3.2-1b",
        }
    }

    /// Static descriptor for this model
    pub fn descriptor(self) -> &'static ModelDescriptor {
        match self {
            Self::Qwen3_0_6B => &CATALOG[0],
            Self::Gemma3_1B => &CATALOG[1],
            Self::Llama3_2_1B => &CATALOG[2],
        }
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelId {
    type Err = CacheError;

    /// Accepts either the short id or the hub repository id
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        ModelId::ALL
            .into_iter()
            .find(|id| id.as_str().eq_ignore_ascii_case(s) || id.descriptor().repo_id == s)
            .ok_or_else(|| CacheError::UnknownModel(s.to_string()))
    }
}

/// All known descriptors in catalog order
pub fn catalog() -> &'static [ModelDescriptor] {
    &CATALOG
}

/// Convert a hub repository id into its cache directory name
///
/// e.g., "mlx-community/Qwen3-0.6B-4bit" -> "models--mlx-community--Qwen3-0.6B-4bit"
pub fn repo_id_to_cache_name(repo_id: &str) -> String {
    format!("models--{}", repo_id.replace('/', "--"))
}
