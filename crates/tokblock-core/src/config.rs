//! Configuration types for tokblock.

use crate::{Result, TokblockError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Block chunking configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Fixed block length used for slicing.
    ///
    /// Kept signed so that a negative value in a config file surfaces as a
    /// configuration error instead of a parse error.
    #[serde(default = "default_block_size")]
    pub block_size: i64,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
        }
    }
}

impl ChunkerConfig {
    /// Create a config with the given block size.
    pub fn with_block_size(block_size: i64) -> Self {
        Self { block_size }
    }

    /// Validate the configuration, returning the usable block size.
    pub fn validate(&self) -> Result<usize> {
        validate_block_size(self.block_size)
    }
}

/// Memory reclamation configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimConfig {
    /// Log allocator statistics before and after each release.
    #[serde(default = "default_true")]
    pub log_stats: bool,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self { log_stats: true }
    }
}

/// Top-level configuration file layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokblockConfig {
    /// Block chunking settings.
    #[serde(default)]
    pub chunker: ChunkerConfig,

    /// Memory reclamation settings.
    #[serde(default)]
    pub reclaim: ReclaimConfig,
}

impl TokblockConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.chunker.validate().map(|_| ())
    }
}

/// Check that `block_size` is a positive integer.
pub fn validate_block_size(block_size: i64) -> Result<usize> {
    if block_size <= 0 {
        return Err(TokblockError::Config(format!(
            "block_size must be a positive integer, got {block_size}"
        )));
    }
    usize::try_from(block_size).map_err(|_| {
        TokblockError::Config(format!("block_size {block_size} does not fit in usize"))
    })
}

fn default_block_size() -> i64 {
    1024
}

fn default_true() -> bool {
    true
}
