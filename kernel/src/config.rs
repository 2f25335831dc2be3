use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read kernel config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse kernel config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Limits and switches of the kernel. Missing keys take their defaults.
///
/// ```toml
/// normalization_fuel = 10000
/// unfold_partial = false
/// max_call_matrices = 4096
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Reduction steps one `whnf` call may take before giving up.
    pub normalization_fuel: usize,
    /// Whether definitions that failed the termination check are unfolded.
    pub unfold_partial: bool,
    /// Bound on the size of the call-graph closure.
    pub max_call_matrices: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            normalization_fuel: 10_000,
            unfold_partial: false,
            max_call_matrices: 4_096,
        }
    }
}

impl KernelConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
