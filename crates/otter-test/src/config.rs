//! TOML configuration for the test runner

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::executor::ExecutorSettings;

/// File looked up in the current directory when no config path is given.
pub const DEFAULT_CONFIG_FILE: &str = "otter-test.toml";

/// Runner configuration loaded from a TOML file
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Directory walked for test files
    pub root: PathBuf,

    /// Glob patterns (relative to `root`) of test files
    pub patterns: Vec<String>,

    /// Path substrings excluded from discovery
    pub ignore: Vec<String>,

    /// Per-test timeout in milliseconds
    pub timeout_ms: u64,

    /// Default schedule tolerance in milliseconds
    pub tolerance_ms: u64,

    /// Number of failures detailed in the summary
    pub max_failures: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            patterns: vec!["**/*.test.*".to_string(), "**/*_test.*".to_string()],
            ignore: Vec::new(),
            timeout_ms: 500,
            tolerance_ms: 20,
            max_failures: 10,
        }
    }
}

impl RunnerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path`, or the default file if it exists, falling back to defaults
    /// with a warning when the file cannot be used.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);
        let path = match path {
            Some(path) => path,
            None if default_path.exists() => default_path,
            None => return Self::default(),
        };
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "using default configuration");
            Self::default()
        })
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            timeout: Duration::from_millis(self.timeout_ms),
            tolerance: Duration::from_millis(self.tolerance_ms),
        }
    }
}
