//! Runtime configuration: resource ceilings, policy knobs, storage location.
//!
//! Loaded from a YAML file (every field optional, defaults below); the
//! command line may override individual values afterwards.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default wall-clock ceiling per execution.
pub const DEFAULT_TIMEOUT_SECS: f64 = 5.0;
/// Default memory ceiling per execution (100 MiB).
pub const DEFAULT_MEMORY_LIMIT: usize = 100 * 1024 * 1024;
/// Default maximum accepted source size.
pub const DEFAULT_MAX_SOURCE_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// What to do with parameters the schema does not declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownParameters {
    /// Pass them through to the function unchecked.
    #[default]
    Ignore,
    /// Fail the call with a parameter error.
    Reject,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FuncboxConfig {
    pub sandbox: SandboxConfig,
    pub policy: PolicyConfig,
    pub ledger: LedgerConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub timeout_secs: f64,
    pub memory_limit_bytes: usize,
    pub unknown_parameters: UnknownParameters,
    pub max_call_depth: usize,
    /// Stack reserved for each sandbox thread.
    pub stack_size_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT,
            unknown_parameters: UnknownParameters::Ignore,
            max_call_depth: 200,
            stack_size_bytes: 64 * 1024 * 1024,
        }
    }
}

impl SandboxConfig {
    /// The per-call ceilings this configuration implies.
    pub fn limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            timeout: Duration::from_secs_f64(self.timeout_secs),
            memory_bytes: self.memory_limit_bytes,
        }
    }
}

/// Ceilings applied to one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub timeout: Duration,
    pub memory_bytes: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        SandboxConfig::default().limits()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub max_source_bytes: usize,
    /// Whether helper functions and constants may sit beside `process`.
    pub allow_helpers: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
            allow_helpers: true,
        }
    }
}

/// How execution parameters are summarized before they enter the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub max_string_chars: usize,
    pub max_collection_items: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_string_chars: 256,
            max_collection_items: 32,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the write-ahead log. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
}

impl FuncboxConfig {
    /// Parse and check a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    /// Load a YAML file from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Reject values the runtime cannot honor.
    pub fn check(&self) -> Result<(), ConfigError> {
        let timeout = self.sandbox.timeout_secs;
        if !timeout.is_finite() || timeout <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "sandbox.timeout_secs must be a positive number, got {timeout}"
            )));
        }
        if self.sandbox.memory_limit_bytes == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.memory_limit_bytes must be positive".into(),
            ));
        }
        if self.sandbox.max_call_depth == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.max_call_depth must be positive".into(),
            ));
        }
        if self.policy.max_source_bytes == 0 {
            return Err(ConfigError::Invalid(
                "policy.max_source_bytes must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = FuncboxConfig::default();
        assert_eq!(config.sandbox.limits().timeout, Duration::from_secs(5));
        assert_eq!(config.sandbox.memory_limit_bytes, 100 * 1024 * 1024);
        assert_eq!(config.sandbox.unknown_parameters, UnknownParameters::Ignore);
        assert!(config.policy.allow_helpers);
        assert!(config.storage.data_dir.is_none());
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = FuncboxConfig::from_yaml(
            "sandbox:\n  timeout_secs: 0.5\n  unknown_parameters: reject\npolicy:\n  allow_helpers: false\n",
        )
        .unwrap();
        assert_eq!(config.sandbox.limits().timeout, Duration::from_millis(500));
        assert_eq!(config.sandbox.unknown_parameters, UnknownParameters::Reject);
        assert_eq!(config.sandbox.memory_limit_bytes, DEFAULT_MEMORY_LIMIT);
        assert!(!config.policy.allow_helpers);
        assert_eq!(config.ledger.max_string_chars, 256);
    }

    #[test]
    fn empty_document_is_default() {
        let config = FuncboxConfig::from_yaml("{}").unwrap();
        assert_eq!(config.policy.max_source_bytes, DEFAULT_MAX_SOURCE_BYTES);
    }

    #[test]
    fn rejects_non_positive_timeout() {
        let err = FuncboxConfig::from_yaml("sandbox:\n  timeout_secs: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("funcbox.yaml");
        std::fs::write(&path, "storage:\n  data_dir: /tmp/funcbox\n").unwrap();
        let config = FuncboxConfig::load(&path).unwrap();
        assert_eq!(
            config.storage.data_dir.as_deref(),
            Some(Path::new("/tmp/funcbox"))
        );
    }

    #[test]
    fn load_missing_file_fails() {
        let err = FuncboxConfig::load(Path::new("/nonexistent/funcbox.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
