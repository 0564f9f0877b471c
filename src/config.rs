//! Store configuration
//!
//! Loaded from a TOML file; every key is optional.
//!
//! ```toml
//! root = "/var/lib/calltrace"
//! max_segment_size = 67108864   # bytes, 0 disables rotation
//! read_only = false
//! frame_pool_capacity = 1024
//! ```

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default raw-event segment size before rotation (64 MiB)
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Default root directory name, relative to the working directory
pub const DEFAULT_ROOT: &str = ".calltrace";

const ENV_ROOT: &str = "CALLTRACE_ROOT";
const ENV_MAX_SEGMENT_SIZE: &str = "CALLTRACE_MAX_SEGMENT_SIZE";

/// Trace store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Trace-store root directory
    pub root: PathBuf,
    /// Raw-event segment size that triggers rotation; 0 disables rotation
    pub max_segment_size: u64,
    /// Open every log read-only
    pub read_only: bool,
    /// Frame buffers kept for reuse by each simulator
    pub frame_pool_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            root: PathBuf::from(DEFAULT_ROOT),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            read_only: false,
            frame_pool_capacity: 1024,
        }
    }
}

impl Config {
    /// Configuration with defaults rooted at `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Config {
            root: root.into(),
            ..Config::default()
        }
    }

    /// Parse a TOML document
    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Config::parse(&text)
    }

    /// Defaults overridden by `CALLTRACE_ROOT` and `CALLTRACE_MAX_SEGMENT_SIZE`
    pub fn from_env_or_default() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment overrides read through `get`
    pub fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, get: F) -> Result<()> {
        if let Some(root) = get(ENV_ROOT) {
            self.root = PathBuf::from(root);
        }
        if let Some(size) = get(ENV_MAX_SEGMENT_SIZE) {
            self.max_segment_size = size.trim().parse().map_err(|_| {
                StoreError::InvalidConfig(format!(
                    "{} must be a byte count, got {:?}",
                    ENV_MAX_SEGMENT_SIZE, size
                ))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_segment_size, DEFAULT_MAX_SEGMENT_SIZE);
        assert!(!config.read_only);
        assert_eq!(config.frame_pool_capacity, 1024);
    }

    #[test]
    fn test_parse_partial_file() {
        let config = Config::parse("root = \"/tmp/t\"\nmax_segment_size = 0\n").unwrap();
        assert_eq!(config.root, PathBuf::from("/tmp/t"));
        assert_eq!(config.max_segment_size, 0);
        assert_eq!(config.frame_pool_capacity, 1024);
    }

    #[test]
    fn test_parse_rejects_wrong_types() {
        assert!(matches!(
            Config::parse("read_only = \"yes\""),
            Err(StoreError::Config(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CALLTRACE_ROOT", "/data/traces"),
            ("CALLTRACE_MAX_SEGMENT_SIZE", "4096"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.root, PathBuf::from("/data/traces"));
        assert_eq!(config.max_segment_size, 4096);
    }

    #[test]
    fn test_env_rejects_bad_size() {
        let mut config = Config::default();
        let result = config.apply_env(|k| (k == "CALLTRACE_MAX_SEGMENT_SIZE").then(|| "big".to_string()));
        assert!(matches!(result, Err(StoreError::InvalidConfig(_))));
    }
}
