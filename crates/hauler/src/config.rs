//! Store location and temporary directory.

use std::path::{Path, PathBuf};

/// Environment variable overriding the store directory.
pub const STORE_DIR_ENV: &str = "HAULER_STORE_DIR";

/// Environment variable overriding the temporary directory.
pub const TEMP_DIR_ENV: &str = "HAULER_TEMP_DIR";

/// Store directory used when nothing else is configured.
pub const DEFAULT_STORE_DIR: &str = "store";

/// Where a store lives and where it stages work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Layout root.
    pub root: PathBuf,
    /// Parent of staging layouts and downloads; the system temp dir if unset.
    pub tmp_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::new(DEFAULT_STORE_DIR)
    }
}

impl StoreConfig {
    /// A store at `root` using the system temporary directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StoreConfig {
            root: root.into(),
            tmp_dir: None,
        }
    }

    /// Read [`STORE_DIR_ENV`] and [`TEMP_DIR_ENV`], falling back to defaults.
    pub fn from_env() -> Self {
        let root = std::env::var_os(STORE_DIR_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR));
        let tmp_dir = std::env::var_os(TEMP_DIR_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        StoreConfig { root, tmp_dir }
    }

    /// Stage under `dir` instead of the system temporary directory.
    pub fn with_tmp_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.tmp_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// The effective temporary directory.
    pub fn tmp_dir(&self) -> PathBuf {
        self.tmp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
