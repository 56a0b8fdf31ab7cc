//! Configuration structures and loading logic

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding the repository base URL
pub const REPO_URL_ENV: &str = "MXNET_GLUON_REPO";

/// Environment variable overriding the MXNet data directory
pub const DATA_DIR_ENV: &str = "MXNET_HOME";

/// Default repository serving the model zoo archives
pub const DEFAULT_REPO_URL: &str = "https://apache-mxnet.s3-accelerate.dualstack.amazonaws.com/";

/// Model store configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding `<name>-<hash8>.params` files. A leading `~` is expanded on use.
    pub root_dir: PathBuf,
    /// Base URL of the model repository
    pub repo_url: String,
    pub download_retries: u32,
    /// Stall timeout: longest wait to connect or for the next body chunk.
    /// A transfer that keeps making progress is never cut off.
    pub download_timeout_secs: u64,
    /// Hold a cross-process lock file while fetching
    pub file_lock: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            repo_url: default_repo_url(),
            download_retries: default_download_retries(),
            download_timeout_secs: default_download_timeout(),
            file_lock: true,
        }
    }
}

impl StoreConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> StoreResult<Self> {
        let mut config = if let Some(path) = path {
            let content =
                std::fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
            toml::from_str(&content).map_err(|e| {
                StoreError::Config(format!("Failed to parse TOML config {:?}: {}", path, e))
            })?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(repo_url) = std::env::var(REPO_URL_ENV) {
            config.repo_url = repo_url;
        }
        if let Ok(data_dir) = std::env::var(DATA_DIR_ENV) {
            config.root_dir = PathBuf::from(data_dir).join("models");
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> StoreResult<()> {
        let url = self.repo_url.trim();
        if url.is_empty() {
            return Err(StoreError::Config("repo_url cannot be empty".to_string()));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(StoreError::Config(format!(
                "repo_url must use http or https (got {})",
                self.repo_url
            )));
        }
        if self.download_timeout_secs == 0 {
            return Err(StoreError::Config(
                "download_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.root_dir.as_os_str().is_empty() {
            return Err(StoreError::Config("root_dir cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// Repository base URL from `MXNET_GLUON_REPO`, falling back to the Apache endpoint
pub fn repo_url_from_env() -> String {
    std::env::var(REPO_URL_ENV).unwrap_or_else(|_| default_repo_url())
}

/// Ensure the base URL ends with exactly one `/`
pub fn normalize_repo_url(url: &str) -> String {
    format!("{}/", url.trim_end_matches('/'))
}

/// Expand a leading `~` to the user's home directory
pub fn expand_tilde(path: &Path) -> StoreResult<PathBuf> {
    let mut components = path.components();
    match components.next() {
        Some(std::path::Component::Normal(first)) if first == "~" => {
            let home = dirs::home_dir().ok_or(StoreError::HomeDirUnavailable)?;
            Ok(home.join(components.as_path()))
        }
        _ => Ok(path.to_path_buf()),
    }
}

// Default functions
fn default_root_dir() -> PathBuf {
    match std::env::var(DATA_DIR_ENV) {
        Ok(data_dir) => PathBuf::from(data_dir).join("models"),
        Err(_) => PathBuf::from("~/.mxnet/models"),
    }
}
fn default_repo_url() -> String {
    DEFAULT_REPO_URL.to_string()
}
fn default_download_retries() -> u32 {
    5
}
fn default_download_timeout() -> u64 {
    60
}
