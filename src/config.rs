//! Engine configuration, loaded from `~/.crmcore/config.json`.
//!
//! Every field has a default, so a missing file is not an error. The CLI
//! overrides individual fields with flags after loading.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Upper bound on concurrent scoring tasks per batch.
pub const MAX_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Explicit database path; `None` means `~/.crmcore/crmcore.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    /// Contacts per recompute batch (also the concurrency bound).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Timeout for a single store call.
    #[serde(default = "default_store_timeout_secs")]
    pub store_timeout_secs: u64,
    /// Timeout for scoring one contact end to end (read, compute, write).
    #[serde(default = "default_contact_timeout_secs")]
    pub contact_timeout_secs: u64,
}

fn default_batch_size() -> usize {
    MAX_BATCH_SIZE
}

fn default_store_timeout_secs() -> u64 {
    10
}

fn default_contact_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            batch_size: default_batch_size(),
            store_timeout_secs: default_store_timeout_secs(),
            contact_timeout_secs: default_contact_timeout_secs(),
        }
    }
}

impl Config {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn contact_timeout(&self) -> Duration {
        Duration::from_secs(self.contact_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(CoreError::Validation(format!(
                "batchSize must be between 1 and {MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.store_timeout_secs == 0 || self.contact_timeout_secs == 0 {
            return Err(CoreError::Validation(
                "timeouts must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default config location: `~/.crmcore/config.json`.
pub fn config_path() -> Result<PathBuf, CoreError> {
    let home = dirs::home_dir()
        .ok_or_else(|| CoreError::NotFound("home directory".to_string()))?;
    Ok(home.join(".crmcore").join("config.json"))
}

/// Load the config at `path`, falling back to defaults when the file is absent.
pub fn load_config_from(path: &Path) -> Result<Config, CoreError> {
    if !path.exists() {
        log::debug!("No config at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    let content = fs::read_to_string(path).map_err(|e| {
        CoreError::Validation(format!("Failed to read config {}: {}", path.display(), e))
    })?;

    let config: Config = serde_json::from_str(&content).map_err(|e| {
        CoreError::Validation(format!("Failed to parse config {}: {}", path.display(), e))
    })?;

    config.validate()?;
    Ok(config)
}

/// Load the config from the default location.
pub fn load_config() -> Result<Config, CoreError> {
    load_config_from(&config_path()?)
}
