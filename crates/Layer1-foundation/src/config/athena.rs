//! Athena Config
//!
//! Global (`<config_dir>/athena/config.json`) and project
//! (`./.athena/config.json`) files are merged, project last.

use crate::storage::JsonStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;

/// Config file name
pub const ATHENA_CONFIG_FILE: &str = "config.json";

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AthenaConfig {
    /// Fixed delay between two polls of the waiting queue
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// How long `stop` waits for in-flight scheduled work
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Delay before a failed or lost task is dispatched again
    #[serde(default = "default_retry_wait_secs")]
    pub default_retry_wait_secs: u64,

    /// `maxTries` for tasks submitted without one
    #[serde(default = "default_max_tries")]
    pub default_max_tries: u32,

    /// Waiting tasks fetched per poll
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Skip waiting tasks the backend already runs (duplicate dispatch guard)
    #[serde(default)]
    pub dedupe_waiting_dispatch: bool,

    /// Database directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Log archive directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl Default for AthenaConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            default_retry_wait_secs: default_retry_wait_secs(),
            default_max_tries: default_max_tries(),
            page_size: default_page_size(),
            dedupe_waiting_dispatch: false,
            data_dir: None,
            log_dir: None,
        }
    }
}

impl AthenaConfig {
    // ========================================================================
    // Load
    // ========================================================================

    /// Load global + project, project wins
    pub fn load() -> Result<Self> {
        let mut layers = Vec::new();

        if let Ok(global) = JsonStore::global() {
            layers.extend(global.load_optional(ATHENA_CONFIG_FILE)?);
        }
        if let Ok(project) = JsonStore::current_project() {
            layers.extend(project.load_optional(ATHENA_CONFIG_FILE)?);
        }

        Self::from_layers(layers)
    }

    /// Overlay raw JSON objects key by key, later layers win. A key set in a
    /// later layer replaces the earlier value even when it equals the default.
    pub fn from_layers(layers: impl IntoIterator<Item = Value>) -> Result<Self> {
        let mut merged = Map::new();
        for layer in layers {
            match layer {
                Value::Object(fields) => merged.extend(fields),
                Value::Null => {}
                other => {
                    return Err(Error::Config(format!(
                        "config file must hold a JSON object, found {}",
                        other
                    )))
                }
            }
        }

        let config: AthenaConfig = serde_json::from_value(Value::Object(merged))
            .map_err(|e| Error::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    // ========================================================================
    // Validate
    // ========================================================================

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(Error::Config("pollIntervalSecs must be at least 1".into()));
        }
        if self.default_max_tries == 0 {
            return Err(Error::Config("defaultMaxTries must be at least 1".into()));
        }
        if self.page_size == 0 {
            return Err(Error::Config("pageSize must be at least 1".into()));
        }
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_secs(self.default_retry_wait_secs)
    }

    /// Database directory, `<data_dir>/athena` unless configured
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("athena")
        })
    }

    /// Log archive directory, `<data_dir>/logs` unless configured
    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("logs"))
    }

    // ========================================================================
    // Builder
    // ========================================================================

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn default_poll_interval_secs() -> u64 {
    1
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_retry_wait_secs() -> u64 {
    10
}

fn default_max_tries() -> u32 {
    3
}

fn default_page_size() -> usize {
    10
}
