//! Config file lookup
//!
//! Athena reads `config.json` from two places: the user's config directory
//! and the `.athena` directory of the current project.

use crate::{Error, Result};
use serde_json::Value;
use std::path::PathBuf;

/// Directory holding Athena's JSON files
#[derive(Debug, Clone)]
pub struct JsonStore {
    base_dir: PathBuf,
}

impl JsonStore {
    /// `<config_dir>/athena/`
    pub fn global() -> Result<Self> {
        let base_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Cannot find config directory".to_string()))?
            .join("athena");
        Ok(Self { base_dir })
    }

    /// `<root>/.athena/`
    pub fn project(root: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: root.into().join(".athena"),
        }
    }

    pub fn current_project() -> Result<Self> {
        let cwd = std::env::current_dir()
            .map_err(|e| Error::Config(format!("Cannot get current directory: {}", e)))?;
        Ok(Self::project(cwd))
    }

    /// Raw JSON of `filename`; `None` when the file does not exist
    pub fn load_optional(&self, filename: &str) -> Result<Option<Value>> {
        let path = self.base_dir.join(filename);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Config(format!("Failed to read {}: {}", path.display(), e))),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }
}
