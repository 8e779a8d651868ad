//! Client configuration file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use fieldsync_storage::S3Config;
use fieldsync_sync::SyncConfig;

fn default_database() -> PathBuf {
    PathBuf::from("fieldsync.db")
}

/// Contents of the `--config` JSON file.
///
/// ```json
/// {
///   "database": "fieldsync.db",
///   "forms": "forms.json",
///   "s3": { "bucket": "...", "access_key": "...", "secret": "..." },
///   "sync": { "data_dir": "data", "media_dir": "media" }
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_database")]
    pub database: PathBuf,
    /// Form definitions, see `StaticForms::from_json`.
    #[serde(default)]
    pub forms: Option<PathBuf>,
    #[serde(default)]
    pub s3: Option<S3Config>,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            forms: None,
            s3: None,
            sync: SyncConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
