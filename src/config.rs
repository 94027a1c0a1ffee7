use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use directories::ProjectDirs;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{schema::LATEST_VERSION, Result, StoreError};

/// Store configuration settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Directory holding the database directories
    pub data_dir: PathBuf,

    /// Name of the database; also the name of its directory under `data_dir`
    pub db_name: String,

    /// Schema version to open the database at
    pub schema_version: u32,

    /// How long to wait between attempts while another holder has the database open (ms)
    pub blocked_retry_ms: u64,

    /// Whether to pretty-print the collection snapshots on disk
    pub pretty_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = ProjectDirs::from("", "", "noteflow")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".noteflow"));

        Self {
            data_dir,
            db_name: "noteflow_db".to_string(),
            schema_version: LATEST_VERSION,
            blocked_retry_ms: 250,
            pretty_json: false,
        }
    }
}

impl Config {
    /// Default configuration rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Loads a configuration file. Fields missing from the file keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading configuration from {}", path.display());
        let content = fs::read_to_string(path).map_err(|e| StoreError::Config {
            message: format!("cannot read {}: {}", path.display(), e),
        })?;
        let config: Config = serde_json::from_str(&content).map_err(|e| StoreError::Config {
            message: format!("cannot parse {}: {}", path.display(), e),
        })?;
        config.validate()?;
        debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.db_name.trim().is_empty() {
            return Err(StoreError::Config {
                message: "db_name must not be empty".to_string(),
            });
        }
        if self.db_name.contains(['/', '\\']) {
            return Err(StoreError::Config {
                message: format!("db_name '{}' must not contain path separators", self.db_name),
            });
        }
        if self.schema_version == 0 || self.schema_version > LATEST_VERSION {
            return Err(StoreError::Config {
                message: format!(
                    "schema_version {} is not supported (expected 1..={})",
                    self.schema_version, LATEST_VERSION
                ),
            });
        }
        Ok(())
    }

    pub fn database_dir(&self) -> PathBuf {
        self.data_dir.join(&self.db_name)
    }

    pub fn blocked_retry(&self) -> Duration {
        Duration::from_millis(self.blocked_retry_ms.max(1))
    }
}
