//! Daemon configuration, read from a TOML file.
//!
//! ```toml
//! data_dir = "/var/lib/depot"
//! log_level = "info"
//!
//! [compaction]
//! interval_secs = 3600
//! inactivity_secs = 86400
//! concurrency = 2
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use blobstore::CompactionSettings;
use serde::{Deserialize, Serialize};

/// Name of the SQLite file holding blob store configurations, relative to
/// the data directory.
pub const DATABASE_FILE: &str = "stores.db";
/// Directory under the data directory where file stores are placed by default.
pub const BLOBS_DIR: &str = "blobs";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Root for the configuration database and default store locations
    pub data_dir: PathBuf,
    /// Override for the configuration database path
    pub database: Option<PathBuf>,
    /// Default tracing filter; `RUST_LOG` takes precedence
    pub log_level: String,
    pub compaction: CompactionConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("depot-data"),
            database: None,
            log_level: "info".to_string(),
            compaction: CompactionConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::parse(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| self.data_dir.join(DATABASE_FILE))
    }

    /// Default location of a file store named `name`.
    pub fn store_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(BLOBS_DIR).join(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompactionConfig {
    /// Seconds between scheduled runs of `serve`
    pub interval_secs: u64,
    /// Deleted blobs younger than this are kept
    pub inactivity_secs: u64,
    pub concurrency: usize,
    pub queue_capacity: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        let settings = CompactionSettings::default();
        Self {
            interval_secs: 3600,
            inactivity_secs: 24 * 3600,
            concurrency: settings.concurrency,
            queue_capacity: settings.queue_capacity,
        }
    }
}

impl CompactionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn inactivity(&self) -> Duration {
        Duration::from_secs(self.inactivity_secs)
    }

    pub fn settings(&self) -> CompactionSettings {
        CompactionSettings {
            concurrency: self.concurrency.max(1),
            queue_capacity: self.queue_capacity.max(1),
        }
    }
}
