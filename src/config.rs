//! Brickline Configuration
//!
//! Configuration structures for a brickline replica process, loaded
//! from TOML with per-field defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main brickline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BricklineConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Volume identity (consumed by the transport/bootstrap layer)
    pub volume: VolumeConfig,

    /// Replication configuration
    #[serde(default)]
    pub replication: ReplicationSettings,

    /// Journal configuration
    #[serde(default)]
    pub journal: JournalConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Address to bind for replica communication
    pub bind_address: String,

    /// Data directory for journal and state storage
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Volume and brick identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Volume name
    pub name: String,

    /// Addresses of all bricks in the replica set; the first entry is
    /// the local brick
    pub bricks: Vec<String>,
}

/// Replication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Fixed role. `true` pins this brick as leader, `false` pins it as
    /// follower; absent means derive the role from liveness ("leader iff
    /// this is the only brick up").
    #[serde(default)]
    pub leader: Option<bool>,

    /// Fraction of the N-1 peer bricks required for quorum, in percent
    #[serde(default = "default_quorum_percent")]
    pub quorum_percent: f64,

    /// Background durability flush interval in seconds
    #[serde(default = "default_fsync_interval_secs")]
    pub fsync_interval_secs: u64,
}

/// Journal configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JournalConfig {
    /// Journal directory (defaults to `<data_dir>/journal`)
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_quorum_percent() -> f64 {
    50.0
}

fn default_fsync_interval_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/brickline")
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            leader: None,
            quorum_percent: default_quorum_percent(),
            fsync_interval_secs: default_fsync_interval_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl BricklineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: BricklineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.volume.bricks.is_empty() {
            return Err(crate::Error::Config(
                "volume.bricks cannot be empty".into(),
            ));
        }

        let q = self.replication.quorum_percent;
        if !(q > 0.0 && q <= 100.0) {
            return Err(crate::Error::Config(format!(
                "replication.quorum_percent must be in (0, 100], got {}",
                q
            )));
        }

        Ok(())
    }

    /// Get the journal directory path
    pub fn journal_dir(&self) -> PathBuf {
        self.journal
            .dir
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("journal"))
    }

    /// Get the background durability flush interval as a Duration
    pub fn fsync_interval(&self) -> Duration {
        Duration::from_secs(self.replication.fsync_interval_secs)
    }
}
