//! Configuration for the failover controller

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Startup policy for persisted state (masters or raft peers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StartupState {
    /// Discard whatever was saved before and use the configured values.
    New,
    /// Merge the configured values into what was saved before.
    #[default]
    Existing,
}

/// Which consensus backend keeps the controllers in agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Broker {
    /// Single process, registry mutated in place.
    #[default]
    None,
    /// Log-replicated state machine among static peers.
    Raft,
    /// Leader election over a coordination service.
    Coord,
}

impl std::fmt::Display for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Broker::None => write!(f, "none"),
            Broker::Raft => write!(f, "raft"),
            Broker::Coord => write!(f, "coord"),
        }
    }
}

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Control surface listen address, also this controller's identity
    #[serde(default = "default_addr")]
    pub addr: String,

    /// Masters to monitor at startup
    #[serde(default)]
    pub masters: Vec<String>,

    /// Whether `masters` replaces or extends the saved registry
    #[serde(default)]
    pub masters_state: StartupState,

    /// Probe interval in milliseconds
    #[serde(default = "default_check_interval")]
    pub check_interval: i64,

    /// Seconds a master may stay unreachable before failover
    #[serde(default = "default_max_down_time")]
    pub max_down_time: i64,

    #[serde(default)]
    pub broker: Broker,

    #[serde(default)]
    pub raft: RaftConfig,

    #[serde(default)]
    pub coord: CoordConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_addr() -> String {
    "0.0.0.0:11000".to_string()
}
fn default_check_interval() -> i64 {
    1000
}
fn default_max_down_time() -> i64 {
    3
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Raft backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Raft listen address; empty disables the backend
    #[serde(default)]
    pub addr: String,

    /// Directory for the raft log, vote and snapshots
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Other peers of the raft group
    #[serde(default)]
    pub cluster: Vec<String>,

    #[serde(default)]
    pub cluster_state: StartupState,

    /// Applied entries between two snapshots
    #[serde(default = "default_snapshot_logs")]
    pub snapshot_logs: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_election_timeout")]
    pub election_timeout_ms: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./var/store")
}
fn default_snapshot_logs() -> u64 {
    1000
}
fn default_heartbeat_interval() -> u64 {
    500
}
fn default_election_timeout() -> u64 {
    1500
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            addr: String::new(),
            data_dir: default_data_dir(),
            cluster: Vec::new(),
            cluster_state: StartupState::Existing,
            snapshot_logs: default_snapshot_logs(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            election_timeout_ms: default_election_timeout(),
        }
    }
}

/// Coordination service backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordConfig {
    /// etcd endpoints; `["memory"]` runs against an in-process store
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Root of the controller namespace
    #[serde(default = "default_base_dir")]
    pub base_dir: String,

    /// Session lease TTL in seconds
    #[serde(default = "default_session_ttl")]
    pub session_ttl: i64,
}

fn default_base_dir() -> String {
    "/failoverd".to_string()
}
fn default_session_ttl() -> i64 {
    10
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            base_dir: default_base_dir(),
            session_ttl: default_session_ttl(),
        }
    }
}

impl CoordConfig {
    pub fn is_memory(&self) -> bool {
        self.endpoints.len() == 1 && self.endpoints[0] == "memory"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            masters: Vec::new(),
            masters_state: StartupState::Existing,
            check_interval: default_check_interval(),
            max_down_time: default_max_down_time(),
            broker: Broker::None,
            raft: RaftConfig::default(),
            coord: CoordConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, with
    /// `FAILOVERD__SECTION__KEY` environment variables layered on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("FAILOVERD")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("masters")
                .with_list_parse_key("raft.cluster")
                .with_list_parse_key("coord.endpoints")
                .try_parsing(true),
        );

        let cfg: Config = builder.build()?.try_deserialize()?;
        cfg.normalized()
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(data: &str) -> Result<Self> {
        let cfg: Config = config::Config::builder()
            .add_source(config::File::from_str(data, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        cfg.normalized()
    }

    /// Apply fallbacks for non-positive intervals and validate the backend section.
    pub fn normalized(mut self) -> Result<Self> {
        if self.max_down_time <= 0 {
            self.max_down_time = default_max_down_time();
        }
        if self.check_interval <= 0 {
            self.check_interval = default_check_interval();
        }
        self.masters.retain(|m| !m.trim().is_empty());

        if self.broker == Broker::Coord {
            if self.coord.endpoints.is_empty() {
                return Err(Error::InvalidConfig(
                    "coord broker needs at least one endpoint".into(),
                ));
            }
            if !self.coord.base_dir.starts_with('/') || self.coord.base_dir.len() < 2 {
                return Err(Error::InvalidConfig(format!(
                    "invalid coord base dir {}, must be an absolute path",
                    self.coord.base_dir
                )));
            }
            if self.coord.session_ttl < 2 {
                return Err(Error::InvalidConfig("coord session_ttl must be >= 2".into()));
            }
        }
        Ok(self)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval as u64)
    }

    pub fn max_down_time(&self) -> Duration {
        Duration::from_secs(self.max_down_time as u64)
    }
}
