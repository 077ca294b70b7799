//! # Server Configuration
//!
//! Purpose: Declare every recognized configuration key with its default, load
//! overrides from a JSON file, and derive the fixed port offsets for the
//! replication and cluster listeners.
//!
//! ## Design Principles
//! 1. **Defaults First**: A zero-file start must come up with sane values.
//! 2. **Strict Keys**: Unknown keys are rejected instead of silently ignored.
//! 3. **Derived Ports**: Replication and cluster ports are computed from the
//!    command port, never configured independently.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RudisError, RudisResult};

/// Offset from the command port to the primary replication port.
pub const REPLICATION_PORT_OFFSET: u16 = 11000;
/// Offset from the command port to the fallback replication port.
pub const REPLICATION_FALLBACK_OFFSET: u16 = 11001;
/// Offset from the command port to the cluster gossip port.
pub const CLUSTER_PORT_OFFSET: u16 = 20000;

/// Persistence strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceMode {
    /// Periodic full snapshots.
    Rdb,
    /// Append-only command log.
    Aof,
}

/// Append-log flush policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AofFsync {
    /// Flush after every append.
    Always,
    /// Background flush once per second.
    Everysec,
    /// Rely on OS buffering.
    No,
}

/// Role of this node in the replication topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Slave,
}

impl NodeRole {
    /// Lowercase name used by `INFO` and `ROLE` replies.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Master => "master",
            NodeRole::Slave => "slave",
        }
    }
}

/// One configured peer in `slave_nodes`, parsed from `id:host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveNode {
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl SlaveNode {
    fn parse(raw: &str) -> RudisResult<Self> {
        let mut parts = raw.splitn(3, ':');
        let id = parts.next().unwrap_or_default();
        let host = parts.next().unwrap_or_default();
        let port = parts.next().unwrap_or_default();
        if id.is_empty() || host.is_empty() {
            return Err(RudisError::Protocol(format!(
                "invalid slave node entry '{raw}', expected id:host:port"
            )));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| RudisError::Protocol(format!("invalid port in slave node entry '{raw}'")))?;
        Ok(SlaveNode {
            id: id.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

/// Full server configuration with the defaults of a standalone master.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Listen address for the command port.
    pub host: String,
    /// Command port; replication and cluster ports are derived from it.
    pub port: u16,
    /// Number of independent shards addressable with `SELECT`.
    pub database_count: usize,
    /// Directory holding `dump.rdb` and `appendonly.aof`.
    pub data_dir: PathBuf,

    /// Active persistence strategy.
    pub persistence_mode: PersistenceMode,
    /// Gzip-compress the snapshot body.
    pub rdb_compression: bool,
    /// Seconds between periodic snapshot saves.
    pub rdb_save_interval: u64,
    /// Append-log flush policy.
    pub aof_fsync: AofFsync,
    /// Append-log size (bytes) beyond which a rewrite is triggered.
    pub aof_rewrite_size: u64,

    /// Whether the gossip subsystem runs at all.
    pub cluster_enabled: bool,
    /// Identifier of this node in the cluster registry.
    pub node_id: String,
    /// Configured role of this node.
    pub node_role: NodeRole,
    /// Master host a slave pulls from.
    pub master_host: String,
    /// Master command port a slave pulls from.
    pub master_port: u16,
    /// Identifier of the master this slave follows.
    pub master_id: String,
    /// Known peers as `id:host:port` entries.
    pub slave_nodes: Vec<String>,

    /// Seconds between heartbeat broadcasts.
    pub heartbeat_interval: u64,
    /// Seconds between suspect-status sweeps.
    pub node_status_interval: u64,
    /// Seconds without a heartbeat before a peer turns suspect.
    pub node_timeout: u64,
    /// Seconds between slave snapshot pulls.
    pub sync_interval: u64,
    /// Replication connect timeout in milliseconds.
    pub sync_connect_timeout_ms: u64,
    /// Replication read timeout in milliseconds.
    pub sync_read_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database_count: 16,
            data_dir: PathBuf::from("db"),
            persistence_mode: PersistenceMode::Rdb,
            rdb_compression: true,
            rdb_save_interval: 60,
            aof_fsync: AofFsync::Everysec,
            aof_rewrite_size: 64 * 1024 * 1024,
            cluster_enabled: false,
            node_id: "node1".to_string(),
            node_role: NodeRole::Master,
            master_host: "127.0.0.1".to_string(),
            master_port: 6379,
            master_id: "master".to_string(),
            slave_nodes: Vec::new(),
            heartbeat_interval: 5,
            node_status_interval: 10,
            node_timeout: 30,
            sync_interval: 5,
            sync_connect_timeout_ms: 5000,
            sync_read_timeout_ms: 60000,
        }
    }
}

impl Config {
    /// Loads configuration from a JSON file, filling omitted keys with
    /// defaults and rejecting unknown keys.
    pub fn from_file(path: &Path) -> RudisResult<Self> {
        let raw = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|err| RudisError::Protocol(format!("invalid config file: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity checks that cannot be expressed in the type system.
    pub fn validate(&self) -> RudisResult<()> {
        if self.database_count == 0 || self.database_count > 100 {
            return Err(RudisError::Protocol(format!(
                "database_count must be in 1..=100, got {}",
                self.database_count
            )));
        }
        for raw in &self.slave_nodes {
            SlaveNode::parse(raw)?;
        }
        Ok(())
    }

    /// Primary replication port for this node.
    pub fn replication_port(&self) -> u16 {
        self.port.wrapping_add(REPLICATION_PORT_OFFSET)
    }

    /// Fallback replication port, tried when the primary fails to bind.
    pub fn replication_fallback_port(&self) -> u16 {
        self.port.wrapping_add(REPLICATION_FALLBACK_OFFSET)
    }

    /// Cluster gossip port for this node.
    pub fn cluster_port(&self) -> u16 {
        self.port.wrapping_add(CLUSTER_PORT_OFFSET)
    }

    /// Parsed view of `slave_nodes`; invalid entries were rejected at load.
    pub fn peers(&self) -> Vec<SlaveNode> {
        self.slave_nodes
            .iter()
            .filter_map(|raw| SlaveNode::parse(raw).ok())
            .collect()
    }

    /// Path of the snapshot file.
    pub fn rdb_path(&self) -> PathBuf {
        self.data_dir.join("dump.rdb")
    }

    /// Path of the append-log file.
    pub fn aof_path(&self) -> PathBuf {
        self.data_dir.join("appendonly.aof")
    }

    pub fn sync_interval_duration(&self) -> Duration {
        Duration::from_secs(self.sync_interval)
    }

    pub fn sync_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_connect_timeout_ms)
    }

    pub fn sync_read_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_read_timeout_ms)
    }

    pub fn heartbeat_interval_duration(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    pub fn node_status_interval_duration(&self) -> Duration {
        Duration::from_secs(self.node_status_interval)
    }

    pub fn node_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.node_timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 6379);
        assert_eq!(config.database_count, 16);
        assert_eq!(config.persistence_mode, PersistenceMode::Rdb);
        assert!(config.rdb_compression);
        assert_eq!(config.rdb_save_interval, 60);
        assert_eq!(config.aof_fsync, AofFsync::Everysec);
        assert_eq!(config.aof_rewrite_size, 64 * 1024 * 1024);
        assert_eq!(config.node_role, NodeRole::Master);
        assert_eq!(config.sync_interval, 5);
        assert_eq!(config.sync_connect_timeout_ms, 5000);
        assert_eq!(config.sync_read_timeout_ms, 60000);
    }

    #[test]
    fn derived_ports_use_fixed_offsets() {
        let config = Config::default();
        assert_eq!(config.replication_port(), 6379 + 11000);
        assert_eq!(config.replication_fallback_port(), 6379 + 11001);
        assert_eq!(config.cluster_port(), 6379 + 20000);
    }

    #[test]
    fn file_overrides_merge_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            "{}",
            r#"{"port": 7000, "persistence_mode": "aof", "node_role": "slave"}"#
        )
        .expect("write");

        let config = Config::from_file(file.path()).expect("load");
        assert_eq!(config.port, 7000);
        assert_eq!(config.persistence_mode, PersistenceMode::Aof);
        assert_eq!(config.node_role, NodeRole::Slave);
        // Untouched keys keep defaults.
        assert_eq!(config.database_count, 16);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, "{}", r#"{"no_such_key": 1}"#).expect("write");
        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn slave_node_entries_parse() {
        let node = SlaveNode::parse("node2:10.0.0.2:6380").expect("parse");
        assert_eq!(node.id, "node2");
        assert_eq!(node.host, "10.0.0.2");
        assert_eq!(node.port, 6380);

        assert!(SlaveNode::parse("garbage").is_err());
        assert!(SlaveNode::parse("id:host:notaport").is_err());
    }
}
