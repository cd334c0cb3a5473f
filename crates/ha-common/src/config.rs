//! ---
//! ha_section: "01-core-functionality"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Shared primitives for the fleet-ha arbiter runtime."
//! ha_version: "v0.1.0"
//! ha_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_priority() -> i32 {
    0
}

fn default_fleet_address() -> String {
    "http://127.0.0.1:50051".to_owned()
}

fn default_peer_address() -> String {
    "http://127.0.0.1:50053".to_owned()
}

fn default_peer_listen() -> SocketAddr {
    "0.0.0.0:50052".parse().expect("valid default peer listen")
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_fleet_heartbeat_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_peer_heartbeat_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_keepalive_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_keepalive_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_broadcast_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_listen() -> SocketAddr {
    "0.0.0.0:8080".parse().expect("valid default api address")
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Authority state of an arbiter node.
///
/// The default comes from static configuration; afterwards the value is
/// mutated only by the arbiter's resolution rule. `Candidate` is a
/// transient state passed through during self-promotion and is rejected
/// as an initial role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Standby node deferring to the current master.
    #[default]
    Slave,
    /// Internal waypoint of the self-promotion path. Both transitions
    /// happen inside one critical section, so readers never see it.
    Candidate,
    /// Authoritative node.
    Master,
}

impl Role {
    /// Wire encoding used by the peer arbitration record.
    pub fn as_wire(self) -> i32 {
        match self {
            Role::Slave => 0,
            Role::Candidate => 1,
            Role::Master => 2,
        }
    }

    /// Decode the wire encoding, rejecting unknown values.
    pub fn from_wire(value: i32) -> Option<Role> {
        match value {
            0 => Some(Role::Slave),
            1 => Some(Role::Candidate),
            2 => Some(Role::Master),
            _ => None,
        }
    }

    /// True when this node currently holds authority.
    pub fn is_master(self) -> bool {
        matches!(self, Role::Master)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Slave => write!(f, "slave"),
            Role::Candidate => write!(f, "candidate"),
            Role::Master => write!(f, "master"),
        }
    }
}

/// Primary configuration object for an arbiter node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Identity and initial election state of this node.
    pub node: NodeConfig,
    /// Fleet backend link settings.
    #[serde(default)]
    pub fleet: FleetLinkConfig,
    /// Peer HA link settings (client and server side).
    #[serde(default)]
    pub peer: PeerLinkConfig,
    /// Staleness monitor and broadcaster cadence.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// REST health projection settings.
    #[serde(default)]
    pub api: ApiConfig,
    /// Tracing output settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    /// The parsed and validated configuration.
    pub config: AppConfig,
    /// Path the configuration was read from.
    pub source: PathBuf,
}

impl AppConfig {
    /// Environment variable overriding the configuration path.
    pub const ENV_CONFIG_PATH: &'static str = "FLEET_HA_CONFIG";

    /// Load configuration from disk, respecting the `FLEET_HA_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = serde_yaml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.node.validate()?;
        self.fleet.validate()?;
        self.peer.validate()?;
        self.monitor.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            serde_yaml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Identity and election defaults for this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name carried in the peer arbitration record.
    pub name: String,
    /// Role the node assumes at startup.
    #[serde(default)]
    pub initial_role: Role,
    /// Static tie-break value used when terms are equal. Immutable for
    /// the node's lifetime.
    #[serde(default = "default_priority")]
    pub priority: i32,
}

impl NodeConfig {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("node.name must not be empty"));
        }
        if self.initial_role == Role::Candidate {
            return Err(anyhow!(
                "node.initial_role must be 'master' or 'slave'; candidate is transient"
            ));
        }
        Ok(())
    }
}

/// Settings for the outbound duplex link to the Fleet backend.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetLinkConfig {
    /// Fleet backend endpoint, e.g. `http://fleet:50051`.
    #[serde(default = "default_fleet_address")]
    pub address: String,
    /// Cadence of outbound heartbeat messages.
    #[serde(default = "default_heartbeat_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub heartbeat_interval: Duration,
    /// Inbound silence after which the Fleet link is judged stale.
    #[serde(default = "default_fleet_heartbeat_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub heartbeat_timeout: Duration,
    /// Delay between reconnect attempts while the link is down.
    #[serde(default = "default_reconnect_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub reconnect_delay: Duration,
    /// HTTP/2 keepalive ping interval on the transport channel.
    #[serde(default = "default_keepalive_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keepalive_interval: Duration,
    /// HTTP/2 keepalive ping timeout on the transport channel.
    #[serde(default = "default_keepalive_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keepalive_timeout: Duration,
}

impl Default for FleetLinkConfig {
    fn default() -> Self {
        Self {
            address: default_fleet_address(),
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout: default_fleet_heartbeat_timeout(),
            reconnect_delay: default_reconnect_delay(),
            keepalive_interval: default_keepalive_interval(),
            keepalive_timeout: default_keepalive_timeout(),
        }
    }
}

impl FleetLinkConfig {
    fn validate(&self) -> Result<()> {
        validate_link("fleet", &self.address, self.heartbeat_interval, self.heartbeat_timeout)
    }
}

/// Settings for the duplex link to the redundant peer instance.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerLinkConfig {
    /// Listener accepting the peer's inbound stream.
    #[serde(default = "default_peer_listen")]
    pub listen: SocketAddr,
    /// Endpoint of the peer instance, e.g. `http://ha-b:50052`.
    #[serde(default = "default_peer_address")]
    pub address: String,
    /// Cadence of outbound heartbeat messages, also used by the
    /// per-session heartbeat sender on the server side.
    #[serde(default = "default_heartbeat_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub heartbeat_interval: Duration,
    /// Inbound silence after which the peer is judged stale.
    #[serde(default = "default_peer_heartbeat_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub heartbeat_timeout: Duration,
    /// Delay between reconnect attempts while the link is down.
    #[serde(default = "default_reconnect_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub reconnect_delay: Duration,
    /// HTTP/2 keepalive ping interval on the transport channel.
    #[serde(default = "default_keepalive_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keepalive_interval: Duration,
    /// HTTP/2 keepalive ping timeout on the transport channel.
    #[serde(default = "default_keepalive_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keepalive_timeout: Duration,
    /// When true, a slave whose peer heartbeat went stale promotes
    /// itself to master. Off by default; split-brain on peer return is
    /// settled by the priority tie-break.
    #[serde(default)]
    pub promote_on_peer_loss: bool,
}

impl Default for PeerLinkConfig {
    fn default() -> Self {
        Self {
            listen: default_peer_listen(),
            address: default_peer_address(),
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout: default_peer_heartbeat_timeout(),
            reconnect_delay: default_reconnect_delay(),
            keepalive_interval: default_keepalive_interval(),
            keepalive_timeout: default_keepalive_timeout(),
            promote_on_peer_loss: false,
        }
    }
}

impl PeerLinkConfig {
    fn validate(&self) -> Result<()> {
        validate_link("peer", &self.address, self.heartbeat_interval, self.heartbeat_timeout)?;
        let target = self
            .address
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .trim_end_matches('/');
        if let Ok(addr) = target.parse::<SocketAddr>() {
            let same_host = addr.ip() == self.listen.ip()
                || (addr.ip().is_loopback()
                    && (self.listen.ip().is_loopback() || self.listen.ip().is_unspecified()));
            if same_host && addr.port() == self.listen.port() {
                return Err(anyhow!(
                    "peer.address must not target peer.listen; a node cannot peer with itself"
                ));
            }
        }
        Ok(())
    }
}

fn validate_link(
    section: &str,
    address: &str,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
) -> Result<()> {
    if address.trim().is_empty() {
        return Err(anyhow!("{section}.address must not be empty"));
    }
    if heartbeat_interval.is_zero() {
        return Err(anyhow!("{section}.heartbeat_interval must be positive"));
    }
    if heartbeat_timeout.is_zero() {
        return Err(anyhow!("{section}.heartbeat_timeout must be positive"));
    }
    if heartbeat_timeout <= heartbeat_interval {
        return Err(anyhow!(
            "{section}.heartbeat_timeout must exceed the heartbeat interval"
        ));
    }
    Ok(())
}

/// Cadence of the staleness monitors and the peer-status broadcaster.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Interval at which the heartbeat monitors re-evaluate staleness.
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub poll_interval: Duration,
    /// Interval at which local status is pushed to the peer.
    #[serde(default = "default_broadcast_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub broadcast_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            broadcast_interval: default_broadcast_interval(),
        }
    }
}

impl MonitorConfig {
    fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(anyhow!("monitor.poll_interval must be positive"));
        }
        if self.broadcast_interval.is_zero() {
            return Err(anyhow!("monitor.broadcast_interval must be positive"));
        }
        Ok(())
    }
}

/// REST health projection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable the REST server.
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    /// Listen address for the REST server.
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen: default_api_listen(),
        }
    }
}

/// Tracing output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory receiving the rolling daily log file.
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    /// Stdout format.
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Log file name prefix; defaults to the service name.
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
node:
  name: ha-a
  initial_role: master
  priority: 10
"#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: AppConfig = MINIMAL.parse().expect("config parses");
        assert_eq!(config.node.name, "ha-a");
        assert_eq!(config.node.initial_role, Role::Master);
        assert_eq!(config.node.priority, 10);
        assert_eq!(config.fleet.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(config.peer.heartbeat_timeout, Duration::from_secs(5));
        assert_eq!(config.peer.reconnect_delay, Duration::from_secs(5));
        assert!(!config.peer.promote_on_peer_loss);
        assert!(config.api.enabled);
    }

    #[test]
    fn candidate_initial_role_is_rejected() {
        let raw = r#"
node:
  name: ha-a
  initial_role: candidate
"#;
        let err = raw.parse::<AppConfig>().expect_err("candidate rejected");
        assert!(err.to_string().contains("initial_role"));
    }

    #[test]
    fn empty_name_is_rejected() {
        let raw = r#"
node:
  name: "  "
"#;
        assert!(raw.parse::<AppConfig>().is_err());
    }

    #[test]
    fn timeout_must_exceed_interval() {
        let raw = r#"
node:
  name: ha-a
peer:
  heartbeat_interval: 5
  heartbeat_timeout: 5
"#;
        let err = raw.parse::<AppConfig>().expect_err("timeout rejected");
        assert!(err.to_string().contains("heartbeat_timeout"));
    }

    #[test]
    fn peer_address_must_not_be_the_own_listener() {
        let raw = r#"
node:
  name: ha-a
peer:
  listen: 0.0.0.0:50052
  address: http://127.0.0.1:50052
"#;
        let err = raw.parse::<AppConfig>().expect_err("self-dial rejected");
        assert!(err.to_string().contains("peer with itself"));
    }

    #[test]
    fn durations_deserialize_from_seconds() {
        let raw = r#"
node:
  name: ha-b
fleet:
  heartbeat_timeout: 45
  reconnect_delay: 2
"#;
        let config: AppConfig = raw.parse().expect("config parses");
        assert_eq!(config.fleet.heartbeat_timeout, Duration::from_secs(45));
        assert_eq!(config.fleet.reconnect_delay, Duration::from_secs(2));
    }

    #[test]
    fn role_wire_encoding_round_trips() {
        for role in [Role::Slave, Role::Candidate, Role::Master] {
            assert_eq!(Role::from_wire(role.as_wire()), Some(role));
        }
        assert_eq!(Role::from_wire(7), None);
    }
}
