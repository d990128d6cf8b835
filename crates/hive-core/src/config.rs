//! hive.toml configuration parser.
//!
//! Every section is optional; omitted settings fall back to defaults.
//! [`HiveConfig::validate`] rejects malformed values up front so that
//! misconfiguration aborts startup instead of surfacing mid-run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capacity::{CPU, MEMORY, NETWORK_RX, NETWORK_TX};
use crate::duration::parse_duration;
use crate::types::HypervisorSettings;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HiveConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub estimator: EstimatorConfig,
    #[serde(default)]
    pub thresholds: ThresholdsConfig,
    #[serde(default)]
    pub placement: PlacementConfig,
    #[serde(default)]
    pub reconfiguration: ReconfigurationConfig,
    #[serde(default)]
    pub relocation: RelocationConfig,
    #[serde(default)]
    pub dispatching: DispatchingConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub election: ElectionConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub actuator: ActuatorConfig,
}

/// Identity and addresses of this node (a group manager candidate).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub id: String,
    pub hostname: String,
    pub control_address: String,
    pub monitoring_address: String,
    /// Where heartbeats are sent. A multicast or broadcast address reaches
    /// the other group managers; a unicast one keeps the node standalone.
    pub heartbeat_address: String,
    /// Local address the heartbeat listener binds.
    pub heartbeat_bind: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "gm-1".to_string(),
            hostname: "localhost".to_string(),
            control_address: "127.0.0.1:5000".to_string(),
            monitoring_address: "127.0.0.1:5001".to_string(),
            heartbeat_address: "127.0.0.1:9000".to_string(),
            heartbeat_bind: "0.0.0.0:9000".to_string(),
        }
    }
}

impl NodeConfig {
    /// Whether heartbeats go to a multicast or broadcast address, i.e. other
    /// group managers are expected to hear them.
    pub fn announces_to_peers(&self) -> bool {
        match self.heartbeat_address.parse::<std::net::SocketAddr>() {
            Ok(std::net::SocketAddr::V4(addr)) => addr.ip().is_multicast() || addr.ip().is_broadcast(),
            Ok(std::net::SocketAddr::V6(addr)) => addr.ip().is_multicast(),
            Err(_) => false,
        }
    }
}

/// How a history of samples collapses into a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
    #[default]
    Average,
    MostRecent,
    Weighted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub aggregation: AggregationPolicy,
    /// Multiplier on active capacity (>1.0 allows oversubscription).
    pub packing_density: f64,
    /// Use requested capacity instead of monitoring history for VM demand.
    pub static_estimation: bool,
    /// Monitoring entries considered per estimate.
    pub number_of_monitoring_entries: usize,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            aggregation: AggregationPolicy::Average,
            packing_density: 1.0,
            static_estimation: false,
            number_of_monitoring_entries: 10,
        }
    }
}

/// Utilization thresholds `[min, mid, max]` as fractions of total capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdsConfig {
    pub cpu: [f64; 3],
    pub memory: [f64; 3],
    pub network: [f64; 3],
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            cpu: [0.2, 0.5, 0.9],
            memory: [0.2, 0.5, 0.9],
            network: [0.2, 0.5, 0.9],
        }
    }
}

impl ThresholdsConfig {
    /// Thresholds for a capacity dimension index.
    pub fn for_dimension(&self, dimension: usize) -> [f64; 3] {
        match dimension {
            CPU => self.cpu,
            MEMORY => self.memory,
            NETWORK_RX | NETWORK_TX => self.network,
            _ => [0.0, 0.5, 1.0],
        }
    }

    pub fn min(&self, dimension: usize) -> f64 {
        self.for_dimension(dimension)[0]
    }

    pub fn mid(&self, dimension: usize) -> f64 {
        self.for_dimension(dimension)[1]
    }

    pub fn max(&self, dimension: usize) -> f64 {
        self.for_dimension(dimension)[2]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlacementStrategy {
    #[default]
    FirstFit,
    RoundRobin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    pub strategy: PlacementStrategy,
    /// Pre-sort local controllers by decreasing free capacity.
    pub sort_local_controllers: bool,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            strategy: PlacementStrategy::FirstFit,
            sort_local_controllers: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconfigurationConfig {
    pub enabled: bool,
    pub interval: String,
    /// Upper bound on migrations emitted by one consolidation pass.
    pub max_migrations: usize,
}

impl Default for ReconfigurationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: "10m".to_string(),
            max_migrations: 32,
        }
    }
}

impl ReconfigurationConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(600))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelocationConfig {
    /// Relieve overloaded local controllers.
    pub overload: bool,
    /// Evacuate underloaded local controllers so they can be released.
    pub underload: bool,
}

impl Default for RelocationConfig {
    fn default() -> Self {
        Self {
            overload: true,
            underload: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchingStrategy {
    #[default]
    FirstFit,
    RoundRobin,
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DispatchingConfig {
    pub strategy: DispatchingStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Registered detector name ("threshold", "noop").
    pub detector: String,
    pub interval: String,
    pub number_of_monitoring_entries: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            detector: "threshold".to_string(),
            interval: "30s".to_string(),
            number_of_monitoring_entries: 5,
        }
    }
}

impl AnomalyConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(30))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval: String,
    /// Silence after which the peer is considered failed.
    pub timeout: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: "3s".to_string(),
            timeout: "10s".to_string(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(3))
    }

    pub fn timeout(&self) -> Duration {
        parse_duration(&self.timeout).unwrap_or(Duration::from_secs(10))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Lease duration granted to the leader.
    pub lease: String,
    pub renew_interval: String,
    /// Consecutive coordination errors tolerated before giving up.
    pub max_consecutive_failures: u32,
    /// Lease file shared by every candidate, e.g. on a shared volume. When
    /// unset the lease lives in this node's own store.
    pub lease_store: Option<String>,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lease: "10s".to_string(),
            renew_interval: "3s".to_string(),
            max_consecutive_failures: 5,
            lease_store: None,
        }
    }
}

impl ElectionConfig {
    pub fn lease(&self) -> Duration {
        parse_duration(&self.lease).unwrap_or(Duration::from_secs(10))
    }

    pub fn renew_interval(&self) -> Duration {
        parse_duration(&self.renew_interval).unwrap_or(Duration::from_secs(3))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Monitoring entries retained per entity.
    pub retention: usize,
    pub summary_interval: String,
    /// Silence after which a member is declared failed.
    pub dead_timeout: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            retention: 20,
            summary_interval: "10s".to_string(),
            dead_timeout: "30s".to_string(),
        }
    }
}

impl MonitoringConfig {
    pub fn summary_interval(&self) -> Duration {
        parse_duration(&self.summary_interval).unwrap_or(Duration::from_secs(10))
    }

    pub fn dead_timeout(&self) -> Duration {
        parse_duration(&self.dead_timeout).unwrap_or(Duration::from_secs(30))
    }
}

/// How commands reach local controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorMode {
    /// JSON commands over HTTP/1 to each controller's control address.
    #[default]
    Http,
    /// Accept every command without contacting any host.
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorConfig {
    pub mode: ActuatorMode,
    /// A migration still pending after this long is abandoned.
    pub migration_timeout: String,
    pub request_timeout: String,
    /// Hypervisor endpoint settings handed to migration destinations.
    pub hypervisor: HypervisorSettings,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            mode: ActuatorMode::Http,
            migration_timeout: "5m".to_string(),
            request_timeout: "30s".to_string(),
            hypervisor: HypervisorSettings::default(),
        }
    }
}

impl ActuatorConfig {
    pub fn migration_timeout(&self) -> Duration {
        parse_duration(&self.migration_timeout).unwrap_or(Duration::from_secs(300))
    }

    pub fn request_timeout(&self) -> Duration {
        parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(30))
    }
}

impl HiveConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: HiveConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings that would make the control plane misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.id.trim().is_empty() {
            return Err(invalid("node.id", "must not be empty"));
        }
        for (field, addr) in [
            ("node.control_address", &self.node.control_address),
            ("node.heartbeat_address", &self.node.heartbeat_address),
            ("node.heartbeat_bind", &self.node.heartbeat_bind),
        ] {
            if addr.parse::<std::net::SocketAddr>().is_err() {
                return Err(invalid(field, format!("`{addr}` is not an ip:port address")));
            }
        }

        let density = self.estimator.packing_density;
        if !density.is_finite() || density <= 0.0 {
            return Err(invalid(
                "estimator.packing_density",
                format!("must be a positive number, got {density}"),
            ));
        }
        if self.estimator.number_of_monitoring_entries == 0 {
            return Err(invalid("estimator.number_of_monitoring_entries", "must be at least 1"));
        }
        if self.anomaly.number_of_monitoring_entries == 0 {
            return Err(invalid("anomaly.number_of_monitoring_entries", "must be at least 1"));
        }
        if self.monitoring.retention == 0 {
            return Err(invalid("monitoring.retention", "must be at least 1"));
        }

        for (field, [min, mid, max]) in [
            ("thresholds.cpu", self.thresholds.cpu),
            ("thresholds.memory", self.thresholds.memory),
            ("thresholds.network", self.thresholds.network),
        ] {
            let ordered = 0.0 <= min && min <= mid && mid <= max && max <= 1.0;
            if !ordered {
                return Err(invalid(
                    field,
                    format!("expected 0 <= min <= mid <= max <= 1, got [{min}, {mid}, {max}]"),
                ));
            }
        }

        for (field, value) in [
            ("reconfiguration.interval", &self.reconfiguration.interval),
            ("anomaly.interval", &self.anomaly.interval),
            ("heartbeat.interval", &self.heartbeat.interval),
            ("heartbeat.timeout", &self.heartbeat.timeout),
            ("election.lease", &self.election.lease),
            ("election.renew_interval", &self.election.renew_interval),
            ("monitoring.summary_interval", &self.monitoring.summary_interval),
            ("monitoring.dead_timeout", &self.monitoring.dead_timeout),
            ("actuator.migration_timeout", &self.actuator.migration_timeout),
            ("actuator.request_timeout", &self.actuator.request_timeout),
        ] {
            match parse_duration(value) {
                Some(d) if !d.is_zero() => {}
                _ => return Err(invalid(field, format!("`{value}` is not a positive duration"))),
            }
        }

        if self.heartbeat.timeout() <= self.heartbeat.interval() {
            return Err(invalid(
                "heartbeat.timeout",
                "must be longer than heartbeat.interval",
            ));
        }
        if self.election.renew_interval() >= self.election.lease() {
            return Err(invalid(
                "election.renew_interval",
                "must be shorter than election.lease",
            ));
        }
        if self.node.announces_to_peers() && self.election.lease_store.is_none() {
            return Err(invalid(
                "election.lease_store",
                format!(
                    "required when heartbeats go to {}; a lease private to each node elects every node",
                    self.node.heartbeat_address
                ),
            ));
        }

        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        HiveConfig::default().validate().unwrap();
    }

    #[test]
    fn parse_minimal() {
        let toml_str = r#"
[node]
id = "gm-7"
"#;
        let config: HiveConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.node.id, "gm-7");
        assert_eq!(config.estimator.aggregation, AggregationPolicy::Average);
        config.validate().unwrap();
    }

    #[test]
    fn parse_full_sections() {
        let toml_str = r#"
[estimator]
aggregation = "weighted"
packing_density = 1.2
number_of_monitoring_entries = 4

[placement]
strategy = "round_robin"

[dispatching]
strategy = "random"

[anomaly]
detector = "noop"
interval = "500ms"

[actuator]
mode = "simulated"

[actuator.hypervisor]
driver = "xen"
"#;
        let config: HiveConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.estimator.aggregation, AggregationPolicy::Weighted);
        assert_eq!(config.placement.strategy, PlacementStrategy::RoundRobin);
        assert_eq!(config.dispatching.strategy, DispatchingStrategy::Random);
        assert_eq!(config.anomaly.interval(), Duration::from_millis(500));
        assert_eq!(config.actuator.mode, ActuatorMode::Simulated);
        assert_eq!(config.actuator.hypervisor.driver, "xen");
        assert_eq!(config.actuator.hypervisor.port, 16509);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_aggregation_is_a_parse_error() {
        let toml_str = r#"
[estimator]
aggregation = "median"
"#;
        assert!(toml::from_str::<HiveConfig>(toml_str).is_err());
    }

    #[test]
    fn rejects_non_positive_packing_density() {
        let mut config = HiveConfig::default();
        config.estimator.packing_density = 0.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("packing_density"));
    }

    #[test]
    fn rejects_unordered_thresholds() {
        let mut config = HiveConfig::default();
        config.thresholds.memory = [0.5, 0.4, 0.9];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_duration() {
        let mut config = HiveConfig::default();
        config.heartbeat.timeout = "forever".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_timeout_shorter_than_interval() {
        let mut config = HiveConfig::default();
        config.heartbeat.interval = "10s".to_string();
        config.heartbeat.timeout = "5s".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_address() {
        let mut config = HiveConfig::default();
        config.node.control_address = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn peer_heartbeats_need_a_shared_lease() {
        let mut config = HiveConfig::default();
        config.node.heartbeat_address = "239.255.42.1:9000".to_string();
        assert!(config.node.announces_to_peers());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("election.lease_store"));

        config.election.lease_store = Some("/shared/hivegrid/leases.redb".to_string());
        config.validate().unwrap();

        config.node.heartbeat_address = "255.255.255.255:9000".to_string();
        assert!(config.node.announces_to_peers());
        config.node.heartbeat_address = "10.0.0.4:9000".to_string();
        assert!(!config.node.announces_to_peers());
    }

    #[test]
    fn toml_roundtrip_keeps_settings() {
        let mut config = HiveConfig::default();
        config.reconfiguration.enabled = true;
        let text = config.to_toml_string().unwrap();
        let back: HiveConfig = toml::from_str(&text).unwrap();
        assert!(back.reconfiguration.enabled);
    }

    #[test]
    fn network_thresholds_cover_both_directions() {
        let t = ThresholdsConfig {
            network: [0.1, 0.4, 0.8],
            ..Default::default()
        };
        assert_eq!(t.max(NETWORK_RX), 0.8);
        assert_eq!(t.max(NETWORK_TX), 0.8);
        assert_eq!(t.min(CPU), 0.2);
    }
}
