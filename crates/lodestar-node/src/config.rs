//! Node configuration: TOML file contents and their conversion into the
//! library's strategy settings.
//!
//! Durations are whole seconds or milliseconds, as named by each field,
//! so the file stays readable without a duration syntax.

use std::net::{IpAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use lodestar_election::{
    BackoffPolicy, ElectorConfig, FileIdentitySource, FileRegistryConfig, HeartbeatConfig,
    MemberFilter, MulticastConfig, RegistryConfig,
};
use serde::{Deserialize, Serialize};

/// Which election strategy the node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Registry,
    Heartbeat,
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "registry" => Ok(Self::Registry),
            "heartbeat" => Ok(Self::Heartbeat),
            _ => Err(format!(
                "unknown strategy '{s}'. valid options: registry, heartbeat"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub strategy: StrategyKind,
    pub registry: RegistrySection,
    pub heartbeat: HeartbeatSection,
    pub backoff: BackoffSection,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Heartbeat,
            registry: RegistrySection::default(),
            heartbeat: HeartbeatSection::default(),
            backoff: BackoffSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// Registry file with one `<group> <identity>` entry per line.
    pub file: PathBuf,
    pub group: String,
    pub max_results: usize,
    /// File holding this instance's identity.
    pub identity_file: PathBuf,
    /// When set, the identity file is JSON and this field holds the
    /// identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_field: Option<String>,
    pub identity_attempts: u32,
    pub identity_retry_delay_ms: u64,
    pub recheck_interval_secs: u64,
    pub poll_interval_secs: u64,
    pub wait_timeout_secs: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        let registry = RegistryConfig::default();
        let file = FileRegistryConfig::default();
        Self {
            file: PathBuf::from("registry"),
            group: String::new(),
            max_results: registry.filter.max_results,
            identity_file: PathBuf::from("identity"),
            identity_field: None,
            identity_attempts: registry.identity_attempts,
            identity_retry_delay_ms: registry.identity_retry_delay.as_millis() as u64,
            recheck_interval_secs: registry.recheck_interval.as_secs(),
            poll_interval_secs: file.poll_interval.as_secs(),
            wait_timeout_secs: file.wait_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSection {
    pub name: String,
    pub service_type: String,
    pub host: IpAddr,
    pub port: u16,
    pub max_failed_responses: u32,
    pub poll_interval_ms: u64,
    pub scan_window_min_ms: u64,
    pub scan_window_max_ms: u64,
    /// Multicast group used for discovery.
    pub multicast_group: SocketAddrV4,
    pub announce_interval_ms: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        let hb = HeartbeatConfig::default();
        let mc = MulticastConfig::default();
        Self {
            name: hb.name,
            service_type: hb.service_type,
            host: hb.host,
            port: hb.port,
            max_failed_responses: hb.max_failed_responses,
            poll_interval_ms: hb.poll_interval.as_millis() as u64,
            scan_window_min_ms: hb.scan_window_min.as_millis() as u64,
            scan_window_max_ms: hb.scan_window_max.as_millis() as u64,
            multicast_group: mc.group,
            announce_interval_ms: mc.announce_interval.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSection {
    pub throttled_secs: u64,
    pub transient_secs: u64,
}

impl Default for BackoffSection {
    fn default() -> Self {
        let policy = BackoffPolicy::default();
        Self {
            throttled_secs: policy.throttled.as_secs(),
            transient_secs: policy.transient.as_secs(),
        }
    }
}

impl NodeConfig {
    /// Reads a TOML config file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file '{}': {e}", path.display()))?;
        Self::from_toml(&contents)
            .map_err(|e| format!("invalid config file '{}': {e}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self, String> {
        toml::from_str(contents).map_err(|e| e.to_string())
    }

    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| e.to_string())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            throttled: Duration::from_secs(self.backoff.throttled_secs),
            transient: Duration::from_secs(self.backoff.transient_secs),
        }
    }

    pub fn elector_config(&self) -> ElectorConfig {
        ElectorConfig {
            backoff: self.backoff(),
            ..ElectorConfig::default()
        }
    }

    pub fn registry_config(&self) -> Result<RegistryConfig, String> {
        let r = &self.registry;
        if r.group.is_empty() {
            return Err("registry.group is required in registry mode".into());
        }
        if r.max_results == 0 {
            return Err("registry.max_results must be at least 1".into());
        }
        Ok(RegistryConfig {
            filter: MemberFilter {
                group: Some(r.group.clone()),
                max_results: r.max_results,
            },
            identity_attempts: r.identity_attempts,
            identity_retry_delay: Duration::from_millis(r.identity_retry_delay_ms),
            recheck_interval: Duration::from_secs(r.recheck_interval_secs.max(1)),
            backoff: self.backoff(),
        })
    }

    pub fn file_registry_config(&self) -> FileRegistryConfig {
        FileRegistryConfig {
            poll_interval: Duration::from_secs(self.registry.poll_interval_secs.max(1)),
            wait_timeout: Duration::from_secs(self.registry.wait_timeout_secs),
        }
    }

    pub fn identity_source(&self) -> FileIdentitySource {
        let path = self.registry.identity_file.clone();
        match &self.registry.identity_field {
            Some(field) => FileIdentitySource::json_field(path, field.clone()),
            None => FileIdentitySource::plain(path),
        }
    }

    /// Heartbeat settings; validated when the strategy is built.
    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        let h = &self.heartbeat;
        HeartbeatConfig {
            name: h.name.clone(),
            service_type: h.service_type.clone(),
            port: h.port,
            host: h.host,
            max_failed_responses: h.max_failed_responses,
            poll_interval: Duration::from_millis(h.poll_interval_ms),
            scan_window_min: Duration::from_millis(h.scan_window_min_ms),
            scan_window_max: Duration::from_millis(h.scan_window_max_ms),
        }
    }

    pub fn multicast_config(&self) -> MulticastConfig {
        MulticastConfig {
            group: self.heartbeat.multicast_group,
            announce_interval: Duration::from_millis(self.heartbeat.announce_interval_ms.max(1)),
            ..MulticastConfig::default()
        }
    }
}
