use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::errors::{DeployError, Result};

/// Transport protocol of a connectivity probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// One (protocol, port) pair probed between two nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckItem {
    pub protocol: Protocol,
    pub port: u16,
}

impl CheckItem {
    pub fn tcp(port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            port,
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            protocol: Protocol::Udp,
            port,
        }
    }

    pub fn name(&self) -> String {
        format!("{}/{}", self.protocol.as_str(), self.port)
    }
}

/// Minimum hardware a node must offer to pass the node check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRequirements {
    pub min_cpu: u32,
    pub min_memory_mb: u64,
}

impl Default for NodeRequirements {
    fn default() -> Self {
        Self {
            min_cpu: 2,
            min_memory_mb: 2048,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is not set
    pub level: String,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}

/// Engine configuration with all tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory of per-action log files
    pub log_dir: PathBuf,

    // Connectivity check
    /// Sleep between starting the capture and sending the probe
    #[serde(with = "secs")]
    pub probe_grace: Duration,
    /// Upper bound for one remote packet capture
    #[serde(with = "secs")]
    pub capture_timeout: Duration,
    pub connectivity_items: Vec<CheckItem>,

    // Etcd readiness
    #[serde(with = "secs")]
    pub etcd_ready_deadline: Duration,
    #[serde(with = "secs")]
    pub etcd_ready_initial_backoff: Duration,

    // Deadlines
    /// Optional deadline for a single action
    #[serde(with = "opt_secs")]
    pub action_timeout: Option<Duration>,
    /// Optional deadline for a whole task tree
    #[serde(with = "opt_secs")]
    pub deploy_timeout: Option<Duration>,

    pub node_requirements: NodeRequirements,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./logs"),
            probe_grace: Duration::from_secs(1),
            capture_timeout: Duration::from_secs(10),
            connectivity_items: vec![
                CheckItem::tcp(6443),
                CheckItem::tcp(2379),
                CheckItem::tcp(2380),
                CheckItem::tcp(10250),
                CheckItem::udp(8472),
            ],
            etcd_ready_deadline: Duration::from_secs(300),
            etcd_ready_initial_backoff: Duration::from_secs(1),
            action_timeout: None,
            deploy_timeout: None,
            node_requirements: NodeRequirements::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Load from a YAML file; missing fields keep their defaults
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DeployError::io(format!("read {}", path.display()), e))?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.log_dir.as_os_str().is_empty() {
            return Err(DeployError::config_field("must not be empty", "log_dir"));
        }
        if self.capture_timeout <= self.probe_grace {
            return Err(DeployError::config_field(
                "must be greater than probe_grace",
                "capture_timeout",
            ));
        }
        if self.etcd_ready_initial_backoff.is_zero() {
            return Err(DeployError::config_field(
                "must be greater than 0",
                "etcd_ready_initial_backoff",
            ));
        }
        if self.etcd_ready_deadline < self.etcd_ready_initial_backoff {
            return Err(DeployError::config_field(
                "must not be shorter than etcd_ready_initial_backoff",
                "etcd_ready_deadline",
            ));
        }
        if matches!(self.action_timeout, Some(t) if t.is_zero()) {
            return Err(DeployError::config_field("must be greater than 0", "action_timeout"));
        }
        if matches!(self.deploy_timeout, Some(t) if t.is_zero()) {
            return Err(DeployError::config_field("must be greater than 0", "deploy_timeout"));
        }
        if self.connectivity_items.iter().any(|item| item.port == 0) {
            return Err(DeployError::config_field(
                "port 0 is not probeable",
                "connectivity_items",
            ));
        }
        Ok(())
    }

    /// Short intervals for tests and local dry runs
    pub fn development() -> Self {
        Self {
            probe_grace: Duration::from_millis(10),
            capture_timeout: Duration::from_secs(1),
            etcd_ready_deadline: Duration::from_secs(2),
            etcd_ready_initial_backoff: Duration::from_millis(10),
            logging: LoggingConfig {
                level: "debug".to_string(),
                ansi: false,
            },
            ..Default::default()
        }
    }
}

/// Builder for EngineConfig
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn log_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.log_dir = path.into();
        self
    }

    pub fn probe_grace(mut self, grace: Duration) -> Self {
        self.config.probe_grace = grace;
        self
    }

    pub fn capture_timeout(mut self, timeout: Duration) -> Self {
        self.config.capture_timeout = timeout;
        self
    }

    pub fn connectivity_items(mut self, items: Vec<CheckItem>) -> Self {
        self.config.connectivity_items = items;
        self
    }

    pub fn etcd_ready(mut self, initial_backoff: Duration, deadline: Duration) -> Self {
        self.config.etcd_ready_initial_backoff = initial_backoff;
        self.config.etcd_ready_deadline = deadline;
        self
    }

    pub fn action_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.action_timeout = timeout;
        self
    }

    pub fn deploy_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.deploy_timeout = timeout;
        self
    }

    pub fn node_requirements(mut self, requirements: NodeRequirements) -> Self {
        self.config.node_requirements = requirements;
        self
    }

    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.config.logging = logging;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(d)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
