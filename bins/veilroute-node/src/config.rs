//! Node configuration

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use veilroute_core::{ExitPolicy, RelayConfig as CoreRelayConfig, RouterConfig};

/// Main node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Client-side listener
    pub network: NetworkConfig,
    /// Circuit building
    pub circuit: CircuitConfig,
    /// Trusted relays
    pub relays: RelaysConfig,
    /// Relay service (when running `veilroute relay`)
    pub relay: RelayConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Listen address
    pub listen_address: String,
    /// Local listen port
    pub listen_port: u16,
    /// Outbound connect timeout (seconds)
    pub connect_timeout: u64,
}

/// Circuit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Number of relay hops
    pub hop_count: usize,
    /// Maximum concurrent circuits
    pub max_circuits: usize,
    /// Per-hop handshake timeout (seconds)
    pub extend_timeout: u64,
    /// Alternate relays tried per hop after a failure
    pub extend_retries: usize,
    /// Idle circuits are closed after this many seconds
    pub idle_timeout: u64,
    /// Idle sweep interval (seconds)
    pub sweep_interval: u64,
}

/// Relay list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaysConfig {
    /// Trusted relays as `host:port`
    pub trusted: Vec<String>,
}

/// Relay service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen_address: String,
    pub listen_port: u16,
    /// What to do with data at the last hop
    pub exit_policy: ExitPolicy,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let router = RouterConfig::default();
        Self {
            listen_address: router.listen_address,
            listen_port: router.listen_port,
            connect_timeout: router.connect_timeout.as_secs(),
        }
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        let router = RouterConfig::default();
        Self {
            hop_count: router.circuit_length,
            max_circuits: router.max_circuits,
            extend_timeout: router.extend_timeout.as_secs(),
            extend_retries: router.extend_retries,
            idle_timeout: router.idle_timeout.as_secs(),
            sweep_interval: router.sweep_interval.as_secs(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        let relay = CoreRelayConfig::default();
        Self {
            listen_address: relay.listen_address,
            listen_port: relay.listen_port,
            exit_policy: relay.exit_policy,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {:?}", path))?;

        toml::from_str(&contents).context("Failed to parse config file")
    }

    /// Load or create default configuration
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path).await
        } else {
            let config = Self::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let contents = toml::to_string_pretty(self)?;
        tokio::fs::write(path, contents)
            .await
            .with_context(|| format!("Failed to write config file {:?}", path))?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.to_router_config()
            .validate()
            .context("Invalid circuit configuration")?;

        if self.relay.listen_address.parse::<std::net::IpAddr>().is_err() {
            anyhow::bail!("Invalid relay listen address: {}", self.relay.listen_address);
        }

        Ok(())
    }

    /// Settings for the client-side router
    pub fn to_router_config(&self) -> RouterConfig {
        RouterConfig {
            listen_address: self.network.listen_address.clone(),
            listen_port: self.network.listen_port,
            trusted_relays: self.relays.trusted.clone(),
            max_circuits: self.circuit.max_circuits,
            circuit_length: self.circuit.hop_count,
            extend_timeout: Duration::from_secs(self.circuit.extend_timeout),
            connect_timeout: Duration::from_secs(self.network.connect_timeout),
            idle_timeout: Duration::from_secs(self.circuit.idle_timeout),
            sweep_interval: Duration::from_secs(self.circuit.sweep_interval),
            extend_retries: self.circuit.extend_retries,
            ..Default::default()
        }
    }

    /// Settings for the relay service
    pub fn to_relay_config(&self) -> CoreRelayConfig {
        CoreRelayConfig {
            listen_address: self.relay.listen_address.clone(),
            listen_port: self.relay.listen_port,
            exit_policy: self.relay.exit_policy,
            connect_timeout: Duration::from_secs(self.network.connect_timeout),
        }
    }
}
