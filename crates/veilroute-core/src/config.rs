//! Core configuration

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use veilroute_crypto::constants::MAX_ONION_LAYERS;

use crate::error::{CoreError, CoreResult};

/// Onion router configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Address the transport listens on
    pub listen_address: String,

    /// Listen port (0 picks an ephemeral port)
    pub listen_port: u16,

    /// Trusted relays as `host:port`
    pub trusted_relays: Vec<String>,

    /// Maximum concurrent circuits
    pub max_circuits: usize,

    /// Default number of hops for new circuits
    pub circuit_length: usize,

    /// Hard upper bound on hops per circuit
    pub max_hops: usize,

    /// Time allowed for one hop's handshake
    pub extend_timeout: Duration,

    /// Time allowed for an outbound TCP connect
    pub connect_timeout: Duration,

    /// Circuits idle longer than this are closed by the sweeper
    pub idle_timeout: Duration,

    /// How often the sweeper runs
    pub sweep_interval: Duration,

    /// Alternate relays tried per hop position after an extend failure
    pub extend_retries: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 9050,
            trusted_relays: Vec::new(),
            max_circuits: 100,
            circuit_length: crate::DEFAULT_CIRCUIT_LENGTH,
            max_hops: MAX_ONION_LAYERS,
            extend_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300), // 5 minutes
            sweep_interval: Duration::from_secs(30),
            extend_retries: 2,
        }
    }
}

impl RouterConfig {
    /// Validate configuration
    pub fn validate(&self) -> CoreResult<()> {
        if self.listen_address.parse::<IpAddr>().is_err() {
            return Err(CoreError::ConfigError(format!(
                "Invalid listen address: {}",
                self.listen_address
            )));
        }
        if self.max_hops == 0 || self.max_hops > MAX_ONION_LAYERS {
            return Err(CoreError::ConfigError(format!(
                "max_hops must be between 1 and {}",
                MAX_ONION_LAYERS
            )));
        }
        if self.circuit_length == 0 || self.circuit_length > self.max_hops {
            return Err(CoreError::ConfigError(format!(
                "Circuit length {} must be between 1 and {}",
                self.circuit_length, self.max_hops
            )));
        }
        if self.max_circuits == 0 {
            return Err(CoreError::ConfigError("max_circuits must be > 0".into()));
        }
        for (name, value) in [
            ("extend_timeout", self.extend_timeout),
            ("connect_timeout", self.connect_timeout),
            ("sweep_interval", self.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(CoreError::ConfigError(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}

/// What an exit hop does with application data
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitPolicy {
    /// Send the payload back to the origin
    #[default]
    Echo,
    /// Drop the payload
    Discard,
}

/// Relay service configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayConfig {
    pub listen_address: String,
    pub listen_port: u16,
    pub exit_policy: ExitPolicy,
    pub connect_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 9051,
            exit_policy: ExitPolicy::Echo,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    /// Relay on loopback with an ephemeral port
    pub fn local() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 0,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RouterConfig::default();
        assert_eq!(config.listen_port, 9050);
        assert_eq!(config.max_circuits, 100);
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            RouterConfig {
                listen_address: "nowhere".into(),
                ..Default::default()
            },
            RouterConfig {
                circuit_length: 0,
                ..Default::default()
            },
            RouterConfig {
                circuit_length: 9,
                ..Default::default()
            },
            RouterConfig {
                max_hops: 9,
                ..Default::default()
            },
            RouterConfig {
                max_circuits: 0,
                ..Default::default()
            },
            RouterConfig {
                extend_timeout: Duration::ZERO,
                ..Default::default()
            },
        ];

        for config in bad {
            assert!(matches!(config.validate(), Err(CoreError::ConfigError(_))));
        }
    }
}
