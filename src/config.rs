//! Node configuration.
//!
//! Every field has a default, so an empty TOML file is a valid config:
//!
//! ```toml
//! name = "alice"
//! listen_addr = "0.0.0.0:8000"
//! key_path = "alice.keys.json"
//!
//! [engine]
//! relay_probability = 0.75
//!
//! [engine.tunnels]
//! refresh_interval_secs = 5
//! expiry_secs = 6000
//! capacity = 100000
//!
//! [discovery]
//! enabled = true
//! group = "228.0.0.5"
//! port = 9999
//! interval_secs = 2
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::cache::TtlConfig;

/// Probability that a tunneled envelope is relayed onward instead of exiting.
pub const DEFAULT_RELAY_PROBABILITY: f64 = 0.75;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";

pub const DEFAULT_DISCOVERY_GROUP: Ipv4Addr = Ipv4Addr::new(228, 0, 0, 5);
pub const DEFAULT_DISCOVERY_PORT: u16 = 9999;
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(2);
pub const PROTOCOL_NAME: &str = "murmur";
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Serde adapter storing a [`Duration`] as whole seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use tokio::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub relay_probability: f64,
    pub dedup: TtlConfig,
    pub callbacks: TtlConfig,
    pub tunnels: TtlConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            relay_probability: DEFAULT_RELAY_PROBABILITY,
            dedup: TtlConfig::default(),
            callbacks: TtlConfig::default(),
            tunnels: TtlConfig::tunnels(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.relay_probability) {
            bail!(
                "relay_probability must be within [0, 1], got {}",
                self.relay_probability
            );
        }
        for (name, cache) in [
            ("dedup", &self.dedup),
            ("callbacks", &self.callbacks),
            ("tunnels", &self.tunnels),
        ] {
            if cache.capacity == 0 {
                bail!("engine.{name}.capacity must be positive");
            }
            if cache.expiry.is_zero() {
                bail!("engine.{name}.expiry_secs must be positive");
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub group: Ipv4Addr,
    pub port: u16,
    #[serde(rename = "interval_secs", with = "duration_secs")]
    pub interval: Duration,
    pub protocol_name: String,
    pub protocol_version: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group: DEFAULT_DISCOVERY_GROUP,
            port: DEFAULT_DISCOVERY_PORT,
            interval: DEFAULT_DISCOVERY_INTERVAL,
            protocol_name: PROTOCOL_NAME.to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

impl DiscoveryConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// User name this node announces and signs as.
    pub name: String,
    pub listen_addr: SocketAddr,
    /// Keys are loaded from, or generated into, this file. Ephemeral keys
    /// when unset.
    pub key_path: Option<PathBuf>,
    pub engine: EngineConfig,
    pub discovery: DiscoveryConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::from("anonymous"),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            key_path: None,
            engine: EngineConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Config for a node bound to an ephemeral loopback port with discovery
    /// off. Useful for tests and local experiments.
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            discovery: DiscoveryConfig::disabled(),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: NodeConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("name must not be empty");
        }
        self.engine.validate().context("invalid [engine] section")?;
        if self.discovery.enabled {
            if !self.discovery.group.is_multicast() {
                bail!("discovery.group {} is not a multicast address", self.discovery.group);
            }
            if self.discovery.port == 0 {
                bail!("discovery.port must be non-zero");
            }
            if self.discovery.interval.is_zero() {
                bail!("discovery.interval_secs must be positive");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = NodeConfig::default();
        assert_eq!(config.listen_addr.to_string(), DEFAULT_LISTEN_ADDR);
        assert_eq!(config.engine.relay_probability, 0.75);
        assert_eq!(config.engine.dedup.expiry, Duration::from_secs(60));
        assert_eq!(config.engine.callbacks.expiry, Duration::from_secs(60));
        assert_eq!(config.engine.tunnels.expiry, Duration::from_secs(6000));
        assert_eq!(config.engine.dedup.refresh_interval, Duration::from_secs(5));
        assert!(config.discovery.enabled);
        assert_eq!(config.discovery.group, Ipv4Addr::new(228, 0, 0, 5));
        assert_eq!(config.discovery.port, 9999);
        assert_eq!(config.discovery.interval, Duration::from_secs(2));
        config.validate().unwrap();
    }

    #[test]
    fn empty_toml_is_default() {
        let config: NodeConfig = toml::from_str("").unwrap();
        assert_eq!(config, NodeConfig::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let raw = r#"
            name = "alice"
            listen_addr = "127.0.0.1:9000"

            [engine]
            relay_probability = 0.5

            [engine.tunnels]
            expiry_secs = 120

            [discovery]
            enabled = false
        "#;
        let config: NodeConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.name, "alice");
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.engine.relay_probability, 0.5);
        assert_eq!(config.engine.tunnels.expiry, Duration::from_secs(120));
        assert_eq!(config.engine.tunnels.refresh_interval, Duration::from_secs(5));
        assert_eq!(config.engine.dedup.expiry, Duration::from_secs(60));
        assert!(!config.discovery.enabled);
        assert_eq!(config.discovery.port, 9999);
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut config = NodeConfig::default();
        config.engine.relay_probability = 1.5;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.engine.dedup.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.discovery.group = Ipv4Addr::new(10, 0, 0, 1);
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.name = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_and_validates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");

        std::fs::write(&path, "name = \"bob\"\n[discovery]\nport = 7777\n").unwrap();
        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.name, "bob");
        assert_eq!(config.discovery.port, 7777);

        std::fs::write(&path, "[engine]\nrelay_probability = -1.0\n").unwrap();
        assert!(NodeConfig::load(&path).is_err());

        assert!(NodeConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
