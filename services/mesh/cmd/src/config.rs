//! Configuration handling for the mesh tool.
//!
//! The network (IV Index, keys, nodes, groups) and transport tuning are read
//! from a YAML file, then a few environment variables override the IV Index
//! state and the local address.

use anyhow::{anyhow, Context, Result};
use mesh_crypto::Key;
use mesh_transport::{
    ApplicationKey, Group, IvIndex, MeshAddress, MeshNetwork, NetworkKey, Node, Security,
    TransportConfig,
};
use mesh_wire::{Address, Features};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Mesh tool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Network state and key material
    pub network: NetworkSection,
    /// Lower transport tuning
    pub transport: TransportSection,
}

/// Network state and key material
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// Primary element address of this node, hex
    pub local_address: String,
    /// Current IV Index
    pub iv_index: u32,
    /// Whether an IV Update is in progress
    pub iv_update_active: bool,
    /// Network keys
    pub network_keys: Vec<NetworkKeyConfig>,
    /// Application keys
    pub application_keys: Vec<ApplicationKeyConfig>,
    /// Known nodes
    pub nodes: Vec<NodeConfig>,
    /// Groups and virtual labels
    pub groups: Vec<GroupConfig>,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            local_address: "0001".to_string(),
            iv_index: 0,
            iv_update_active: false,
            network_keys: Vec::new(),
            application_keys: Vec::new(),
            nodes: Vec::new(),
            groups: Vec::new(),
        }
    }
}

/// A network key entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkKeyConfig {
    /// Key index
    pub index: u16,
    /// 16-byte key, hex
    pub key: String,
    /// Human readable name
    #[serde(default)]
    pub name: Option<String>,
    /// Minimum security level
    #[serde(default)]
    pub min_security: Security,
    /// New key being distributed; `key` is then the old one
    #[serde(default)]
    pub refresh_key: Option<String>,
    /// Transmit with the refreshed key (Key Refresh phase 2)
    #[serde(default)]
    pub use_refresh_key: bool,
}

/// An application key entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationKeyConfig {
    /// Key index
    pub index: u16,
    /// 16-byte key, hex
    pub key: String,
    /// Index of the network key this key is bound to
    #[serde(default)]
    pub bound_network_key: u16,
    /// Human readable name
    #[serde(default)]
    pub name: Option<String>,
    /// New key being distributed; `key` is then the old one
    #[serde(default)]
    pub refresh_key: Option<String>,
}

/// A node entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Primary element address, hex
    pub address: String,
    /// Number of elements
    #[serde(default = "default_elements")]
    pub elements: u8,
    /// 16-byte device key, hex
    #[serde(default)]
    pub device_key: Option<String>,
    /// Human readable name
    #[serde(default)]
    pub name: Option<String>,
}

fn default_elements() -> u8 {
    1
}

/// A group entry: either a group address or a virtual Label UUID
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Human readable name
    pub name: String,
    /// Group address, hex
    #[serde(default)]
    pub address: Option<String>,
    /// Label UUID of a virtual address
    #[serde(default)]
    pub label: Option<Uuid>,
}

/// Lower transport tuning; unset fields keep the library defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    /// TTL for messages sent without one
    pub default_ttl: Option<u8>,
    /// Capacity of the network message cache
    pub network_cache_size: Option<usize>,
    /// Incomplete reassembly timeout, e.g. `10s`
    pub incomplete_timeout: Option<String>,
    /// Segment Acknowledgment delay base, e.g. `150ms`
    pub ack_delay_base: Option<String>,
    /// Segment Acknowledgment delay added per TTL
    pub ack_delay_per_ttl: Option<String>,
    /// Segment retransmission interval base
    pub retransmit_base: Option<String>,
    /// Segment retransmission interval added per TTL
    pub retransmit_per_ttl: Option<String>,
    /// Segment retransmissions before giving up
    pub retransmit_limit: Option<u8>,
    /// Features advertised in Heartbeats: relay, proxy, friend, low_power
    pub features: Vec<String>,
}

impl MeshConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<MeshConfig>(&content) {
                Ok(config) => {
                    info!(component = "config", "Loaded configuration from {:?}", config_path.as_ref());
                    config
                }
                Err(e) => {
                    warn!(
                        component = "config",
                        "Failed to parse config file {:?}, using defaults: {}",
                        config_path.as_ref(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => {
                warn!(component = "config", "Config file {:?} not found, using defaults", config_path.as_ref());
                Self::default()
            }
        };

        config.apply_overrides(|name| std::env::var(name).ok())?;

        info!(
            component = "config",
            "Final mesh configuration: local_address={}, iv_index={}, update_active={}, {} network keys, {} application keys",
            config.network.local_address,
            config.network.iv_index,
            config.network.iv_update_active,
            config.network.network_keys.len(),
            config.network.application_keys.len()
        );
        Ok(config)
    }

    /// Apply `MESH_*` overrides looked up through `lookup`
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup("MESH_IV_INDEX") {
            self.network.iv_index = parse_number(&value).context("MESH_IV_INDEX")?;
            info!(component = "config", "IV Index overridden by environment: {}", self.network.iv_index);
        }
        if let Some(value) = lookup("MESH_IV_UPDATE_ACTIVE") {
            self.network.iv_update_active = matches!(value.to_lowercase().as_str(), "1" | "true" | "yes");
            info!(
                component = "config",
                "IV Update flag overridden by environment: {}",
                self.network.iv_update_active
            );
        }
        if let Some(value) = lookup("MESH_LOCAL_ADDRESS") {
            parse_address(&value).context("MESH_LOCAL_ADDRESS")?;
            self.network.local_address = value;
            info!(
                component = "config",
                "Local address overridden by environment: {}",
                self.network.local_address
            );
        }
        Ok(())
    }

    /// Build the network model
    pub fn network(&self) -> Result<MeshNetwork> {
        let section = &self.network;
        let mut network = MeshNetwork::new(
            parse_address(&section.local_address).context("local_address")?,
            IvIndex::new(section.iv_index, section.iv_update_active),
        );

        for entry in &section.network_keys {
            let mut key = NetworkKey::new(entry.index, parse_key(&entry.key)?)?
                .with_security(entry.min_security);
            if let Some(name) = &entry.name {
                key.name = name.clone();
            }
            if let Some(refresh) = &entry.refresh_key {
                key.start_key_refresh(parse_key(refresh)?);
                if entry.use_refresh_key {
                    key.use_new_key();
                }
            }
            network.network_keys.push(key);
        }

        for entry in &section.application_keys {
            if network.network_key(entry.bound_network_key).is_none() {
                return Err(anyhow!(
                    "application key {} bound to unknown network key {}",
                    entry.index,
                    entry.bound_network_key
                ));
            }
            let mut key = ApplicationKey::new(entry.index, parse_key(&entry.key)?, entry.bound_network_key)?;
            if let Some(name) = &entry.name {
                key.name = name.clone();
            }
            if let Some(refresh) = &entry.refresh_key {
                key.start_key_refresh(parse_key(refresh)?);
            }
            network.application_keys.push(key);
        }

        for entry in &section.nodes {
            let device_key = entry.device_key.as_deref().map(parse_key).transpose()?;
            let mut node = Node::new(parse_address(&entry.address)?, entry.elements, device_key);
            if let Some(name) = &entry.name {
                node.name = name.clone();
            }
            network.nodes.push(node);
        }

        for entry in &section.groups {
            let address = match (&entry.address, entry.label) {
                (_, Some(label)) => MeshAddress::from_label(label),
                (Some(address), None) => {
                    let address = parse_address(address)?;
                    if !address.is_group() {
                        return Err(anyhow!("group {} has non-group address {}", entry.name, address));
                    }
                    MeshAddress::new(address)
                }
                (None, None) => return Err(anyhow!("group {} has neither address nor label", entry.name)),
            };
            network.groups.push(Group::new(entry.name.clone(), address));
        }

        Ok(network)
    }

    /// Build the transport configuration
    pub fn transport(&self) -> Result<TransportConfig> {
        let section = &self.transport;
        let mut config = TransportConfig::default();
        if let Some(ttl) = section.default_ttl {
            if ttl == 1 || ttl > 0x7F {
                return Err(anyhow!("invalid default TTL {}", ttl));
            }
            config.default_ttl = ttl;
        }
        if let Some(size) = section.network_cache_size {
            config.network_cache_size = size;
        }
        let durations = [
            (&section.incomplete_timeout, &mut config.incomplete_timeout),
            (&section.ack_delay_base, &mut config.ack_delay_base),
            (&section.ack_delay_per_ttl, &mut config.ack_delay_per_ttl),
            (&section.retransmit_base, &mut config.retransmit_base),
            (&section.retransmit_per_ttl, &mut config.retransmit_per_ttl),
        ];
        for (value, target) in durations {
            if let Some(value) = value {
                *target = parse_duration(value)?;
            }
        }
        if let Some(limit) = section.retransmit_limit {
            config.retransmit_limit = limit;
        }
        for feature in &section.features {
            config.features |= match feature.as_str() {
                "relay" => Features::RELAY,
                "proxy" => Features::PROXY,
                "friend" => Features::FRIEND,
                "low_power" => Features::LOW_POWER,
                other => return Err(anyhow!("unknown feature {}", other)),
            };
        }
        Ok(config)
    }
}

/// Parse a 16-bit address written in hex, with or without `0x`
pub fn parse_address(value: &str) -> Result<Address> {
    let digits = value.trim().trim_start_matches("0x");
    u16::from_str_radix(digits, 16)
        .map(Address)
        .with_context(|| format!("invalid address {:?}", value))
}

/// Parse a 128-bit key written in hex
pub fn parse_key(value: &str) -> Result<Key> {
    let bytes = hex::decode(value.trim()).with_context(|| format!("invalid key {:?}", value))?;
    bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| anyhow!("key must be 16 bytes, got {}", bytes.len()))
}

fn parse_number(value: &str) -> Result<u32> {
    let value = value.trim();
    match value.strip_prefix("0x") {
        Some(digits) => u32::from_str_radix(digits, 16),
        None => value.parse(),
    }
    .with_context(|| format!("invalid number {:?}", value))
}

fn parse_duration(value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid duration {:?}", value))
}
