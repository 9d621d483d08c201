//! Key material and the mesh network state the layers read it from.
//!
//! Derived identifiers are pure functions of the key bytes, so the types here
//! keep key bytes private and recompute derivatives whenever they change.

use crate::error::TransportError;
use mesh_crypto::{beacon_key, k2, k3, k4, private_beacon_key, virtual_address, Key};
use mesh_wire::Address;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Largest network or application key index
pub const MAX_KEY_INDEX: u16 = 0x0FFF;

/// Key Refresh procedure phase of a network key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRefreshPhase {
    /// No refresh in progress
    #[default]
    NormalOperation,
    /// Phase 1: new key distributed, old key still used for transmission
    DistributingKeys,
    /// Phase 2: new key used for transmission, old key still accepted
    Finalizing,
}

/// Minimum security level of a network key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Security {
    /// 32-bit TransMIC for all messages
    #[default]
    Low,
    /// 64-bit TransMIC for segmented access messages
    High,
}

/// IV Index state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IvIndex {
    /// Current 32-bit IV Index
    pub index: u32,
    /// IV Update procedure in progress
    pub update_active: bool,
}

impl IvIndex {
    /// Create an IV Index state
    pub fn new(index: u32, update_active: bool) -> Self {
        Self {
            index,
            update_active,
        }
    }

    /// IV Index used to secure outgoing PDUs
    pub fn transmit_index(&self) -> u32 {
        self.index
    }

    /// IVI bit of outgoing PDUs
    pub fn ivi(&self) -> u8 {
        (self.transmit_index() & 1) as u8
    }

    /// IV Index matching the IVI bit of a received PDU
    ///
    /// A mismatching bit is only resolved to `index - 1` while an IV Update is
    /// in progress.
    pub fn receive_index(&self, ivi: u8) -> Option<u32> {
        if (self.index & 1) as u8 == ivi & 1 {
            Some(self.index)
        } else if self.update_active && self.index > 0 {
            Some(self.index - 1)
        } else {
            None
        }
    }
}

/// Everything derived from one network key value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkKeyDerivatives {
    /// 7-bit network identifier
    pub nid: u8,
    /// Network PDU encryption key
    pub encryption_key: Key,
    /// Network header privacy key
    pub privacy_key: Key,
    /// 64-bit network ID advertised in Secure Network beacons
    pub network_id: [u8; 8],
    /// Secure Network beacon key
    pub beacon_key: Key,
    /// Private beacon key
    pub private_beacon_key: Key,
}

impl NetworkKeyDerivatives {
    /// Derive from key material
    pub fn derive(key: &Key) -> Self {
        let master = k2(key, &[0x00]);
        Self {
            nid: master.nid,
            encryption_key: master.encryption_key,
            privacy_key: master.privacy_key,
            network_id: k3(key),
            beacon_key: beacon_key(key),
            private_beacon_key: private_beacon_key(key),
        }
    }
}

fn check_key_index(index: u16) -> Result<u16, TransportError> {
    if index > MAX_KEY_INDEX {
        Err(TransportError::InvalidKeyIndex(index))
    } else {
        Ok(index)
    }
}

/// A network key and its refresh state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkKey {
    index: u16,
    /// Human readable name
    pub name: String,
    key: Key,
    old_key: Option<Key>,
    phase: KeyRefreshPhase,
    /// Minimum security level for messages secured by this subnet
    pub min_security: Security,
    derivatives: NetworkKeyDerivatives,
    old_derivatives: Option<NetworkKeyDerivatives>,
}

impl NetworkKey {
    /// Create a network key in normal operation
    pub fn new(index: u16, key: Key) -> Result<Self, TransportError> {
        Ok(Self {
            index: check_key_index(index)?,
            name: format!("Network Key {}", index),
            key,
            old_key: None,
            phase: KeyRefreshPhase::NormalOperation,
            min_security: Security::Low,
            derivatives: NetworkKeyDerivatives::derive(&key),
            old_derivatives: None,
        })
    }

    /// Set the minimum security level
    pub fn with_security(mut self, security: Security) -> Self {
        self.min_security = security;
        self
    }

    /// Key index
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Current key material
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Previous key material, present only during Key Refresh
    pub fn old_key(&self) -> Option<&Key> {
        self.old_key.as_ref()
    }

    /// Key Refresh phase
    pub fn phase(&self) -> KeyRefreshPhase {
        self.phase
    }

    /// Derivatives of the current key
    pub fn derivatives(&self) -> &NetworkKeyDerivatives {
        &self.derivatives
    }

    /// Derivatives of the old key
    pub fn old_derivatives(&self) -> Option<&NetworkKeyDerivatives> {
        self.old_derivatives.as_ref()
    }

    /// Derivatives used to secure outgoing PDUs and beacons
    pub fn transmit_derivatives(&self) -> &NetworkKeyDerivatives {
        match (&self.phase, &self.old_derivatives) {
            (KeyRefreshPhase::DistributingKeys, Some(old)) => old,
            _ => &self.derivatives,
        }
    }

    /// Derivatives to try on reception: current first, then old
    pub fn receive_derivatives(&self) -> impl Iterator<Item = (&NetworkKeyDerivatives, bool)> {
        std::iter::once((&self.derivatives, false))
            .chain(self.old_derivatives.as_ref().map(|old| (old, true)))
    }

    /// Replace the key material with `new_key`, keeping the current one as old
    pub fn start_key_refresh(&mut self, new_key: Key) {
        self.old_key = Some(self.key);
        self.old_derivatives = Some(self.derivatives);
        self.key = new_key;
        self.derivatives = NetworkKeyDerivatives::derive(&new_key);
        self.phase = KeyRefreshPhase::DistributingKeys;
    }

    /// Move to the Finalizing phase
    pub fn use_new_key(&mut self) {
        if self.old_key.is_some() {
            self.phase = KeyRefreshPhase::Finalizing;
        }
    }

    /// Drop the old key material and return to normal operation
    pub fn finish_key_refresh(&mut self) {
        self.old_key = None;
        self.old_derivatives = None;
        self.phase = KeyRefreshPhase::NormalOperation;
    }
}

/// An application key bound to a network key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationKey {
    index: u16,
    /// Human readable name
    pub name: String,
    bound_network_key: u16,
    key: Key,
    aid: u8,
    old_key: Option<Key>,
    old_aid: Option<u8>,
}

impl ApplicationKey {
    /// Create an application key bound to `bound_network_key`
    pub fn new(index: u16, key: Key, bound_network_key: u16) -> Result<Self, TransportError> {
        Ok(Self {
            index: check_key_index(index)?,
            name: format!("Application Key {}", index),
            bound_network_key: check_key_index(bound_network_key)?,
            key,
            aid: k4(&key),
            old_key: None,
            old_aid: None,
        })
    }

    /// Key index
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Index of the network key this key is bound to
    pub fn bound_network_key(&self) -> u16 {
        self.bound_network_key
    }

    /// Current key material
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// AID of the current key
    pub fn aid(&self) -> u8 {
        self.aid
    }

    /// Previous key material, present only during Key Refresh
    pub fn old_key(&self) -> Option<&Key> {
        self.old_key.as_ref()
    }

    /// AID of the previous key
    pub fn old_aid(&self) -> Option<u8> {
        self.old_aid
    }

    /// Replace the key material with `new_key`, keeping the current one as old
    pub fn start_key_refresh(&mut self, new_key: Key) {
        self.old_key = Some(self.key);
        self.old_aid = Some(self.aid);
        self.key = new_key;
        self.aid = k4(&new_key);
    }

    /// Drop the old key material
    pub fn finish_key_refresh(&mut self) {
        self.old_key = None;
        self.old_aid = None;
    }
}

/// A provisioned node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Unicast address of the primary element
    pub primary_address: Address,
    /// Number of elements, occupying consecutive addresses
    pub element_count: u8,
    /// Device key, if known
    pub device_key: Option<Key>,
    /// Human readable name
    pub name: String,
}

impl Node {
    /// Create a node description
    pub fn new(primary_address: Address, element_count: u8, device_key: Option<Key>) -> Self {
        Self {
            primary_address,
            element_count: element_count.max(1),
            device_key,
            name: format!("Node {}", primary_address),
        }
    }

    /// Whether `address` is one of this node's element addresses
    pub fn contains(&self, address: Address) -> bool {
        let first = self.primary_address.0 as u32;
        let addr = address.0 as u32;
        address.is_unicast() && addr >= first && addr < first + self.element_count as u32
    }
}

/// A destination that may carry a virtual Label UUID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeshAddress {
    /// 16-bit address
    pub address: Address,
    /// Label UUID when `address` is virtual
    pub virtual_label: Option<Uuid>,
}

impl MeshAddress {
    /// Address without a label
    pub fn new(address: Address) -> Self {
        Self {
            address,
            virtual_label: None,
        }
    }

    /// Virtual address derived from a Label UUID
    pub fn from_label(label: Uuid) -> Self {
        Self {
            address: Address(virtual_address(label.as_bytes())),
            virtual_label: Some(label),
        }
    }
}

impl From<Address> for MeshAddress {
    fn from(address: Address) -> Self {
        Self::new(address)
    }
}

/// A group address messages can be published to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    /// Group or virtual address
    pub address: MeshAddress,
    /// Human readable name
    pub name: String,
}

impl Group {
    /// Create a group
    pub fn new(name: impl Into<String>, address: MeshAddress) -> Self {
        Self {
            address,
            name: name.into(),
        }
    }
}

/// The key set an access message is secured with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySet {
    /// Secured with an application key
    Application {
        /// Network key the message travels on
        network_key: u16,
        /// Application key index
        application_key: u16,
        /// Key material actually used
        key: Key,
        /// AID of `key`
        aid: u8,
    },
    /// Secured with a node's device key
    Device {
        /// Network key the message travels on
        network_key: u16,
        /// Node owning the device key
        node: Address,
        /// Device key material
        key: Key,
    },
}

impl KeySet {
    /// Key set for sending with an application key
    ///
    /// While the bound network key is distributing new keys, the old
    /// application key is still used for transmission.
    pub fn application(network_key: &NetworkKey, application_key: &ApplicationKey) -> Self {
        let (key, aid) = match (
            network_key.phase(),
            application_key.old_key(),
            application_key.old_aid(),
        ) {
            (KeyRefreshPhase::DistributingKeys, Some(old), Some(old_aid)) => (*old, old_aid),
            _ => (*application_key.key(), application_key.aid()),
        };
        KeySet::Application {
            network_key: network_key.index(),
            application_key: application_key.index(),
            key,
            aid,
        }
    }

    /// Key set for sending with a node's device key
    pub fn device(network_key: &NetworkKey, node: &Node) -> Result<Self, TransportError> {
        let key = node
            .device_key
            .ok_or(TransportError::MissingDeviceKey(node.primary_address))?;
        Ok(KeySet::Device {
            network_key: network_key.index(),
            node: node.primary_address,
            key,
        })
    }

    /// Index of the network key
    pub fn network_key_index(&self) -> u16 {
        match self {
            KeySet::Application { network_key, .. } | KeySet::Device { network_key, .. } => {
                *network_key
            }
        }
    }

    /// Key securing the access payload
    pub fn access_key(&self) -> &Key {
        match self {
            KeySet::Application { key, .. } | KeySet::Device { key, .. } => key,
        }
    }

    /// AID, or `None` for device keys
    pub fn aid(&self) -> Option<u8> {
        match self {
            KeySet::Application { aid, .. } => Some(*aid),
            KeySet::Device { .. } => None,
        }
    }
}

/// Key material, nodes and groups of one mesh network
#[derive(Debug, Clone, Default)]
pub struct MeshNetwork {
    /// IV Index state shared by all subnets
    pub iv_index: IvIndex,
    /// Network keys
    pub network_keys: Vec<NetworkKey>,
    /// Application keys
    pub application_keys: Vec<ApplicationKey>,
    /// Known nodes, including the local one
    pub nodes: Vec<Node>,
    /// Known groups
    pub groups: Vec<Group>,
    /// Primary address of the local node
    pub local_address: Address,
}

impl MeshNetwork {
    /// Create an empty network for the local node at `local_address`
    pub fn new(local_address: Address, iv_index: IvIndex) -> Self {
        Self {
            iv_index,
            local_address,
            ..Default::default()
        }
    }

    /// Network key by index
    pub fn network_key(&self, index: u16) -> Option<&NetworkKey> {
        self.network_keys.iter().find(|k| k.index() == index)
    }

    /// Mutable network key by index
    pub fn network_key_mut(&mut self, index: u16) -> Option<&mut NetworkKey> {
        self.network_keys.iter_mut().find(|k| k.index() == index)
    }

    /// Application key by index
    pub fn application_key(&self, index: u16) -> Option<&ApplicationKey> {
        self.application_keys.iter().find(|k| k.index() == index)
    }

    /// Mutable application key by index
    pub fn application_key_mut(&mut self, index: u16) -> Option<&mut ApplicationKey> {
        self.application_keys.iter_mut().find(|k| k.index() == index)
    }

    /// Node owning the element `address`
    pub fn node(&self, address: Address) -> Option<&Node> {
        self.nodes.iter().find(|n| n.contains(address))
    }

    /// The local node
    pub fn local_node(&self) -> Option<&Node> {
        self.node(self.local_address)
    }

    /// Whether `address` belongs to the local node
    pub fn is_local_unicast(&self, address: Address) -> bool {
        match self.local_node() {
            Some(node) => node.contains(address),
            None => address == self.local_address,
        }
    }

    /// Whether a message to `destination` is meant for the local node
    pub fn is_local_destination(&self, destination: Address) -> bool {
        if destination.is_unicast() {
            self.is_local_unicast(destination)
        } else {
            !destination.is_unassigned()
        }
    }

    /// Groups using `address`
    pub fn groups_with_address(&self, address: Address) -> impl Iterator<Item = &Group> {
        self.groups.iter().filter(move |g| g.address.address == address)
    }
}
