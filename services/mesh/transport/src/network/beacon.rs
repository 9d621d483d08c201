//! Beacon codec.
//!
//! A Secure Network or Private beacon only decodes when it authenticates
//! against one of the held network keys. Anything else is foreign and yields
//! `None`.

use crate::error::TransportError;
use crate::keys::{IvIndex, KeyRefreshPhase, MeshNetwork, NetworkKey, NetworkKeyDerivatives};
use bytes::Bytes;
use mesh_crypto::{private_beacon_open, private_beacon_seal, secure_beacon_authentication};
use mesh_wire::{
    BeaconFlags, BeaconType, PrivateBeaconFields, SecureNetworkBeaconFields,
    UnprovisionedDeviceBeacon,
};
use serde::Serialize;
use tracing::debug;

fn flags_for(network_key: &NetworkKey, iv_index: &IvIndex) -> BeaconFlags {
    let mut flags = BeaconFlags::empty();
    if network_key.phase() == KeyRefreshPhase::Finalizing {
        flags |= BeaconFlags::KEY_REFRESH;
    }
    if iv_index.update_active {
        flags |= BeaconFlags::IV_UPDATE;
    }
    flags
}

/// An authenticated Secure Network beacon
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecureNetworkBeacon {
    /// Index of the network key that authenticated the beacon
    pub network_key_index: u16,
    /// Whether the old key material authenticated it
    pub old_key: bool,
    /// Key Refresh flag
    pub key_refresh: bool,
    /// Advertised IV Index state
    pub iv_index: IvIndex,
    /// Network ID
    pub network_id: [u8; 8],
}

impl SecureNetworkBeacon {
    /// Decode and authenticate against the keys of `network`
    pub fn decode(data: &[u8], network: &MeshNetwork) -> Option<Self> {
        let fields = match SecureNetworkBeaconFields::parse(data) {
            Ok(fields) => fields,
            Err(e) => {
                debug!("secure network beacon rejected: {}", e);
                return None;
            }
        };
        network.network_keys.iter().find_map(|key| {
            key.receive_derivatives().find_map(|(derivatives, old_key)| {
                Self::authenticate(&fields, key.index(), derivatives, old_key)
            })
        })
    }

    fn authenticate(
        fields: &SecureNetworkBeaconFields,
        network_key_index: u16,
        keys: &NetworkKeyDerivatives,
        old_key: bool,
    ) -> Option<Self> {
        if keys.network_id != fields.network_id {
            return None;
        }
        let auth = secure_beacon_authentication(&keys.beacon_key, &fields.authenticated_data());
        if auth != fields.authentication {
            return None;
        }
        let flags = BeaconFlags::from_bits_truncate(fields.flags);
        Some(Self {
            network_key_index,
            old_key,
            key_refresh: flags.contains(BeaconFlags::KEY_REFRESH),
            iv_index: IvIndex::new(fields.iv_index, flags.contains(BeaconFlags::IV_UPDATE)),
            network_id: fields.network_id,
        })
    }

    /// Encode a beacon for `network_key` with its transmit key material
    pub fn encode(network_key: &NetworkKey, iv_index: &IvIndex) -> Bytes {
        let keys = network_key.transmit_derivatives();
        let mut fields = SecureNetworkBeaconFields {
            flags: flags_for(network_key, iv_index).bits(),
            network_id: keys.network_id,
            iv_index: iv_index.index,
            authentication: [0; 8],
        };
        fields.authentication =
            secure_beacon_authentication(&keys.beacon_key, &fields.authenticated_data());
        fields.encode()
    }
}

/// An authenticated Private beacon
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrivateBeacon {
    /// Index of the network key that authenticated the beacon
    pub network_key_index: u16,
    /// Whether the old key material authenticated it
    pub old_key: bool,
    /// Key Refresh flag
    pub key_refresh: bool,
    /// Advertised IV Index state
    pub iv_index: IvIndex,
    /// Random used to seal the beacon
    pub random: [u8; 13],
}

impl PrivateBeacon {
    /// Decode and authenticate against the keys of `network`
    ///
    /// The old private beacon key is only tried while the key is
    /// distributing new key material.
    pub fn decode(data: &[u8], network: &MeshNetwork) -> Option<Self> {
        let fields = match PrivateBeaconFields::parse(data) {
            Ok(fields) => fields,
            Err(e) => {
                debug!("private beacon rejected: {}", e);
                return None;
            }
        };
        network.network_keys.iter().find_map(|key| {
            Self::open(&fields, key.index(), key.derivatives(), false).or_else(|| {
                match (key.phase(), key.old_derivatives()) {
                    (KeyRefreshPhase::DistributingKeys, Some(old)) => {
                        Self::open(&fields, key.index(), old, true)
                    }
                    _ => None,
                }
            })
        })
    }

    fn open(
        fields: &PrivateBeaconFields,
        network_key_index: u16,
        keys: &NetworkKeyDerivatives,
        old_key: bool,
    ) -> Option<Self> {
        let (flags, iv_index) = private_beacon_open(
            &keys.private_beacon_key,
            &fields.random,
            &fields.obfuscated,
            &fields.authentication_tag,
        )?;
        let flags = BeaconFlags::from_bits_truncate(flags);
        Some(Self {
            network_key_index,
            old_key,
            key_refresh: flags.contains(BeaconFlags::KEY_REFRESH),
            iv_index: IvIndex::new(iv_index, flags.contains(BeaconFlags::IV_UPDATE)),
            random: fields.random,
        })
    }

    /// Encode a beacon for `network_key` sealed with `random`
    pub fn encode(
        network_key: &NetworkKey,
        iv_index: &IvIndex,
        random: [u8; 13],
    ) -> Result<Bytes, TransportError> {
        let keys = network_key.transmit_derivatives();
        let (obfuscated, authentication_tag) = private_beacon_seal(
            &keys.private_beacon_key,
            &random,
            flags_for(network_key, iv_index).bits(),
            iv_index.index,
        )?;
        Ok(PrivateBeaconFields {
            random,
            obfuscated,
            authentication_tag,
        }
        .encode())
    }

    /// Encode with a fresh random
    pub fn encode_random(network_key: &NetworkKey, iv_index: &IvIndex) -> Result<Bytes, TransportError> {
        Self::encode(network_key, iv_index, rand::random())
    }
}

/// Any recognized beacon
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Beacon {
    /// Unprovisioned Device beacon
    UnprovisionedDevice(UnprovisionedDeviceBeacon),
    /// Secure Network beacon
    SecureNetwork(SecureNetworkBeacon),
    /// Private beacon
    Private(PrivateBeacon),
}

impl Beacon {
    /// Decode a beacon of any type
    pub fn decode(data: &[u8], network: &MeshNetwork) -> Option<Self> {
        let beacon_type = BeaconType::try_from(*data.first()?).ok()?;
        match beacon_type {
            BeaconType::UnprovisionedDevice => match UnprovisionedDeviceBeacon::decode(data) {
                Ok(beacon) => Some(Beacon::UnprovisionedDevice(beacon)),
                Err(e) => {
                    debug!("unprovisioned device beacon rejected: {}", e);
                    None
                }
            },
            BeaconType::SecureNetwork => {
                SecureNetworkBeacon::decode(data, network).map(Beacon::SecureNetwork)
            }
            BeaconType::Private => PrivateBeacon::decode(data, network).map(Beacon::Private),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_wire::Address;

    fn network() -> MeshNetwork {
        let mut network = MeshNetwork::new(Address(0x0001), IvIndex::new(0x1234_5678, false));
        network.network_keys.push(NetworkKey::new(0, [0x7D; 16]).unwrap());
        network
    }

    #[test]
    fn test_secure_beacon_authenticates() {
        let network = network();
        let iv = IvIndex::new(0x1234_5678, true);
        let raw = SecureNetworkBeacon::encode(&network.network_keys[0], &iv);
        let beacon = SecureNetworkBeacon::decode(&raw, &network).unwrap();
        assert_eq!(beacon.iv_index, iv);
        assert!(!beacon.key_refresh);
        assert!(!beacon.old_key);
        assert_eq!(beacon.network_id, network.network_keys[0].derivatives().network_id);
    }

    #[test]
    fn test_secure_beacon_flipped_tag_bit() {
        let network = network();
        let mut raw = SecureNetworkBeacon::encode(&network.network_keys[0], &network.iv_index).to_vec();
        raw[21] ^= 0x01;
        assert!(SecureNetworkBeacon::decode(&raw, &network).is_none());
        assert!(Beacon::decode(&raw, &network).is_none());
    }

    #[test]
    fn test_secure_beacon_old_key() {
        let mut network = network();
        let raw = SecureNetworkBeacon::encode(&network.network_keys[0], &network.iv_index);
        network.network_keys[0].start_key_refresh([0x11; 16]);
        let beacon = SecureNetworkBeacon::decode(&raw, &network).unwrap();
        assert!(beacon.old_key);

        network.network_keys[0].use_new_key();
        let raw = SecureNetworkBeacon::encode(&network.network_keys[0], &network.iv_index);
        let beacon = SecureNetworkBeacon::decode(&raw, &network).unwrap();
        assert!(beacon.key_refresh);
        assert!(!beacon.old_key);
    }

    #[test]
    fn test_private_beacon_old_key_only_while_distributing() {
        let mut network = network();
        let raw = PrivateBeacon::encode(&network.network_keys[0], &network.iv_index, [9; 13]).unwrap();
        assert!(!PrivateBeacon::decode(&raw, &network).unwrap().old_key);

        network.network_keys[0].start_key_refresh([0x11; 16]);
        assert!(PrivateBeacon::decode(&raw, &network).unwrap().old_key);

        network.network_keys[0].use_new_key();
        assert!(PrivateBeacon::decode(&raw, &network).is_none());
    }

    #[test]
    fn test_unprovisioned_and_unknown() {
        let network = network();
        let mut raw = vec![0x00];
        raw.extend_from_slice(&[0xAB; 16]);
        raw.extend_from_slice(&[0x00, 0x00]);
        assert!(matches!(
            Beacon::decode(&raw, &network),
            Some(Beacon::UnprovisionedDevice(_))
        ));
        assert!(Beacon::decode(&[0x05; 22], &network).is_none());
        assert!(Beacon::decode(&[], &network).is_none());
    }
}
