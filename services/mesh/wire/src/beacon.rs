//! Mesh beacon layouts.
//!
//! Secure Network and Private beacons are only meaningful once authenticated
//! against a network key; this module splits them into their raw fields and
//! leaves authentication to the beacon codec in `mesh-transport`.

use crate::error::WireError;
use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Secure Network beacon length including the type byte
pub const SECURE_NETWORK_BEACON_SIZE: usize = 22;

/// Private beacon length including the type byte
pub const PRIVATE_BEACON_SIZE: usize = 27;

/// Unprovisioned Device beacon length without URI hash
pub const UNPROVISIONED_BEACON_SIZE: usize = 19;

/// Unprovisioned Device beacon length with URI hash
pub const UNPROVISIONED_BEACON_WITH_URI_SIZE: usize = 23;

/// Beacon type tag (first byte)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeaconType {
    /// Unprovisioned Device beacon
    UnprovisionedDevice = 0x00,
    /// Secure Network beacon
    SecureNetwork = 0x01,
    /// Mesh Private beacon
    Private = 0x02,
}

impl TryFrom<u8> for BeaconType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(BeaconType::UnprovisionedDevice),
            0x01 => Ok(BeaconType::SecureNetwork),
            0x02 => Ok(BeaconType::Private),
            _ => Err(WireError::BeaconType(value)),
        }
    }
}

bitflags! {
    /// Flags carried by Secure Network and Private beacons
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct BeaconFlags: u8 {
        /// Key Refresh procedure in phase 2
        const KEY_REFRESH = 1 << 0;
        /// IV Update in progress
        const IV_UPDATE = 1 << 1;
    }
}

bitflags! {
    /// Out-of-band information advertised by unprovisioned devices
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct OobInformation: u16 {
        /// Other location
        const OTHER = 1 << 0;
        /// Electronic / URI
        const ELECTRONIC_URI = 1 << 1;
        /// 2D machine-readable code
        const MACHINE_READABLE_CODE = 1 << 2;
        /// Bar code
        const BAR_CODE = 1 << 3;
        /// Near Field Communication
        const NFC = 1 << 4;
        /// Number
        const NUMBER = 1 << 5;
        /// String
        const STRING = 1 << 6;
        /// Certificate-based provisioning supported
        const CERTIFICATE_BASED_PROVISIONING = 1 << 7;
        /// Provisioning records supported
        const PROVISIONING_RECORDS = 1 << 8;
        /// On box
        const ON_BOX = 1 << 11;
        /// Inside box
        const INSIDE_BOX = 1 << 12;
        /// On piece of paper
        const ON_PIECE_OF_PAPER = 1 << 13;
        /// Inside manual
        const INSIDE_MANUAL = 1 << 14;
        /// On device
        const ON_DEVICE = 1 << 15;
    }
}

/// Raw fields of a Secure Network beacon
///
/// ```text
/// [type=1][flags][NetworkID (8)][IV Index (4, BE)][Authentication (8)]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureNetworkBeaconFields {
    /// Raw flags byte
    pub flags: u8,
    /// Network ID derived from the network key
    pub network_id: [u8; 8],
    /// Current IV Index of the sender
    pub iv_index: u32,
    /// Truncated AES-CMAC over flags, network ID and IV Index
    pub authentication: [u8; 8],
}

impl SecureNetworkBeaconFields {
    /// Split a beacon into its fields; requires exactly 22 bytes and type 1
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.len() != SECURE_NETWORK_BEACON_SIZE {
            return Err(WireError::Length {
                need: SECURE_NETWORK_BEACON_SIZE,
                got: data.len(),
            });
        }
        if data[0] != BeaconType::SecureNetwork as u8 {
            return Err(WireError::BeaconType(data[0]));
        }
        let mut network_id = [0u8; 8];
        network_id.copy_from_slice(&data[2..10]);
        let mut authentication = [0u8; 8];
        authentication.copy_from_slice(&data[14..22]);
        Ok(Self {
            flags: data[1],
            network_id,
            iv_index: u32::from_be_bytes([data[10], data[11], data[12], data[13]]),
            authentication,
        })
    }

    /// The 13 authenticated bytes: flags, network ID and IV Index
    pub fn authenticated_data(&self) -> [u8; 13] {
        let mut data = [0u8; 13];
        data[0] = self.flags;
        data[1..9].copy_from_slice(&self.network_id);
        data[9..13].copy_from_slice(&self.iv_index.to_be_bytes());
        data
    }

    /// Encode the full beacon
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SECURE_NETWORK_BEACON_SIZE);
        buf.put_u8(BeaconType::SecureNetwork as u8);
        buf.put_slice(&self.authenticated_data());
        buf.put_slice(&self.authentication);
        buf.freeze()
    }
}

/// Raw fields of a Private beacon
///
/// ```text
/// [type=2][Random (13)][Obfuscated flags + IV Index (5)][Authentication tag (8)]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateBeaconFields {
    /// Random used as the CCM nonce
    pub random: [u8; 13],
    /// Encrypted flags and IV Index
    pub obfuscated: [u8; 5],
    /// 64-bit authentication tag
    pub authentication_tag: [u8; 8],
}

impl PrivateBeaconFields {
    /// Split a beacon into its fields; requires exactly 27 bytes and type 2
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.len() != PRIVATE_BEACON_SIZE {
            return Err(WireError::Length {
                need: PRIVATE_BEACON_SIZE,
                got: data.len(),
            });
        }
        if data[0] != BeaconType::Private as u8 {
            return Err(WireError::BeaconType(data[0]));
        }
        let mut fields = Self {
            random: [0; 13],
            obfuscated: [0; 5],
            authentication_tag: [0; 8],
        };
        fields.random.copy_from_slice(&data[1..14]);
        fields.obfuscated.copy_from_slice(&data[14..19]);
        fields.authentication_tag.copy_from_slice(&data[19..27]);
        Ok(fields)
    }

    /// Encode the full beacon
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PRIVATE_BEACON_SIZE);
        buf.put_u8(BeaconType::Private as u8);
        buf.put_slice(&self.random);
        buf.put_slice(&self.obfuscated);
        buf.put_slice(&self.authentication_tag);
        buf.freeze()
    }
}

/// Unprovisioned Device beacon
///
/// ```text
/// [type=0][Device UUID (16)][OOB Information (2, BE)][URI Hash (4)]?
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnprovisionedDeviceBeacon {
    /// Device UUID
    pub device_uuid: Uuid,
    /// OOB information
    pub oob: OobInformation,
    /// Hash of the advertised URI, when present
    pub uri_hash: Option<[u8; 4]>,
}

impl UnprovisionedDeviceBeacon {
    /// Decode; the URI hash is present only when the beacon is 23 bytes long
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        WireError::check_len(data, UNPROVISIONED_BEACON_SIZE)?;
        if data[0] != BeaconType::UnprovisionedDevice as u8 {
            return Err(WireError::BeaconType(data[0]));
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&data[1..17]);
        let uri_hash = if data.len() == UNPROVISIONED_BEACON_WITH_URI_SIZE {
            let mut hash = [0u8; 4];
            hash.copy_from_slice(&data[19..23]);
            Some(hash)
        } else {
            None
        };
        Ok(Self {
            device_uuid: Uuid::from_bytes(uuid),
            oob: OobInformation::from_bits_retain(u16::from_be_bytes([data[17], data[18]])),
            uri_hash,
        })
    }

    /// Encode the beacon
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(UNPROVISIONED_BEACON_WITH_URI_SIZE);
        buf.put_u8(BeaconType::UnprovisionedDevice as u8);
        buf.put_slice(self.device_uuid.as_bytes());
        buf.put_u16(self.oob.bits());
        if let Some(hash) = self.uri_hash {
            buf.put_slice(&hash);
        }
        buf.freeze()
    }
}
