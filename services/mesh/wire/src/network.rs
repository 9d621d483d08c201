//! Network PDU header fields.
//!
//! Only the first byte (IVI and NID) travels in the clear. The following six
//! bytes are obfuscated and the rest is encrypted, so this module only packs
//! the plaintext form; the codec in `mesh-transport` applies the crypto.

use crate::address::Address;
use crate::error::WireError;
use serde::{Deserialize, Serialize};

/// Smallest Network PDU: IVI/NID, obfuscated header and 7 bytes of privacy random
pub const NETWORK_PDU_MIN_SIZE: usize = 14;

/// Smallest control Network PDU (64-bit NetMIC)
pub const CONTROL_NETWORK_PDU_MIN_SIZE: usize = 18;

/// CTL/TTL, SEQ and SRC
pub const OBFUSCATED_HEADER_SIZE: usize = 6;

/// Bytes of ciphertext that feed the privacy random
pub const PRIVACY_RANDOM_SIZE: usize = 7;

/// Largest Network PDU an advertising bearer carries
pub const NETWORK_PDU_MAX_SIZE: usize = 29;

/// Largest valid TTL
pub const MAX_TTL: u8 = 0x7F;

/// Network PDU type, selected by the CTL bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PduType {
    /// CTL = 0
    Access,
    /// CTL = 1
    Control,
}

impl PduType {
    /// NetMIC length for this type
    pub fn net_mic_size(self) -> usize {
        match self {
            PduType::Access => 4,
            PduType::Control => 8,
        }
    }

    /// Largest lower transport PDU for this type
    pub fn max_transport_pdu_size(self) -> usize {
        NETWORK_PDU_MAX_SIZE - 1 - OBFUSCATED_HEADER_SIZE - 2 - self.net_mic_size()
    }

    /// CTL bit
    pub fn ctl(self) -> bool {
        matches!(self, PduType::Control)
    }
}

/// The clear first byte of a Network PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IviNid {
    /// Least significant bit of the IV Index
    pub ivi: u8,
    /// Network identifier derived from the network key
    pub nid: u8,
}

impl IviNid {
    /// Pack into one byte
    pub fn pack(self) -> u8 {
        ((self.ivi & 0x01) << 7) | (self.nid & 0x7F)
    }

    /// Unpack from one byte
    pub fn unpack(byte: u8) -> Self {
        Self {
            ivi: byte >> 7,
            nid: byte & 0x7F,
        }
    }
}

/// The obfuscated part of the Network PDU header, in plaintext
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkHeader {
    /// PDU type (CTL bit)
    pub pdu_type: PduType,
    /// Time to live (0..=127)
    pub ttl: u8,
    /// 24-bit sequence number
    pub sequence: u32,
    /// Source unicast address
    pub source: Address,
}

impl NetworkHeader {
    /// Encode to the 6 plaintext bytes that get obfuscated
    pub fn encode(&self) -> [u8; OBFUSCATED_HEADER_SIZE] {
        let seq = self.sequence.to_be_bytes();
        let src = self.source.to_be_bytes();
        [
            ((self.pdu_type.ctl() as u8) << 7) | (self.ttl & MAX_TTL),
            seq[1],
            seq[2],
            seq[3],
            src[0],
            src[1],
        ]
    }

    /// Decode from deobfuscated bytes
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        WireError::check_len(data, OBFUSCATED_HEADER_SIZE)?;
        let pdu_type = if data[0] & 0x80 != 0 {
            PduType::Control
        } else {
            PduType::Access
        };
        Ok(Self {
            pdu_type,
            ttl: data[0] & MAX_TTL,
            sequence: u32::from_be_bytes([0, data[1], data[2], data[3]]),
            source: Address::from_be_bytes([data[4], data[5]]),
        })
    }

    /// The CTL/TTL byte
    pub fn ctl_ttl(&self) -> u8 {
        self.encode()[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ivi_nid() {
        let byte = IviNid { ivi: 1, nid: 0x68 }.pack();
        assert_eq!(byte, 0xE8);
        assert_eq!(IviNid::unpack(0x68), IviNid { ivi: 0, nid: 0x68 });
    }

    #[test]
    fn test_header_layout() {
        let header = NetworkHeader {
            pdu_type: PduType::Control,
            ttl: 0,
            sequence: 0x000001,
            source: Address(0x1201),
        };
        assert_eq!(header.encode(), [0x80, 0x00, 0x00, 0x01, 0x12, 0x01]);
        assert_eq!(NetworkHeader::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn test_header_too_short() {
        assert!(matches!(
            NetworkHeader::decode(&[0x80, 0x00]),
            Err(WireError::Length { need: 6, got: 2 })
        ));
    }

    #[test]
    fn test_transport_pdu_limits() {
        assert_eq!(PduType::Access.max_transport_pdu_size(), 16);
        assert_eq!(PduType::Control.max_transport_pdu_size(), 12);
    }
}
