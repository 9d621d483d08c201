//! Network PDU codec.
//!
//! Encoding encrypts `DST || TransportPDU` first and then obfuscates the
//! header with the resulting ciphertext. Decoding reverses this for every
//! network key (current or old material) whose NID matches.

use crate::error::TransportError;
use crate::keys::{KeyRefreshPhase, MeshNetwork, NetworkKey, NetworkKeyDerivatives};
use bytes::{BufMut, Bytes, BytesMut};
use mesh_crypto::{decrypt, encrypt, network_nonce, obfuscate, privacy_random, MicSize};
use mesh_wire::{
    Address, IviNid, NetworkHeader, PduType, CONTROL_NETWORK_PDU_MIN_SIZE, NETWORK_PDU_MIN_SIZE,
    OBFUSCATED_HEADER_SIZE,
};
use tracing::debug;

const ENCRYPTED_OFFSET: usize = 1 + OBFUSCATED_HEADER_SIZE;

fn net_mic(pdu_type: PduType) -> MicSize {
    match pdu_type {
        PduType::Access => MicSize::Small,
        PduType::Control => MicSize::Large,
    }
}

/// A decoded or freshly encoded Network PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPdu {
    /// Raw bytes as carried by the bearer
    pub raw: Bytes,
    /// Index of the network key that secures the PDU
    pub network_key_index: u16,
    /// Whether the old key material of that key was used
    pub old_key: bool,
    /// Least significant bit of the IV Index
    pub ivi: u8,
    /// Network identifier
    pub nid: u8,
    /// IV Index the PDU was secured with
    pub iv_index: u32,
    /// Access or control
    pub pdu_type: PduType,
    /// Time to live
    pub ttl: u8,
    /// 24-bit sequence number
    pub sequence: u32,
    /// Source unicast address
    pub source: Address,
    /// Destination address
    pub destination: Address,
    /// Lower transport PDU
    pub transport_pdu: Bytes,
}

impl NetworkPdu {
    /// Decode `raw` against the keys of `network`
    ///
    /// Returns `None` when no key and IV Index candidate authenticates the
    /// PDU, which is the normal outcome for foreign traffic.
    pub fn decode(raw: &[u8], network: &MeshNetwork) -> Option<Self> {
        if raw.len() < NETWORK_PDU_MIN_SIZE {
            debug!("network pdu too short len={}", raw.len());
            return None;
        }
        let IviNid { ivi, nid } = IviNid::unpack(raw[0]);
        let iv_index = network.iv_index.receive_index(ivi)?;

        for key in &network.network_keys {
            for (derivatives, old_key) in key.receive_derivatives() {
                if derivatives.nid != nid {
                    continue;
                }
                if let Some(pdu) = Self::decode_with(raw, key.index(), derivatives, old_key, iv_index)
                {
                    return Some(pdu);
                }
            }
        }
        None
    }

    fn decode_with(
        raw: &[u8],
        network_key_index: u16,
        keys: &NetworkKeyDerivatives,
        old_key: bool,
        iv_index: u32,
    ) -> Option<Self> {
        let encrypted = &raw[ENCRYPTED_OFFSET..];
        let random = privacy_random(encrypted)?;
        let mut obfuscated = [0u8; OBFUSCATED_HEADER_SIZE];
        obfuscated.copy_from_slice(&raw[1..ENCRYPTED_OFFSET]);
        let plain_header = obfuscate(&keys.privacy_key, iv_index, &random, &obfuscated);
        let header = NetworkHeader::decode(&plain_header).ok()?;

        if header.pdu_type == PduType::Control && raw.len() < CONTROL_NETWORK_PDU_MIN_SIZE {
            return None;
        }
        if !header.source.is_unicast() {
            return None;
        }

        let nonce = network_nonce(
            header.ctl_ttl(),
            header.sequence,
            header.source.0,
            iv_index,
        );
        let plain = decrypt(
            &keys.encryption_key,
            &nonce,
            &[],
            encrypted,
            net_mic(header.pdu_type),
        )
        .ok()?;
        if plain.len() < 3 {
            return None;
        }
        let destination = Address::from_be_bytes([plain[0], plain[1]]);
        if destination.is_unassigned() {
            return None;
        }

        Some(Self {
            raw: Bytes::copy_from_slice(raw),
            network_key_index,
            old_key,
            ivi: IviNid::unpack(raw[0]).ivi,
            nid: keys.nid,
            iv_index,
            pdu_type: header.pdu_type,
            ttl: header.ttl,
            sequence: header.sequence,
            source: header.source,
            destination,
            transport_pdu: Bytes::copy_from_slice(&plain[2..]),
        })
    }

    /// Encode a lower transport PDU with the transmit keys of `network_key`
    #[allow(clippy::too_many_arguments)]
    pub fn encode(
        transport_pdu: &[u8],
        pdu_type: PduType,
        ttl: u8,
        sequence: u32,
        source: Address,
        destination: Address,
        network_key: &NetworkKey,
        iv_index: u32,
    ) -> Result<Self, TransportError> {
        if transport_pdu.is_empty() || transport_pdu.len() > pdu_type.max_transport_pdu_size() {
            return Err(TransportError::PayloadTooLong(transport_pdu.len()));
        }
        if !source.is_unicast() {
            return Err(TransportError::InvalidAddress(source));
        }
        if destination.is_unassigned() {
            return Err(TransportError::InvalidAddress(destination));
        }

        let keys = network_key.transmit_derivatives();
        let header = NetworkHeader {
            pdu_type,
            ttl,
            sequence,
            source,
        };
        let plain_header = header.encode();
        let nonce = network_nonce(plain_header[0], sequence, source.0, iv_index);

        let mut plain = BytesMut::with_capacity(2 + transport_pdu.len());
        plain.put_slice(&destination.to_be_bytes());
        plain.put_slice(transport_pdu);
        let encrypted = encrypt(&keys.encryption_key, &nonce, &[], &plain, net_mic(pdu_type))?;

        let random = privacy_random(&encrypted)
            .ok_or(TransportError::PayloadTooLong(transport_pdu.len()))?;
        let obfuscated = obfuscate(&keys.privacy_key, iv_index, &random, &plain_header);

        let ivi = (iv_index & 1) as u8;
        let mut raw = BytesMut::with_capacity(ENCRYPTED_OFFSET + encrypted.len());
        raw.put_u8(IviNid { ivi, nid: keys.nid }.pack());
        raw.put_slice(&obfuscated);
        raw.put_slice(&encrypted);

        Ok(Self {
            raw: raw.freeze(),
            network_key_index: network_key.index(),
            old_key: network_key.phase() == KeyRefreshPhase::DistributingKeys
                && network_key.old_derivatives().is_some(),
            ivi,
            nid: keys.nid,
            iv_index,
            pdu_type,
            ttl,
            sequence,
            source,
            destination,
            transport_pdu: Bytes::copy_from_slice(transport_pdu),
        })
    }
}
