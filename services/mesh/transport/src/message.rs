//! Messages exchanged between the layers.

use crate::error::TransportError;
use crate::keys::{KeySet, MeshAddress};
use crate::upper::heartbeat::Heartbeat;
use bytes::Bytes;
use mesh_crypto::{application_nonce, decrypt, device_nonce, encrypt, Key, MicSize};
use mesh_wire::{
    access_opcode, Address, LowerTransportPdu, Opcode, WireError, MAX_ACCESS_SEGMENT_SIZE,
    MAX_SEGMENTS, MAX_UNSEGMENTED_ACCESS_SIZE,
};
use serde::Serialize;
use uuid::Uuid;

/// Largest upper transport PDU a segmented access message carries
pub const MAX_UPPER_TRANSPORT_PDU_SIZE: usize = MAX_SEGMENTS * MAX_ACCESS_SEGMENT_SIZE;

/// Identifies an outgoing access message for cancellation and status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MessageHandle {
    /// Sending element
    pub source: Address,
    /// Destination address
    pub destination: Address,
    /// Access opcode
    pub opcode: Opcode,
}

/// A complete access message as delivered by the lower transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessMessage {
    /// Source element
    pub source: Address,
    /// Destination address
    pub destination: Address,
    /// Application key identifier, `None` for device keys
    pub aid: Option<u8>,
    /// TransMIC size
    pub mic: MicSize,
    /// Sequence number of SeqAuth, used in the nonce
    pub sequence: u32,
    /// IV Index the message was received under
    pub iv_index: u32,
    /// Network key the message arrived on
    pub network_key_index: u16,
    /// TTL of the (first) Network PDU
    pub ttl: u8,
    /// Encrypted access payload followed by the TransMIC
    pub upper_transport_pdu: Bytes,
}

/// A complete control message as delivered by the lower transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    /// Source element
    pub source: Address,
    /// Destination address
    pub destination: Address,
    /// 7-bit control opcode
    pub opcode: u8,
    /// Opcode parameters
    pub parameters: Bytes,
    /// Sequence number of SeqAuth
    pub sequence: u32,
    /// IV Index the message was received under
    pub iv_index: u32,
    /// Network key the message arrived on
    pub network_key_index: u16,
    /// TTL of the (first) Network PDU
    pub ttl: u8,
}

/// An access message before encryption or after decryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpperTransportPdu {
    /// Source element
    pub source: Address,
    /// Destination, with its Label UUID if virtual
    pub destination: MeshAddress,
    /// Application key identifier, `None` for device keys
    pub aid: Option<u8>,
    /// Sequence number used in the nonce
    pub sequence: u32,
    /// IV Index used in the nonce
    pub iv_index: u32,
    /// TransMIC size
    pub mic: MicSize,
    /// Plaintext access payload
    pub access_pdu: Bytes,
    /// Encrypted access payload followed by the TransMIC
    pub transport_pdu: Bytes,
}

fn transport_nonce(
    device: bool,
    mic: MicSize,
    sequence: u32,
    source: Address,
    destination: Address,
    iv_index: u32,
) -> [u8; 13] {
    if device {
        device_nonce(mic.szmic(), sequence, source.0, destination.0, iv_index)
    } else {
        application_nonce(mic.szmic(), sequence, source.0, destination.0, iv_index)
    }
}

impl UpperTransportPdu {
    /// Encrypt `access_pdu` with the access key of `key_set`
    pub fn encrypt(
        access_pdu: Bytes,
        source: Address,
        destination: MeshAddress,
        key_set: &KeySet,
        sequence: u32,
        iv_index: u32,
        mic: MicSize,
    ) -> Result<Self, TransportError> {
        let size = access_pdu.len() + mic.size();
        if access_pdu.is_empty() || size > MAX_UPPER_TRANSPORT_PDU_SIZE {
            return Err(TransportError::PayloadTooLong(access_pdu.len()));
        }
        let aid = key_set.aid();
        let nonce = transport_nonce(
            aid.is_none(),
            mic,
            sequence,
            source,
            destination.address,
            iv_index,
        );
        let label = destination.virtual_label.map(|l| *l.as_bytes());
        let aad: &[u8] = label.as_ref().map(|l| &l[..]).unwrap_or(&[]);
        let sealed = encrypt(key_set.access_key(), &nonce, aad, &access_pdu, mic)?;

        Ok(Self {
            source,
            destination,
            aid,
            sequence,
            iv_index,
            mic,
            access_pdu,
            transport_pdu: Bytes::from(sealed),
        })
    }

    /// Try to decrypt `message` with one candidate key
    pub fn decrypt(message: &AccessMessage, key: &Key, label: Option<Uuid>) -> Option<Self> {
        let nonce = transport_nonce(
            message.aid.is_none(),
            message.mic,
            message.sequence,
            message.source,
            message.destination,
            message.iv_index,
        );
        let aad = label.map(|l| *l.as_bytes());
        let aad: &[u8] = aad.as_ref().map(|l| &l[..]).unwrap_or(&[]);
        let plain = decrypt(key, &nonce, aad, &message.upper_transport_pdu, message.mic).ok()?;

        Some(Self {
            source: message.source,
            destination: MeshAddress {
                address: message.destination,
                virtual_label: label,
            },
            aid: message.aid,
            sequence: message.sequence,
            iv_index: message.iv_index,
            mic: message.mic,
            access_pdu: Bytes::from(plain),
            transport_pdu: message.upper_transport_pdu.clone(),
        })
    }

    /// Whether the encrypted PDU needs segmentation
    pub fn is_segmented(&self) -> bool {
        self.transport_pdu.len() > MAX_UNSEGMENTED_ACCESS_SIZE || self.mic == MicSize::Large
    }

    /// Access opcode of the plaintext payload
    pub fn opcode(&self) -> Result<Opcode, WireError> {
        access_opcode(&self.access_pdu)
    }
}

/// A request to send one access message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest {
    /// Plaintext access payload
    pub access_pdu: Bytes,
    /// Sending element
    pub source: Address,
    /// Destination
    pub destination: MeshAddress,
    /// TTL, or the default when `None`
    pub ttl: Option<u8>,
    /// Keys to secure the message with
    pub key_set: KeySet,
    /// Segment even when the payload fits one PDU
    pub force_segmented: bool,
}

impl AccessRequest {
    /// Build a request; fails if the payload has no valid opcode
    pub fn new(
        access_pdu: Bytes,
        source: Address,
        destination: MeshAddress,
        ttl: Option<u8>,
        key_set: KeySet,
    ) -> Result<Self, TransportError> {
        access_opcode(&access_pdu)?;
        Ok(Self {
            access_pdu,
            source,
            destination,
            ttl,
            key_set,
            force_segmented: false,
        })
    }

    /// Handle identifying this message
    pub fn handle(&self) -> MessageHandle {
        MessageHandle {
            source: self.source,
            destination: self.destination.address,
            opcode: access_opcode(&self.access_pdu).unwrap_or(Opcode(0)),
        }
    }

    /// Whether the message will be segmented
    pub fn is_segmented(&self) -> bool {
        self.force_segmented || self.access_pdu.len() + MicSize::Small.size() > MAX_UNSEGMENTED_ACCESS_SIZE
    }
}

/// A request to send one transport control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    /// 7-bit control opcode
    pub opcode: u8,
    /// Opcode parameters
    pub parameters: Bytes,
    /// Sending element
    pub source: Address,
    /// Destination
    pub destination: Address,
    /// TTL, or the default when `None`
    pub ttl: Option<u8>,
    /// Network key to send on
    pub network_key_index: u16,
}

/// A lower transport PDU waiting for network layer encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPdu {
    /// Lower transport PDU
    pub pdu: LowerTransportPdu,
    /// Sending element
    pub source: Address,
    /// Destination
    pub destination: Address,
    /// TTL, or the default when `None`
    pub ttl: Option<u8>,
    /// Network key to send on
    pub network_key_index: u16,
    /// Sequence number already bound to this PDU, if any
    pub sequence: Option<u32>,
}

/// Work items the layers hand back to the network manager
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Encode and send a PDU through the bearer
    Transmit(OutboundPdu),
    /// An access message was received and needs decryption
    AccessReceived(AccessMessage),
    /// A control message was received
    ControlReceived(ControlMessage),
    /// A segmented message left the lower transport layer
    SegmentedSendCompleted {
        /// Destination of the message
        destination: Address,
        /// Handle of the access message, `None` for control messages
        handle: Option<MessageHandle>,
        /// Outcome
        result: Result<(), TransportError>,
    },
    /// An access message may now be encrypted and sent
    Dispatch(AccessRequest),
    /// Send a control message
    SendControl(ControlRequest),
    /// An access message was sent (and acknowledged, if segmented to a unicast)
    MessageSent(MessageHandle),
    /// An access message could not be delivered
    MessageFailed(MessageHandle, TransportError),
    /// A Heartbeat matching the subscription arrived
    HeartbeatReceived(Heartbeat),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_key_set() -> KeySet {
        KeySet::Application {
            network_key: 0,
            application_key: 0,
            key: [0x63; 16],
            aid: 0x26,
        }
    }

    fn received(pdu: &UpperTransportPdu) -> AccessMessage {
        AccessMessage {
            source: pdu.source,
            destination: pdu.destination.address,
            aid: pdu.aid,
            mic: pdu.mic,
            sequence: pdu.sequence,
            iv_index: pdu.iv_index,
            network_key_index: 0,
            ttl: 5,
            upper_transport_pdu: pdu.transport_pdu.clone(),
        }
    }

    #[test]
    fn test_roundtrip_both_mic_sizes() {
        for mic in [MicSize::Small, MicSize::Large] {
            let pdu = UpperTransportPdu::encrypt(
                Bytes::from_static(&[0x82, 0x02, 0x01]),
                Address(0x0001),
                MeshAddress::new(Address(0x0002)),
                &app_key_set(),
                0x3129AB,
                0x1234_5678,
                mic,
            )
            .unwrap();
            assert_eq!(pdu.transport_pdu.len(), 3 + mic.size());
            let decoded = UpperTransportPdu::decrypt(&received(&pdu), &[0x63; 16], None).unwrap();
            assert_eq!(decoded, pdu);
        }
    }

    #[test]
    fn test_virtual_label_is_authenticated() {
        let label = Uuid::from_bytes([0x0F; 16]);
        let pdu = UpperTransportPdu::encrypt(
            Bytes::from_static(&[0x04, 0x00]),
            Address(0x0001),
            MeshAddress::from_label(label),
            &app_key_set(),
            7,
            0,
            MicSize::Small,
        )
        .unwrap();
        let message = received(&pdu);
        assert!(UpperTransportPdu::decrypt(&message, &[0x63; 16], None).is_none());
        assert!(UpperTransportPdu::decrypt(&message, &[0x63; 16], Some(Uuid::nil())).is_none());
        assert_eq!(
            UpperTransportPdu::decrypt(&message, &[0x63; 16], Some(label)).unwrap(),
            pdu
        );
    }

    #[test]
    fn test_device_nonce_differs() {
        let device = KeySet::Device {
            network_key: 0,
            node: Address(0x0002),
            key: [0x63; 16],
        };
        let pdu = UpperTransportPdu::encrypt(
            Bytes::from_static(&[0x80, 0x08]),
            Address(0x0001),
            MeshAddress::new(Address(0x0002)),
            &device,
            1,
            0,
            MicSize::Small,
        )
        .unwrap();
        assert_eq!(pdu.aid, None);
        let mut message = received(&pdu);
        assert!(UpperTransportPdu::decrypt(&message, &[0x63; 16], None).is_some());
        message.aid = Some(0x26);
        assert!(UpperTransportPdu::decrypt(&message, &[0x63; 16], None).is_none());
    }

    #[test]
    fn test_request_segmentation() {
        let request = AccessRequest::new(
            Bytes::from(vec![0x04; 11]),
            Address(0x0001),
            MeshAddress::new(Address(0x0002)),
            None,
            app_key_set(),
        )
        .unwrap();
        assert!(!request.is_segmented());
        assert_eq!(request.handle().opcode, Opcode(0x04));

        let mut request = AccessRequest {
            access_pdu: Bytes::from(vec![0x04; 12]),
            ..request
        };
        assert!(request.is_segmented());
        request.access_pdu = Bytes::from(vec![0x04; 2]);
        request.force_segmented = true;
        assert!(request.is_segmented());
        assert!(AccessRequest::new(
            Bytes::new(),
            Address(0x0001),
            MeshAddress::new(Address(0x0002)),
            None,
            app_key_set()
        )
        .is_err());
    }
}
