//! Offline decoding of captured PDUs against a configured network.
//!
//! PDUs go through the same network, lower and upper transport layers a live
//! node uses, so segmented messages are reassembled across several inputs.

use anyhow::{anyhow, Result};
use mesh_transport::lower::segmentation::seq_auth_sequence;
use mesh_transport::{
    Beacon, Heartbeat, KeySet, LowerTransportLayer, MeshNetwork, NetworkLayer, Scheduler,
    TimerEvent, TransportConfig, TransportEvent, UpperTransportLayer,
};
use mesh_wire::{access_opcode, Address, ControlOpcode, LowerTransportPdu, PduType, SegmentAck};
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

/// One decoded Network PDU
#[derive(Debug, Serialize)]
pub struct DecodedPdu {
    pub network_key_index: u16,
    pub old_key: bool,
    pub iv_index: u32,
    pub nid: u8,
    pub control: bool,
    pub ttl: u8,
    pub sequence: u32,
    pub source: Address,
    pub destination: Address,
    pub transport: LowerTransportPdu,
    /// Messages completed by this PDU
    pub messages: Vec<DecodedMessage>,
}

/// A complete upper transport message
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecodedMessage {
    Access {
        source: Address,
        destination: Address,
        key: String,
        opcode: Option<u32>,
        payload: String,
    },
    Undecryptable {
        source: Address,
        destination: Address,
        aid: Option<u8>,
    },
    Heartbeat(Heartbeat),
    SegmentAck(SegmentAck),
    Control {
        opcode: u8,
        parameters: String,
    },
}

fn describe_keys(key_set: &KeySet) -> String {
    match key_set {
        KeySet::Application { application_key, .. } => format!("application key {}", application_key),
        KeySet::Device { node, .. } => format!("device key of {}", node),
    }
}

/// Feeds captured PDUs through the transport layers
pub struct Decoder {
    network: MeshNetwork,
    network_layer: NetworkLayer,
    lower: LowerTransportLayer,
    upper: UpperTransportLayer,
    // Acknowledgment timers fire into this channel and are never acted on
    _timers: mpsc::UnboundedReceiver<TimerEvent>,
}

impl Decoder {
    pub fn new(network: MeshNetwork, config: TransportConfig) -> Self {
        let (tx, timers) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(tx);
        Self {
            network,
            network_layer: NetworkLayer::new(&config),
            lower: LowerTransportLayer::new(config.clone(), scheduler.clone()),
            upper: UpperTransportLayer::new(config, scheduler),
            _timers: timers,
        }
    }

    /// Sources with a segmented message still missing segments
    pub fn incomplete_sources(&self) -> Vec<Address> {
        self.network
            .nodes
            .iter()
            .map(|node| node.primary_address)
            .filter(|address| self.lower.is_receiving_message(*address))
            .collect()
    }

    /// Decode one Network PDU
    pub fn decode(&mut self, raw: &[u8]) -> Result<DecodedPdu> {
        let pdu = self
            .network_layer
            .receive(raw, &self.network)
            .ok_or_else(|| anyhow!("no network key authenticates this PDU, or it was already decoded"))?;
        let transport = LowerTransportPdu::decode(pdu.pdu_type, &pdu.transport_pdu)?;
        let sequence = match transport.segment_header() {
            Some(header) => seq_auth_sequence(pdu.sequence, header.seq_zero)
                .ok_or_else(|| anyhow!("SeqZero {} impossible for sequence {}", header.seq_zero, pdu.sequence))?,
            None => pdu.sequence,
        };

        let mut messages = Vec::new();
        if let LowerTransportPdu::UnsegmentedControl(control) = &transport {
            if control.opcode == ControlOpcode::SegmentAck as u8 {
                messages.push(DecodedMessage::SegmentAck(SegmentAck::decode(&control.parameters)?));
            }
        }

        for event in self.lower.receive(&pdu, transport.clone(), sequence) {
            match event {
                TransportEvent::AccessReceived(message) => {
                    messages.push(match self.upper.decrypt(&message, &self.network) {
                        Some((access, key_set)) => DecodedMessage::Access {
                            source: access.source,
                            destination: message.destination,
                            key: describe_keys(&key_set),
                            opcode: access_opcode(&access.access_pdu).ok().map(|op| op.0),
                            payload: hex::encode(&access.access_pdu),
                        },
                        None => DecodedMessage::Undecryptable {
                            source: message.source,
                            destination: message.destination,
                            aid: message.aid,
                        },
                    });
                }
                TransportEvent::ControlReceived(message) => {
                    messages.push(if message.opcode == ControlOpcode::Heartbeat as u8 {
                        DecodedMessage::Heartbeat(Heartbeat::from_control(&message)?)
                    } else {
                        DecodedMessage::Control {
                            opcode: message.opcode,
                            parameters: hex::encode(&message.parameters),
                        }
                    });
                }
                other => debug!(component = "decode", "ignoring {:?}", other),
            }
        }

        Ok(DecodedPdu {
            network_key_index: pdu.network_key_index,
            old_key: pdu.old_key,
            iv_index: pdu.iv_index,
            nid: pdu.nid,
            control: pdu.pdu_type == PduType::Control,
            ttl: pdu.ttl,
            sequence: pdu.sequence,
            source: pdu.source,
            destination: pdu.destination,
            transport,
            messages,
        })
    }

    /// Decode a beacon
    pub fn decode_beacon(&self, raw: &[u8]) -> Result<Beacon> {
        self.network_layer
            .receive_beacon(raw, &self.network)
            .ok_or_else(|| anyhow!("unknown beacon, or no network key authenticates it"))
    }
}

impl fmt::Display for DecodedPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} PDU {} -> {} seq={:06X} ttl={} iv_index={:08X}",
            if self.control { "Control" } else { "Access" },
            self.source,
            self.destination,
            self.sequence,
            self.ttl,
            self.iv_index
        )?;
        writeln!(
            f,
            "  network key {} nid={:02X}{}",
            self.network_key_index,
            self.nid,
            if self.old_key { " (old key)" } else { "" }
        )?;
        match &self.transport {
            LowerTransportPdu::UnsegmentedAccess(access) => {
                writeln!(f, "  unsegmented access aid={:?}", access.aid)?
            }
            LowerTransportPdu::SegmentedAccess(access) => writeln!(
                f,
                "  segment {}/{} seq_zero={:04X} aid={:?} szmic={}",
                access.header.segment_offset,
                access.header.last_segment_number,
                access.header.seq_zero,
                access.aid,
                access.szmic
            )?,
            LowerTransportPdu::UnsegmentedControl(control) => {
                writeln!(f, "  unsegmented control opcode={:02X}", control.opcode)?
            }
            LowerTransportPdu::SegmentedControl(control) => writeln!(
                f,
                "  segment {}/{} seq_zero={:04X} control opcode={:02X}",
                control.header.segment_offset,
                control.header.last_segment_number,
                control.header.seq_zero,
                control.opcode
            )?,
        }
        for message in &self.messages {
            writeln!(f, "  {}", message)?;
        }
        Ok(())
    }
}

impl fmt::Display for DecodedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedMessage::Access {
                key,
                opcode,
                payload,
                ..
            } => match opcode {
                Some(opcode) => write!(f, "access opcode={:X} [{}] via {}", opcode, payload, key),
                None => write!(f, "access [{}] via {}", payload, key),
            },
            DecodedMessage::Undecryptable { aid, .. } => {
                write!(f, "access message no key opens (aid={:?})", aid)
            }
            DecodedMessage::Heartbeat(heartbeat) => write!(
                f,
                "heartbeat init_ttl={} hops={} features={:?}",
                heartbeat.init_ttl,
                heartbeat.hops(),
                heartbeat.features
            ),
            DecodedMessage::SegmentAck(ack) => write!(
                f,
                "segment ack seq_zero={:04X} block_ack={:08X}{}",
                ack.seq_zero,
                ack.block_ack,
                if ack.obo { " obo" } else { "" }
            ),
            DecodedMessage::Control { opcode, parameters } => {
                write!(f, "control opcode={:02X} [{}]", opcode, parameters)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mesh_crypto::MicSize;
    use mesh_transport::lower::segmentation::segment_access;
    use mesh_transport::{
        ApplicationKey, IvIndex, MeshAddress, NetworkKey, NetworkPdu, Node, SecureNetworkBeacon,
        UpperTransportPdu,
    };
    use mesh_wire::{Features, HeartbeatPayload, UnsegmentedAccess, UnsegmentedControl};

    const SOURCE: Address = Address(0x1201);
    const TARGET: Address = Address(0x0003);

    fn network() -> MeshNetwork {
        let mut network = MeshNetwork::new(TARGET, IvIndex::new(0x1234_5678, false));
        network.network_keys.push(
            NetworkKey::new(0, hex::decode("7dd7364cd842ad18c17c2b820c84c3d6").unwrap().try_into().unwrap())
                .unwrap(),
        );
        network.application_keys.push(
            ApplicationKey::new(0, hex::decode("63964771734fbd76e3b40519d1d94a48").unwrap().try_into().unwrap(), 0)
                .unwrap(),
        );
        network.nodes.push(Node::new(SOURCE, 1, None));
        network
    }

    fn encode(network: &MeshNetwork, lower: &LowerTransportPdu, sequence: u32) -> Bytes {
        NetworkPdu::encode(
            &lower.encode(),
            lower.pdu_type(),
            4,
            sequence,
            SOURCE,
            TARGET,
            &network.network_keys[0],
            network.iv_index.transmit_index(),
        )
        .unwrap()
        .raw
    }

    fn encrypted(network: &MeshNetwork, payload: &[u8], sequence: u32, mic: MicSize) -> UpperTransportPdu {
        let keys = KeySet::application(&network.network_keys[0], &network.application_keys[0]);
        UpperTransportPdu::encrypt(
            Bytes::copy_from_slice(payload),
            SOURCE,
            MeshAddress::new(TARGET),
            &keys,
            sequence,
            network.iv_index.transmit_index(),
            mic,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_decode_unsegmented_access() {
        let network = network();
        let upper = encrypted(&network, &[0x82, 0x02, 0x01], 7, MicSize::Small);
        let lower = LowerTransportPdu::UnsegmentedAccess(UnsegmentedAccess {
            aid: upper.aid,
            upper_transport_pdu: upper.transport_pdu,
        });
        let raw = encode(&network, &lower, 7);

        let mut decoder = Decoder::new(network, TransportConfig::default());
        let decoded = decoder.decode(&raw).unwrap();
        assert_eq!(decoded.source, SOURCE);
        assert_eq!(decoded.nid, 0x68);
        assert!(!decoded.control);
        match &decoded.messages[..] {
            [DecodedMessage::Access { opcode, payload, key, .. }] => {
                assert_eq!(*opcode, Some(0x8202));
                assert_eq!(payload, "820201");
                assert_eq!(key, "application key 0");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(decoded.to_string().contains("opcode=8202"));

        // the network cache remembers it
        assert!(decoder.decode(&raw).is_err());
    }

    #[tokio::test]
    async fn test_decode_reassembles_segments() {
        let network = network();
        let payload: Vec<u8> = (0u8..20).collect();
        let upper = encrypted(&network, &payload, 0x40, MicSize::Small);
        let segments = segment_access(upper.aid, false, 0x40, &upper.transport_pdu).unwrap();
        assert_eq!(segments.len(), 2);
        let first = encode(&network, &segments[0], 0x40);
        let second = encode(&network, &segments[1], 0x41);

        let mut decoder = Decoder::new(network, TransportConfig::default());
        assert!(decoder.decode(&first).unwrap().messages.is_empty());
        assert_eq!(decoder.incomplete_sources(), vec![SOURCE]);

        let decoded = decoder.decode(&second).unwrap();
        match &decoded.messages[..] {
            [DecodedMessage::Access { payload: hex_payload, .. }] => {
                assert_eq!(*hex_payload, hex::encode(&payload))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(decoder.incomplete_sources().is_empty());
    }

    #[tokio::test]
    async fn test_decode_heartbeat() {
        let network = network();
        let lower = LowerTransportPdu::UnsegmentedControl(UnsegmentedControl {
            opcode: ControlOpcode::Heartbeat as u8,
            parameters: HeartbeatPayload {
                init_ttl: 7,
                features: Features::RELAY,
            }
            .encode(),
        });
        let raw = encode(&network, &lower, 9);

        let mut decoder = Decoder::new(network, TransportConfig::default());
        let decoded = decoder.decode(&raw).unwrap();
        assert!(decoded.control);
        match &decoded.messages[..] {
            [DecodedMessage::Heartbeat(heartbeat)] => assert_eq!(heartbeat.hops(), 4),
            other => panic!("unexpected {:?}", other),
        }
        let json = serde_json::to_value(&decoded).unwrap();
        assert_eq!(json["messages"][0]["kind"], "heartbeat");
    }

    #[tokio::test]
    async fn test_decode_beacon() {
        let network = network();
        let raw = SecureNetworkBeacon::encode(&network.network_keys[0], &network.iv_index);
        let decoder = Decoder::new(network, TransportConfig::default());
        assert!(matches!(decoder.decode_beacon(&raw).unwrap(), Beacon::SecureNetwork(_)));
        assert!(decoder.decode_beacon(&[0x01, 0x02]).is_err());
    }

    #[tokio::test]
    async fn test_foreign_pdu_rejected() {
        let mut decoder = Decoder::new(network(), TransportConfig::default());
        assert!(decoder.decode(&[0x68; 20]).is_err());
    }
}
