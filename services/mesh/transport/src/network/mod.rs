//! Network layer: Network PDU and beacon codecs plus duplicate filtering.

pub mod beacon;
pub mod pdu;

use crate::config::TransportConfig;
use crate::keys::MeshNetwork;
use beacon::Beacon;
use mesh_storage::MemoryMessageCache;
use pdu::NetworkPdu;
use tracing::debug;

/// Inbound side of the network layer
pub struct NetworkLayer {
    cache: MemoryMessageCache,
}

impl NetworkLayer {
    /// Create a network layer
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            cache: MemoryMessageCache::new(config.network_cache_size),
        }
    }

    /// Decode a received Network PDU
    ///
    /// Returns `None` for foreign, duplicate or locally originated PDUs.
    pub fn receive(&mut self, raw: &[u8], network: &MeshNetwork) -> Option<NetworkPdu> {
        if self.cache.contains(raw) {
            debug!("duplicate network pdu dropped len={}", raw.len());
            return None;
        }
        let pdu = NetworkPdu::decode(raw, network)?;
        self.cache.insert(raw);

        if network.is_local_unicast(pdu.source) {
            debug!("own network pdu dropped src={}", pdu.source);
            return None;
        }
        debug!(
            "network pdu src={} dst={} seq={} ttl={} type={:?}",
            pdu.source, pdu.destination, pdu.sequence, pdu.ttl, pdu.pdu_type
        );
        Some(pdu)
    }

    /// Decode a received beacon
    pub fn receive_beacon(&self, raw: &[u8], network: &MeshNetwork) -> Option<Beacon> {
        Beacon::decode(raw, network)
    }

    /// Remember an outgoing PDU so its echo is dropped
    pub fn sent(&mut self, raw: &[u8]) {
        self.cache.insert(raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{IvIndex, NetworkKey, Node};
    use mesh_wire::{Address, PduType};

    fn network(local: u16) -> MeshNetwork {
        let mut network = MeshNetwork::new(Address(local), IvIndex::new(3, false));
        network.network_keys.push(NetworkKey::new(0, [0x21; 16]).unwrap());
        network.nodes.push(Node::new(Address(local), 1, None));
        network
    }

    fn encode(network: &MeshNetwork, source: u16) -> NetworkPdu {
        NetworkPdu::encode(
            &[0x00, 1, 2, 3, 4, 5],
            PduType::Access,
            4,
            100,
            Address(source),
            Address(0x0001),
            &network.network_keys[0],
            3,
        )
        .unwrap()
    }

    #[test]
    fn test_duplicate_pdu_dropped() {
        let network = network(0x0001);
        let mut layer = NetworkLayer::new(&TransportConfig::default());
        let pdu = encode(&network, 0x0002);
        assert!(layer.receive(&pdu.raw, &network).is_some());
        assert!(layer.receive(&pdu.raw, &network).is_none());
    }

    #[test]
    fn test_own_pdu_dropped() {
        let network = network(0x0001);
        let mut layer = NetworkLayer::new(&TransportConfig::default());
        let pdu = encode(&network, 0x0001);
        assert!(layer.receive(&pdu.raw, &network).is_none());
    }

    #[test]
    fn test_foreign_pdu_not_cached() {
        let ours = network(0x0001);
        let mut foreign = network(0x0001);
        foreign.network_keys[0] = NetworkKey::new(0, [0x99; 16]).unwrap();
        let mut layer = NetworkLayer::new(&TransportConfig::default());
        let pdu = encode(&foreign, 0x0002);
        assert!(layer.receive(&pdu.raw, &ours).is_none());
        assert!(layer.receive(&pdu.raw, &foreign).is_some());
    }
}
