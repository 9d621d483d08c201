//! Upper transport layer.
//!
//! Outbound, segmented access messages are queued per destination and only
//! the front one is handed down for encryption and segmentation. Inbound,
//! access messages are decrypted by trying every key that could have secured
//! them. Transport control messages other than Segment Acknowledgments end up
//! here too, which is where Heartbeats are counted.

pub mod heartbeat;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::keys::{KeySet, MeshNetwork};
use crate::message::{
    AccessMessage, AccessRequest, ControlMessage, ControlRequest, MessageHandle, TransportEvent,
    UpperTransportPdu,
};
use crate::queue::DestinationQueues;
use crate::scheduler::{Scheduler, TimerEvent, TimerToken};
use heartbeat::{Heartbeat, HeartbeatPublication, HeartbeatSubscription};
use mesh_wire::{Address, ControlOpcode, HeartbeatPayload};
use tokio::time::Instant;
use tracing::{debug, info, warn};

fn outcome(handle: MessageHandle, result: Result<(), TransportError>) -> TransportEvent {
    match result {
        Ok(()) => TransportEvent::MessageSent(handle),
        Err(e) => TransportEvent::MessageFailed(handle, e),
    }
}

/// Upper transport layer state
#[derive(Debug)]
pub struct UpperTransportLayer {
    config: TransportConfig,
    scheduler: Scheduler,
    queues: DestinationQueues<AccessRequest>,
    publication: Option<HeartbeatPublication>,
    publication_timer: Option<TimerToken>,
    subscription: Option<HeartbeatSubscription>,
}

impl UpperTransportLayer {
    /// Create the layer
    pub fn new(config: TransportConfig, scheduler: Scheduler) -> Self {
        Self {
            config,
            scheduler,
            queues: DestinationQueues::new(),
            publication: None,
            publication_timer: None,
            subscription: None,
        }
    }

    /// Accept an access message for sending
    ///
    /// Unsegmented messages are dispatched at once. A segmented message is
    /// dispatched when every earlier segmented message to the same
    /// destination has finished.
    pub fn send(&mut self, request: AccessRequest) -> Vec<TransportEvent> {
        if !request.is_segmented() {
            return vec![TransportEvent::Dispatch(request)];
        }
        let destination = request.destination.address;
        if self.queues.enqueue(destination, request.clone()) {
            vec![TransportEvent::Dispatch(request)]
        } else {
            debug!(
                "access message to {} waiting behind {} others",
                destination,
                self.queues.len(destination) - 1
            );
            Vec::new()
        }
    }

    /// Number of segmented messages queued for `destination`, in flight included
    pub fn pending_messages(&self, destination: Address) -> usize {
        self.queues.len(destination)
    }

    /// The lower transport layer finished with a segmented message
    pub fn segmented_send_completed(
        &mut self,
        destination: Address,
        handle: Option<MessageHandle>,
        result: Result<(), TransportError>,
    ) -> Vec<TransportEvent> {
        let Some(handle) = handle else {
            if let Err(e) = result {
                warn!("segmented control message to {} failed: {}", destination, e);
            }
            return Vec::new();
        };
        let mut events = vec![outcome(handle, result)];
        let in_flight = self
            .queues
            .front(destination)
            .is_some_and(|r| r.handle() == handle);
        if in_flight {
            self.queues.dequeue(destination);
            if let Some(next) = self.queues.front(destination) {
                events.push(TransportEvent::Dispatch(next.clone()));
            }
        }
        events
    }

    /// Remove queued messages matching `handle`
    ///
    /// The message in flight is left alone; cancelling it in the lower
    /// transport layer reports back through
    /// [`segmented_send_completed`](Self::segmented_send_completed).
    pub fn cancel(&mut self, handle: &MessageHandle) -> Vec<TransportEvent> {
        self.queues
            .remove_waiting(handle.destination, |r| r.handle() == *handle)
            .into_iter()
            .map(|r| TransportEvent::MessageFailed(r.handle(), TransportError::Cancelled))
            .collect()
    }

    /// Decrypt `message` with the first key that authenticates it
    ///
    /// Application keys bound to the receiving subnet are tried when the
    /// message carries an AID: the current key, then the old one during Key
    /// Refresh, once per matching virtual label for virtual destinations.
    /// Otherwise the device key of the source node is tried, then that of
    /// the destination node.
    pub fn decrypt(
        &self,
        message: &AccessMessage,
        network: &MeshNetwork,
    ) -> Option<(UpperTransportPdu, KeySet)> {
        let network_key = network.network_key(message.network_key_index)?;

        let Some(aid) = message.aid else {
            return [message.source, message.destination]
                .into_iter()
                .filter_map(|address| network.node(address))
                .find_map(|node| {
                    let key = node.device_key?;
                    let pdu = UpperTransportPdu::decrypt(message, &key, None)?;
                    Some((
                        pdu,
                        KeySet::Device {
                            network_key: network_key.index(),
                            node: node.primary_address,
                            key,
                        },
                    ))
                });
        };

        let labels: Vec<_> = if message.destination.is_virtual() {
            network
                .groups_with_address(message.destination)
                .filter_map(|g| g.address.virtual_label)
                .map(Some)
                .collect()
        } else {
            vec![None]
        };

        network
            .application_keys
            .iter()
            .filter(|k| k.bound_network_key() == network_key.index())
            .flat_map(|k| {
                let current = Some((k.key(), k.aid()));
                let old = k.old_key().zip(k.old_aid());
                [current, old]
                    .into_iter()
                    .flatten()
                    .filter(|(_, key_aid)| *key_aid == aid)
                    .map(move |(key, key_aid)| (k.index(), key, key_aid))
            })
            .find_map(|(application_key, key, key_aid)| {
                labels.iter().find_map(|label| {
                    let pdu = UpperTransportPdu::decrypt(message, key, *label)?;
                    Some((
                        pdu,
                        KeySet::Application {
                            network_key: network_key.index(),
                            application_key,
                            key: *key,
                            aid: key_aid,
                        },
                    ))
                })
            })
    }

    /// Handle a transport control message
    pub fn control_received(&mut self, message: &ControlMessage) -> Vec<TransportEvent> {
        match ControlOpcode::try_from(message.opcode) {
            Ok(ControlOpcode::Heartbeat) => self.heartbeat_received(message),
            Ok(opcode) => {
                debug!("unsupported control message {:?} from {}", opcode, message.source);
                Vec::new()
            }
            Err(e) => {
                warn!("control message from {} dropped: {}", message.source, e);
                Vec::new()
            }
        }
    }

    fn heartbeat_received(&mut self, message: &ControlMessage) -> Vec<TransportEvent> {
        let heartbeat = match Heartbeat::from_control(message) {
            Ok(heartbeat) => heartbeat,
            Err(e) => {
                warn!("malformed heartbeat from {}: {}", message.source, e);
                return Vec::new();
            }
        };
        if let Some(subscription) = self.subscription.as_mut() {
            if subscription.record(&heartbeat, Instant::now()) {
                debug!(
                    "heartbeat from {} hops={} count={}",
                    heartbeat.source,
                    heartbeat.hops(),
                    subscription.count
                );
                return vec![TransportEvent::HeartbeatReceived(heartbeat)];
            }
        }
        debug!("heartbeat from {} not subscribed", heartbeat.source);
        Vec::new()
    }

    /// Replace the Heartbeat publication and restart its timer
    pub fn set_heartbeat_publication(&mut self, publication: Option<HeartbeatPublication>) {
        self.publication_timer = None;
        if let Some(publication) = &publication {
            if let Some(period) = publication.period().filter(|_| publication.is_active()) {
                info!(
                    "publishing heartbeats to {} every {:?}",
                    publication.destination, period
                );
                self.publication_timer = Some(
                    self.scheduler
                        .schedule_repeating(period, TimerEvent::HeartbeatPublication),
                );
            }
        }
        self.publication = publication;
    }

    /// Current Heartbeat publication
    pub fn heartbeat_publication(&self) -> Option<&HeartbeatPublication> {
        self.publication.as_ref()
    }

    /// Replace the Heartbeat subscription
    pub fn set_heartbeat_subscription(&mut self, subscription: Option<HeartbeatSubscription>) {
        self.subscription = subscription;
    }

    /// Current Heartbeat subscription
    pub fn heartbeat_subscription(&self) -> Option<&HeartbeatSubscription> {
        self.subscription.as_ref()
    }

    /// The publication timer fired: send one Heartbeat from `source`
    pub fn publish_heartbeat(&mut self, source: Address) -> Vec<TransportEvent> {
        let Some(publication) = self.publication.as_mut().filter(|p| p.is_active()) else {
            self.publication_timer = None;
            return Vec::new();
        };
        let request = ControlRequest {
            opcode: ControlOpcode::Heartbeat as u8,
            parameters: HeartbeatPayload {
                init_ttl: publication.ttl,
                features: self.config.features,
            }
            .encode(),
            source,
            destination: publication.destination,
            ttl: Some(publication.ttl),
            network_key_index: publication.network_key_index,
        };
        if !publication.published() {
            debug!("heartbeat publication count exhausted");
            self.publication_timer = None;
        }
        vec![TransportEvent::SendControl(request)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{ApplicationKey, Group, IvIndex, MeshAddress, NetworkKey, Node};
    use bytes::Bytes;
    use mesh_crypto::MicSize;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    const LOCAL: Address = Address(0x0001);
    const PEER: Address = Address(0x0002);

    fn layer() -> (UpperTransportLayer, mpsc::UnboundedReceiver<TimerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            UpperTransportLayer::new(TransportConfig::default(), Scheduler::new(tx)),
            rx,
        )
    }

    fn network() -> MeshNetwork {
        let mut network = MeshNetwork::new(LOCAL, IvIndex::new(0, false));
        network.network_keys.push(NetworkKey::new(0, [0x10; 16]).unwrap());
        network.network_keys.push(NetworkKey::new(1, [0x11; 16]).unwrap());
        network
            .application_keys
            .push(ApplicationKey::new(0, [0x20; 16], 0).unwrap());
        network
            .application_keys
            .push(ApplicationKey::new(1, [0x21; 16], 1).unwrap());
        network.nodes.push(Node::new(LOCAL, 1, Some([0x30; 16])));
        network.nodes.push(Node::new(PEER, 2, Some([0x31; 16])));
        network
    }

    fn request(len: usize, opcode: u8, key_set: KeySet) -> AccessRequest {
        let mut payload = vec![0u8; len];
        payload[0] = opcode;
        AccessRequest::new(
            Bytes::from(payload),
            LOCAL,
            MeshAddress::new(PEER),
            None,
            key_set,
        )
        .unwrap()
    }

    fn app_keys(network: &MeshNetwork, index: u16) -> KeySet {
        let app_key = network.application_key(index).unwrap();
        let net_key = network.network_key(app_key.bound_network_key()).unwrap();
        KeySet::application(net_key, app_key)
    }

    fn received(pdu: &UpperTransportPdu, network_key_index: u16) -> AccessMessage {
        AccessMessage {
            source: pdu.source,
            destination: pdu.destination.address,
            aid: pdu.aid,
            mic: pdu.mic,
            sequence: pdu.sequence,
            iv_index: pdu.iv_index,
            network_key_index,
            ttl: 5,
            upper_transport_pdu: pdu.transport_pdu.clone(),
        }
    }

    fn encrypt(destination: MeshAddress, key_set: &KeySet, source: Address) -> UpperTransportPdu {
        UpperTransportPdu::encrypt(
            Bytes::from_static(&[0x04, 0x01, 0x02]),
            source,
            destination,
            key_set,
            0x100,
            0,
            MicSize::Small,
        )
        .unwrap()
    }

    #[test]
    fn test_unsegmented_dispatched_immediately() {
        let (mut layer, _rx) = layer();
        let net = network();
        let events = layer.send(request(4, 0x04, app_keys(&net, 0)));
        assert!(matches!(&events[..], [TransportEvent::Dispatch(_)]));
        assert_eq!(layer.pending_messages(PEER), 0);
    }

    #[test]
    fn test_segmented_queue_and_cancel() {
        let (mut layer, _rx) = layer();
        let net = network();
        let first = request(20, 0x01, app_keys(&net, 0));
        let second = request(20, 0x02, app_keys(&net, 0));
        let third = request(20, 0x03, app_keys(&net, 0));

        assert_eq!(layer.send(first.clone()).len(), 1);
        assert!(layer.send(second.clone()).is_empty());
        assert!(layer.send(third.clone()).is_empty());
        assert_eq!(layer.pending_messages(PEER), 3);

        let events = layer.cancel(&third.handle());
        assert!(matches!(
            &events[..],
            [TransportEvent::MessageFailed(h, TransportError::Cancelled)] if *h == third.handle()
        ));
        assert!(layer.cancel(&first.handle()).is_empty());

        let events =
            layer.segmented_send_completed(PEER, Some(first.handle()), Err(TransportError::Cancelled));
        match &events[..] {
            [TransportEvent::MessageFailed(h, TransportError::Cancelled), TransportEvent::Dispatch(next)] => {
                assert_eq!(*h, first.handle());
                assert_eq!(next, &second);
            }
            other => panic!("unexpected events {:?}", other),
        }

        let events = layer.segmented_send_completed(PEER, Some(second.handle()), Ok(()));
        assert!(matches!(&events[..], [TransportEvent::MessageSent(_)]));
        assert_eq!(layer.pending_messages(PEER), 0);
        assert!(layer
            .segmented_send_completed(PEER, None, Err(TransportError::Timeout))
            .is_empty());
    }

    #[test]
    fn test_decrypt_application_key() {
        let (layer, _rx) = layer();
        let net = network();
        let key_set = app_keys(&net, 1);
        let pdu = encrypt(MeshAddress::new(LOCAL), &key_set, PEER);

        let (decoded, used) = layer.decrypt(&received(&pdu, 1), &net).unwrap();
        assert_eq!(decoded.access_pdu, pdu.access_pdu);
        assert_eq!(used, key_set);
        // Only keys bound to the receiving subnet are tried
        assert!(layer.decrypt(&received(&pdu, 0), &net).is_none());
        assert!(layer.decrypt(&received(&pdu, 7), &net).is_none());
    }

    #[test]
    fn test_decrypt_old_application_key() {
        let (layer, _rx) = layer();
        let mut net = network();
        let old_keys = app_keys(&net, 0);
        let pdu = encrypt(MeshAddress::new(LOCAL), &old_keys, PEER);

        net.application_key_mut(0).unwrap().start_key_refresh([0x99; 16]);
        let (_, used) = layer.decrypt(&received(&pdu, 0), &net).unwrap();
        assert_eq!(used.access_key(), &[0x20; 16]);

        net.application_key_mut(0).unwrap().finish_key_refresh();
        assert!(layer.decrypt(&received(&pdu, 0), &net).is_none());
    }

    #[test]
    fn test_decrypt_virtual_destination() {
        let (layer, _rx) = layer();
        let mut net = network();
        let label = Uuid::from_bytes([0x5A; 16]);
        let destination = MeshAddress::from_label(label);
        let pdu = encrypt(destination, &app_keys(&net, 0), PEER);
        assert!(layer.decrypt(&received(&pdu, 0), &net).is_none());

        net.groups.push(Group::new("other", MeshAddress::new(Address(0xC000))));
        net.groups.push(Group::new("lights", destination));
        let (decoded, _) = layer.decrypt(&received(&pdu, 0), &net).unwrap();
        assert_eq!(decoded.destination.virtual_label, Some(label));
    }

    #[test]
    fn test_decrypt_device_keys() {
        let (layer, _rx) = layer();
        let net = network();
        let peer_node = net.node(PEER).unwrap().clone();
        let local_node = net.local_node().unwrap().clone();
        let from_peer = KeySet::device(net.network_key(0).unwrap(), &peer_node).unwrap();
        let pdu = encrypt(MeshAddress::new(LOCAL), &from_peer, Address(0x0003));
        let (_, used) = layer.decrypt(&received(&pdu, 0), &net).unwrap();
        assert_eq!(used.access_key(), &[0x31; 16]);

        let to_local = KeySet::device(net.network_key(0).unwrap(), &local_node).unwrap();
        let pdu = encrypt(MeshAddress::new(LOCAL), &to_local, PEER);
        let (_, used) = layer.decrypt(&received(&pdu, 0), &net).unwrap();
        assert_eq!(used, to_local);
    }

    fn heartbeat_message(source: Address, ttl: u8) -> ControlMessage {
        ControlMessage {
            source,
            destination: LOCAL,
            opcode: ControlOpcode::Heartbeat as u8,
            parameters: Bytes::from_static(&[0x05, 0x00, 0x00]),
            sequence: 1,
            iv_index: 0,
            network_key_index: 0,
            ttl,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_subscription() {
        let (mut layer, _rx) = layer();
        assert!(layer.control_received(&heartbeat_message(PEER, 3)).is_empty());

        layer.set_heartbeat_subscription(Some(HeartbeatSubscription::new(PEER, LOCAL, 3).unwrap()));
        let events = layer.control_received(&heartbeat_message(PEER, 3));
        assert!(matches!(&events[..], [TransportEvent::HeartbeatReceived(h)] if h.hops() == 3));
        assert!(layer
            .control_received(&heartbeat_message(Address(0x0009), 3))
            .is_empty());
        assert_eq!(layer.heartbeat_subscription().unwrap().count, 1);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(layer.control_received(&heartbeat_message(PEER, 3)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_publication_counts_down() {
        let (mut layer, mut rx) = layer();
        let publication = HeartbeatPublication::new(Address(0xC000), 2, 2, 7, 0).unwrap();
        layer.set_heartbeat_publication(Some(publication));

        for _ in 0..2 {
            assert_eq!(rx.recv().await, Some(TimerEvent::HeartbeatPublication));
            match &layer.publish_heartbeat(LOCAL)[..] {
                [TransportEvent::SendControl(request)] => {
                    assert_eq!(request.opcode, 0x0A);
                    assert_eq!(request.destination, Address(0xC000));
                    assert_eq!(request.ttl, Some(7));
                    assert_eq!(HeartbeatPayload::decode(&request.parameters).unwrap().init_ttl, 7);
                }
                other => panic!("unexpected events {:?}", other),
            }
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
        assert!(layer.publish_heartbeat(LOCAL).is_empty());
        assert_eq!(layer.heartbeat_publication().unwrap().remaining(), Some(0));
    }
}
