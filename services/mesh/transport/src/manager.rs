//! Network manager: the single owner of the layers.
//!
//! All protocol state lives on one task. Application calls, received PDUs
//! and fired timers reach it as messages, so the layers never need locks of
//! their own. Layers answer with [`TransportEvent`]s, which the driver
//! resolves depth-first: the events an event produces are handled before the
//! ones queued after it.

use crate::bearer::{AccessHandler, Bearer};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::keys::{KeySet, MeshAddress, MeshNetwork, Security};
use crate::lower::segmentation::{accepts_seq_auth, seq_auth_sequence};
use crate::lower::LowerTransportLayer;
use crate::message::{
    AccessRequest, ControlRequest, MessageHandle, OutboundPdu, TransportEvent, UpperTransportPdu,
    MAX_UPPER_TRANSPORT_PDU_SIZE,
};
use crate::network::beacon::{PrivateBeacon, SecureNetworkBeacon};
use crate::network::pdu::NetworkPdu;
use crate::network::NetworkLayer;
use crate::scheduler::{Scheduler, TimerEvent};
use crate::upper::heartbeat::{HeartbeatPublication, HeartbeatSubscription};
use crate::upper::UpperTransportLayer;
use bytes::Bytes;
use mesh_crypto::MicSize;
use mesh_storage::{seq_auth, SequenceAuthority};
use mesh_wire::{Address, LowerTransportPdu};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

/// Which beacon to originate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconKind {
    /// Secure Network beacon
    SecureNetwork,
    /// Private beacon with a fresh random
    Private,
}

enum Command {
    Receive(Bytes),
    ReceiveBeacon(Bytes),
    Send {
        request: AccessRequest,
        reply: oneshot::Sender<Result<MessageHandle, TransportError>>,
    },
    SendControl {
        request: ControlRequest,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    SendBeacon {
        network_key_index: u16,
        kind: BeaconKind,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Cancel(MessageHandle),
    IsReceivingMessage {
        source: Address,
        reply: oneshot::Sender<bool>,
    },
    SetHeartbeatPublication {
        publication: Option<HeartbeatPublication>,
        reply: oneshot::Sender<()>,
    },
    HeartbeatPublication {
        reply: oneshot::Sender<Option<HeartbeatPublication>>,
    },
    SetHeartbeatSubscription {
        subscription: Option<HeartbeatSubscription>,
        reply: oneshot::Sender<()>,
    },
    HeartbeatSubscription {
        reply: oneshot::Sender<Option<HeartbeatSubscription>>,
    },
}

/// Handle to a running network manager
///
/// Cheap to clone. The manager task stops once every handle is dropped.
#[derive(Debug, Clone)]
pub struct NetworkManager {
    tx: mpsc::UnboundedSender<Command>,
    network: Arc<RwLock<MeshNetwork>>,
}

impl NetworkManager {
    /// Spawn the manager task on the current runtime
    pub fn start(
        network: MeshNetwork,
        config: TransportConfig,
        bearer: Arc<dyn Bearer>,
        handler: Arc<dyn AccessHandler>,
        sequences: Arc<dyn SequenceAuthority>,
    ) -> Self {
        let (tx, commands) = mpsc::unbounded_channel();
        let (timer_tx, timers) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(timer_tx);
        let network = Arc::new(RwLock::new(network));

        let driver = ManagerDriver {
            network: network.clone(),
            network_layer: NetworkLayer::new(&config),
            lower: LowerTransportLayer::new(config.clone(), scheduler.clone()),
            upper: UpperTransportLayer::new(config.clone(), scheduler),
            config,
            bearer,
            handler,
            sequences,
            commands,
            timers,
        };
        tokio::spawn(driver.run());

        Self { tx, network }
    }

    /// Shared network state; write to it for Key Refresh and IV Update
    pub fn network(&self) -> Arc<RwLock<MeshNetwork>> {
        self.network.clone()
    }

    fn command(&self, command: Command) -> Result<(), TransportError> {
        self.tx.send(command).map_err(|_| TransportError::ManagerStopped)
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.command(build(reply))?;
        rx.await.map_err(|_| TransportError::ManagerStopped)
    }

    /// Feed a received Network PDU
    pub fn receive(&self, pdu: Bytes) -> Result<(), TransportError> {
        self.command(Command::Receive(pdu))
    }

    /// Feed a received beacon
    pub fn receive_beacon(&self, beacon: Bytes) -> Result<(), TransportError> {
        self.command(Command::ReceiveBeacon(beacon))
    }

    /// Send an access message
    ///
    /// Returns once the message is accepted. Delivery is reported through
    /// [`AccessHandler::message_sent`] or [`AccessHandler::message_failed`].
    pub async fn send(
        &self,
        access_pdu: Bytes,
        source: Address,
        destination: MeshAddress,
        ttl: Option<u8>,
        key_set: KeySet,
    ) -> Result<MessageHandle, TransportError> {
        let request = AccessRequest::new(access_pdu, source, destination, ttl, key_set)?;
        self.send_request(request).await
    }

    /// Send a prepared access request
    pub async fn send_request(&self, request: AccessRequest) -> Result<MessageHandle, TransportError> {
        self.call(|reply| Command::Send { request, reply }).await?
    }

    /// Send a transport control message
    pub async fn send_control(&self, request: ControlRequest) -> Result<(), TransportError> {
        self.call(|reply| Command::SendControl { request, reply }).await?
    }

    /// Originate a beacon for one network key
    pub async fn send_beacon(&self, network_key_index: u16, kind: BeaconKind) -> Result<(), TransportError> {
        self.call(|reply| Command::SendBeacon {
            network_key_index,
            kind,
            reply,
        })
        .await?
    }

    /// Cancel an outgoing access message
    pub fn cancel(&self, handle: MessageHandle) -> Result<(), TransportError> {
        self.command(Command::Cancel(handle))
    }

    /// Whether a segmented message from `source` is partially received
    pub async fn is_receiving_message(&self, source: Address) -> Result<bool, TransportError> {
        self.call(|reply| Command::IsReceivingMessage { source, reply }).await
    }

    /// Replace the Heartbeat publication
    pub async fn set_heartbeat_publication(
        &self,
        publication: Option<HeartbeatPublication>,
    ) -> Result<(), TransportError> {
        self.call(|reply| Command::SetHeartbeatPublication { publication, reply })
            .await
    }

    /// Current Heartbeat publication
    pub async fn heartbeat_publication(&self) -> Result<Option<HeartbeatPublication>, TransportError> {
        self.call(|reply| Command::HeartbeatPublication { reply }).await
    }

    /// Replace the Heartbeat subscription
    pub async fn set_heartbeat_subscription(
        &self,
        subscription: Option<HeartbeatSubscription>,
    ) -> Result<(), TransportError> {
        self.call(|reply| Command::SetHeartbeatSubscription { subscription, reply })
            .await
    }

    /// Current Heartbeat subscription
    pub async fn heartbeat_subscription(&self) -> Result<Option<HeartbeatSubscription>, TransportError> {
        self.call(|reply| Command::HeartbeatSubscription { reply }).await
    }
}

struct ManagerDriver {
    network: Arc<RwLock<MeshNetwork>>,
    config: TransportConfig,
    network_layer: NetworkLayer,
    lower: LowerTransportLayer,
    upper: UpperTransportLayer,
    bearer: Arc<dyn Bearer>,
    handler: Arc<dyn AccessHandler>,
    sequences: Arc<dyn SequenceAuthority>,
    commands: mpsc::UnboundedReceiver<Command>,
    timers: mpsc::UnboundedReceiver<TimerEvent>,
}

impl ManagerDriver {
    async fn run(mut self) {
        let local = self.network.read().await.local_address;
        info!("network manager started for {}", local);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.command(command).await,
                    None => break,
                },
                Some(event) = self.timers.recv() => {
                    let events = self.timer(event).await;
                    self.process(events).await;
                }
            }
        }
        info!("network manager for {} stopped", local);
    }

    async fn command(&mut self, command: Command) {
        let events = match command {
            Command::Receive(pdu) => self.receive(pdu).await,
            Command::ReceiveBeacon(beacon) => {
                let network = self.network.read().await;
                match self.network_layer.receive_beacon(&beacon, &network) {
                    Some(beacon) => self.handler.beacon_received(&beacon),
                    None => debug!("unrecognized beacon len={}", beacon.len()),
                }
                Vec::new()
            }
            Command::Send { request, reply } => match self.accept(&request).await {
                Ok(()) => {
                    let _ = reply.send(Ok(request.handle()));
                    self.upper.send(request)
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    Vec::new()
                }
            },
            Command::SendControl { request, reply } => match self.send_control(&request).await {
                Ok(events) => {
                    let _ = reply.send(Ok(()));
                    events
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    Vec::new()
                }
            },
            Command::SendBeacon {
                network_key_index,
                kind,
                reply,
            } => {
                let _ = reply.send(self.send_beacon(network_key_index, kind).await);
                Vec::new()
            }
            Command::Cancel(handle) => {
                debug!("cancelling {:?}", handle);
                let mut events = self.upper.cancel(&handle);
                events.extend(self.lower.cancel(&handle));
                events
            }
            Command::IsReceivingMessage { source, reply } => {
                let _ = reply.send(self.lower.is_receiving_message(source));
                Vec::new()
            }
            Command::SetHeartbeatPublication { publication, reply } => {
                self.upper.set_heartbeat_publication(publication);
                let _ = reply.send(());
                Vec::new()
            }
            Command::HeartbeatPublication { reply } => {
                let _ = reply.send(self.upper.heartbeat_publication().cloned());
                Vec::new()
            }
            Command::SetHeartbeatSubscription { subscription, reply } => {
                self.upper.set_heartbeat_subscription(subscription);
                let _ = reply.send(());
                Vec::new()
            }
            Command::HeartbeatSubscription { reply } => {
                let _ = reply.send(self.upper.heartbeat_subscription().cloned());
                Vec::new()
            }
        };
        self.process(events).await;
    }

    async fn timer(&mut self, event: TimerEvent) -> Vec<TransportEvent> {
        match event {
            TimerEvent::HeartbeatPublication => {
                let local = self.network.read().await.local_address;
                self.upper.publish_heartbeat(local)
            }
            event => self.lower.timer(event),
        }
    }

    async fn process(&mut self, events: Vec<TransportEvent>) {
        let mut pending: VecDeque<TransportEvent> = events.into();
        while let Some(event) = pending.pop_front() {
            let follow_up = self.event(event).await;
            for event in follow_up.into_iter().rev() {
                pending.push_front(event);
            }
        }
    }

    async fn event(&mut self, event: TransportEvent) -> Vec<TransportEvent> {
        match event {
            TransportEvent::Transmit(pdu) => {
                let (source, destination) = (pdu.source, pdu.destination);
                if let Err(e) = self.transmit(pdu).await {
                    warn!("failed to transmit {} -> {}: {}", source, destination, e);
                }
                Vec::new()
            }
            TransportEvent::AccessReceived(message) => {
                let network = self.network.read().await;
                match self.upper.decrypt(&message, &network) {
                    Some((pdu, key_set)) => {
                        debug!(
                            "access message from {} to {} len={}",
                            pdu.source,
                            pdu.destination.address,
                            pdu.access_pdu.len()
                        );
                        self.handler.handle(&pdu, &key_set);
                    }
                    None => debug!("no key decrypts access message from {}", message.source),
                }
                Vec::new()
            }
            TransportEvent::ControlReceived(message) => self.upper.control_received(&message),
            TransportEvent::SegmentedSendCompleted {
                destination,
                handle,
                result,
            } => self.upper.segmented_send_completed(destination, handle, result),
            TransportEvent::Dispatch(request) => self.dispatch(request).await,
            TransportEvent::SendControl(request) => match self.send_control(&request).await {
                Ok(events) => events,
                Err(e) => {
                    warn!("failed to send control message to {}: {}", request.destination, e);
                    Vec::new()
                }
            },
            TransportEvent::MessageSent(handle) => {
                self.handler.message_sent(&handle);
                Vec::new()
            }
            TransportEvent::MessageFailed(handle, error) => {
                self.handler.message_failed(&handle, &error);
                Vec::new()
            }
            TransportEvent::HeartbeatReceived(heartbeat) => {
                self.handler.heartbeat_received(&heartbeat);
                Vec::new()
            }
        }
    }

    async fn receive(&mut self, raw: Bytes) -> Vec<TransportEvent> {
        let network = self.network.read().await;
        let Some(pdu) = self.network_layer.receive(&raw, &network) else {
            return Vec::new();
        };
        if !network.is_local_destination(pdu.destination) {
            debug!("network pdu for {} not for us", pdu.destination);
            return Vec::new();
        }
        drop(network);

        let lower_pdu = match LowerTransportPdu::decode(pdu.pdu_type, &pdu.transport_pdu) {
            Ok(lower_pdu) => lower_pdu,
            Err(e) => {
                warn!("malformed lower transport pdu from {}: {}", pdu.source, e);
                return Vec::new();
            }
        };
        let segmented = lower_pdu.segment_header().is_some();
        let sequence = match lower_pdu.segment_header() {
            Some(header) => match seq_auth_sequence(pdu.sequence, header.seq_zero) {
                Some(sequence) => sequence,
                None => {
                    warn!("segment from {} with impossible SeqZero dropped", pdu.source);
                    return Vec::new();
                }
            },
            None => pdu.sequence,
        };

        let auth = seq_auth(pdu.iv_index, sequence);
        match self.sequences.last_seq_auth(pdu.source).await {
            Ok(last) if !accepts_seq_auth(last, auth, segmented) => {
                debug!("replayed pdu from {} seq={} dropped", pdu.source, pdu.sequence);
                return Vec::new();
            }
            Ok(_) => {}
            Err(e) => {
                warn!("replay state unavailable for {}: {}", pdu.source, e);
                return Vec::new();
            }
        }
        if let Err(e) = self.sequences.set_last_seq_auth(pdu.source, auth).await {
            warn!("failed to record SeqAuth for {}: {}", pdu.source, e);
        }

        self.lower.receive(&pdu, lower_pdu, sequence)
    }

    async fn accept(&self, request: &AccessRequest) -> Result<(), TransportError> {
        let network = self.network.read().await;
        if !network.is_local_unicast(request.source) {
            return Err(TransportError::InvalidAddress(request.source));
        }
        if request.destination.address.is_unassigned() {
            return Err(TransportError::InvalidAddress(request.destination.address));
        }
        if request.access_pdu.len() + MicSize::Small.size() > MAX_UPPER_TRANSPORT_PDU_SIZE {
            return Err(TransportError::PayloadTooLong(request.access_pdu.len()));
        }
        let index = request.key_set.network_key_index();
        network
            .network_key(index)
            .map(|_| ())
            .ok_or(TransportError::UnknownNetworkKey(index))
    }

    async fn dispatch(&mut self, request: AccessRequest) -> Vec<TransportEvent> {
        let handle = request.handle();
        let segmented = request.is_segmented();
        match self.secure(&request, segmented).await {
            Ok(mut events) => {
                if !segmented {
                    events.push(TransportEvent::MessageSent(handle));
                }
                events
            }
            Err(e) => {
                warn!("failed to send access message to {}: {}", handle.destination, e);
                if segmented {
                    self.upper
                        .segmented_send_completed(handle.destination, Some(handle), Err(e))
                } else {
                    vec![TransportEvent::MessageFailed(handle, e)]
                }
            }
        }
    }

    /// Encrypt with a fresh sequence number and hand to the lower transport layer
    async fn secure(
        &mut self,
        request: &AccessRequest,
        segmented: bool,
    ) -> Result<Vec<TransportEvent>, TransportError> {
        let sequence = self.sequences.next_sequence_number(request.source).await?;
        let network = self.network.read().await;
        let index = request.key_set.network_key_index();
        let network_key = network
            .network_key(index)
            .ok_or(TransportError::UnknownNetworkKey(index))?;
        let mic = if segmented && network_key.min_security == Security::High {
            MicSize::Large
        } else {
            MicSize::Small
        };
        let pdu = UpperTransportPdu::encrypt(
            request.access_pdu.clone(),
            request.source,
            request.destination,
            &request.key_set,
            sequence,
            network.iv_index.transmit_index(),
            mic,
        )?;
        drop(network);
        self.lower
            .send_access(&pdu, segmented, request.ttl, index, request.handle())
    }

    async fn send_control(&mut self, request: &ControlRequest) -> Result<Vec<TransportEvent>, TransportError> {
        let sequence = self.sequences.next_sequence_number(request.source).await?;
        self.lower.send_control(request, sequence)
    }

    async fn transmit(&mut self, outbound: OutboundPdu) -> Result<(), TransportError> {
        let sequence = match outbound.sequence {
            Some(sequence) => sequence,
            None => self.sequences.next_sequence_number(outbound.source).await?,
        };
        let network = self.network.read().await;
        let network_key = network
            .network_key(outbound.network_key_index)
            .ok_or(TransportError::UnknownNetworkKey(outbound.network_key_index))?;
        let pdu = NetworkPdu::encode(
            &outbound.pdu.encode(),
            outbound.pdu.pdu_type(),
            outbound.ttl.unwrap_or(self.config.default_ttl),
            sequence,
            outbound.source,
            outbound.destination,
            network_key,
            network.iv_index.transmit_index(),
        )?;
        drop(network);

        self.network_layer.sent(&pdu.raw);
        self.bearer
            .transmit(pdu.raw)
            .await
            .map_err(|e| TransportError::Bearer(e.to_string()))
    }

    async fn send_beacon(&self, network_key_index: u16, kind: BeaconKind) -> Result<(), TransportError> {
        let network = self.network.read().await;
        let network_key = network
            .network_key(network_key_index)
            .ok_or(TransportError::UnknownNetworkKey(network_key_index))?;
        let beacon = match kind {
            BeaconKind::SecureNetwork => SecureNetworkBeacon::encode(network_key, &network.iv_index),
            BeaconKind::Private => PrivateBeacon::encode_random(network_key, &network.iv_index)?,
        };
        drop(network);
        self.bearer
            .transmit_beacon(beacon)
            .await
            .map_err(|e| TransportError::Bearer(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{ApplicationKey, IvIndex, NetworkKey, Node};
    use crate::network::beacon::Beacon;
    use crate::upper::heartbeat::Heartbeat;
    use async_trait::async_trait;
    use mesh_storage::MemorySequenceStore;
    use mesh_wire::Opcode;
    use std::time::Duration;

    const A: Address = Address(0x0001);
    const B: Address = Address(0x0002);

    #[derive(Debug)]
    struct Air {
        tx: mpsc::UnboundedSender<Bytes>,
    }

    #[async_trait]
    impl Bearer for Air {
        async fn transmit(&self, pdu: Bytes) -> anyhow::Result<()> {
            self.tx
                .send(pdu)
                .map_err(|_| anyhow::anyhow!("air closed"))
        }
    }

    #[derive(Debug)]
    enum Seen {
        Access(UpperTransportPdu, KeySet),
        Beacon(Beacon),
        Heartbeat(Heartbeat),
        Sent(MessageHandle),
        Failed(MessageHandle, TransportError),
    }

    #[derive(Debug)]
    struct Recorder {
        tx: mpsc::UnboundedSender<Seen>,
    }

    impl AccessHandler for Recorder {
        fn handle(&self, pdu: &UpperTransportPdu, key_set: &KeySet) {
            let _ = self.tx.send(Seen::Access(pdu.clone(), key_set.clone()));
        }

        fn beacon_received(&self, beacon: &Beacon) {
            let _ = self.tx.send(Seen::Beacon(beacon.clone()));
        }

        fn heartbeat_received(&self, heartbeat: &Heartbeat) {
            let _ = self.tx.send(Seen::Heartbeat(*heartbeat));
        }

        fn message_sent(&self, handle: &MessageHandle) {
            let _ = self.tx.send(Seen::Sent(*handle));
        }

        fn message_failed(&self, handle: &MessageHandle, error: &TransportError) {
            let _ = self.tx.send(Seen::Failed(*handle, error.clone()));
        }
    }

    struct TestNode {
        manager: NetworkManager,
        seen: mpsc::UnboundedReceiver<Seen>,
        air: Option<mpsc::UnboundedReceiver<Bytes>>,
        keys: KeySet,
    }

    fn mesh_network(local: Address, security: Security) -> MeshNetwork {
        let mut network = MeshNetwork::new(local, IvIndex::new(0x1234_5678, false));
        network
            .network_keys
            .push(NetworkKey::new(0, [0x7D; 16]).unwrap().with_security(security));
        network
            .application_keys
            .push(ApplicationKey::new(0, [0x63; 16], 0).unwrap());
        network.nodes.push(Node::new(A, 1, Some([0xA0; 16])));
        network.nodes.push(Node::new(B, 1, Some([0xB0; 16])));
        network
    }

    fn test_node(local: Address, security: Security) -> TestNode {
        let network = mesh_network(local, security);
        let keys = KeySet::application(&network.network_keys[0], &network.application_keys[0]);
        let (air_tx, air) = mpsc::unbounded_channel();
        let (seen_tx, seen) = mpsc::unbounded_channel();
        let manager = NetworkManager::start(
            network,
            TransportConfig::default(),
            Arc::new(Air { tx: air_tx }),
            Arc::new(Recorder { tx: seen_tx }),
            Arc::new(MemorySequenceStore::default()),
        );
        TestNode {
            manager,
            seen,
            air: Some(air),
            keys,
        }
    }

    fn connect(from: &mut TestNode, to: &TestNode) {
        let mut air = from.air.take().unwrap();
        let peer = to.manager.clone();
        tokio::spawn(async move {
            while let Some(pdu) = air.recv().await {
                if peer.receive(pdu).is_err() {
                    break;
                }
            }
        });
    }

    fn pair(security: Security) -> (TestNode, TestNode) {
        let mut a = test_node(A, security);
        let mut b = test_node(B, security);
        connect(&mut a, &b);
        connect(&mut b, &a);
        (a, b)
    }

    fn payload(len: usize) -> Bytes {
        let mut payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
        payload[0] = 0x04;
        Bytes::from(payload)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsegmented_message_delivered() {
        let (mut a, mut b) = pair(Security::Low);
        let handle = a
            .manager
            .send(payload(5), A, B.into(), None, a.keys.clone())
            .await
            .unwrap();
        assert_eq!(handle.opcode, Opcode(0x04));

        match b.seen.recv().await.unwrap() {
            Seen::Access(pdu, keys) => {
                assert_eq!(pdu.access_pdu, payload(5));
                assert_eq!(pdu.source, A);
                assert_eq!(pdu.mic, MicSize::Small);
                assert_eq!(keys, a.keys);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(a.seen.recv().await.unwrap(), Seen::Sent(h) if h == handle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_segmented_message_acknowledged() {
        let (mut a, mut b) = pair(Security::High);
        let handle = a
            .manager
            .send(payload(40), A, B.into(), None, a.keys.clone())
            .await
            .unwrap();

        match b.seen.recv().await.unwrap() {
            Seen::Access(pdu, _) => {
                assert_eq!(pdu.access_pdu, payload(40));
                assert_eq!(pdu.mic, MicSize::Large);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(a.seen.recv().await.unwrap(), Seen::Sent(h) if h == handle));
        assert!(!b.manager.is_receiving_message(A).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_key_message() {
        let (a, mut b) = pair(Security::Low);
        let keys = {
            let network = a.manager.network();
            let network = network.read().await;
            KeySet::device(&network.network_keys[0], network.node(B).unwrap()).unwrap()
        };
        a.manager
            .send(payload(3), A, B.into(), Some(3), keys.clone())
            .await
            .unwrap();
        match b.seen.recv().await.unwrap() {
            Seen::Access(pdu, used) => {
                assert_eq!(pdu.aid, None);
                assert_eq!(used, keys);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_message_times_out() {
        let mut a = test_node(A, Security::Low);
        let handle = a
            .manager
            .send(payload(30), A, B.into(), None, a.keys.clone())
            .await
            .unwrap();
        assert!(matches!(
            a.seen.recv().await.unwrap(),
            Seen::Failed(h, TransportError::Timeout) if h == handle
        ));
        // one pass plus four retransmissions of three segments
        let mut air = a.air.take().unwrap();
        let mut sent = 0;
        while air.try_recv().is_ok() {
            sent += 1;
        }
        assert_eq!(sent, 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_promotes_next_message() {
        let mut a = test_node(A, Security::Low);
        let first = a
            .manager
            .send(payload(30), A, B.into(), None, a.keys.clone())
            .await
            .unwrap();
        let mut second_pdu = payload(30).to_vec();
        second_pdu[0] = 0x05;
        let second = a
            .manager
            .send(Bytes::from(second_pdu), A, B.into(), None, a.keys.clone())
            .await
            .unwrap();

        a.manager.cancel(first).unwrap();
        assert!(matches!(
            a.seen.recv().await.unwrap(),
            Seen::Failed(h, TransportError::Cancelled) if h == first
        ));
        assert!(matches!(
            a.seen.recv().await.unwrap(),
            Seen::Failed(h, TransportError::Timeout) if h == second
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_pdu_delivered_once() {
        let mut a = test_node(A, Security::Low);
        let mut b = test_node(B, Security::Low);
        a.manager
            .send(payload(5), A, B.into(), None, a.keys.clone())
            .await
            .unwrap();
        let raw = a.air.as_mut().unwrap().recv().await.unwrap();

        b.manager.receive(raw.clone()).unwrap();
        b.manager.receive(raw).unwrap();
        assert!(matches!(b.seen.recv().await.unwrap(), Seen::Access(..)));
        // synchronize with the manager before checking nothing else arrived
        b.manager.is_receiving_message(A).await.unwrap();
        assert!(b.seen.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_requests_rejected() {
        let a = test_node(A, Security::Low);
        let result = a
            .manager
            .send(payload(5), B, A.into(), None, a.keys.clone())
            .await;
        assert_eq!(result, Err(TransportError::InvalidAddress(B)));

        let result = a
            .manager
            .send(payload(400), A, B.into(), None, a.keys.clone())
            .await;
        assert_eq!(result, Err(TransportError::PayloadTooLong(400)));

        let foreign = KeySet::Application {
            network_key: 9,
            application_key: 0,
            key: [0; 16],
            aid: 0,
        };
        let result = a.manager.send(payload(5), A, B.into(), None, foreign).await;
        assert_eq!(result, Err(TransportError::UnknownNetworkKey(9)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_publication_reaches_subscriber() {
        let (a, mut b) = pair(Security::Low);
        b.manager
            .set_heartbeat_subscription(Some(HeartbeatSubscription::new(A, B, 0x05).unwrap()))
            .await
            .unwrap();
        a.manager
            .set_heartbeat_publication(Some(HeartbeatPublication::new(B, 0x02, 0x01, 4, 0).unwrap()))
            .await
            .unwrap();

        for _ in 0..2 {
            match b.seen.recv().await.unwrap() {
                Seen::Heartbeat(heartbeat) => {
                    assert_eq!(heartbeat.source, A);
                    assert_eq!(heartbeat.hops(), 1);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        let subscription = b.manager.heartbeat_subscription().await.unwrap().unwrap();
        assert_eq!(subscription.count, 2);
        assert_eq!(
            a.manager.heartbeat_publication().await.unwrap().unwrap().remaining(),
            Some(0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_beacons() {
        let mut a = test_node(A, Security::Low);
        let mut b = test_node(B, Security::Low);
        a.manager.send_beacon(0, BeaconKind::SecureNetwork).await.unwrap();
        a.manager.send_beacon(0, BeaconKind::Private).await.unwrap();
        assert!(a.manager.send_beacon(3, BeaconKind::Private).await.is_err());

        let air = a.air.as_mut().unwrap();
        for _ in 0..2 {
            b.manager.receive_beacon(air.recv().await.unwrap()).unwrap();
        }
        assert!(matches!(
            b.seen.recv().await.unwrap(),
            Seen::Beacon(Beacon::SecureNetwork(beacon)) if beacon.iv_index.index == 0x1234_5678
        ));
        assert!(matches!(
            b.seen.recv().await.unwrap(),
            Seen::Beacon(Beacon::Private(beacon)) if beacon.network_key_index == 0
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manager_stops_with_last_handle() {
        let a = test_node(A, Security::Low);
        let network = a.manager.network();
        drop(a.manager);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(Arc::strong_count(&network), 1);
    }
}
