//! Lower transport layer.
//!
//! Inbound, segments are reassembled per source address and acknowledged
//! with Segment Acknowledgment control messages. Outbound, segmented
//! messages wait in a per-destination queue; the message at the front is
//! transmitted and, for unicast destinations, retransmitted until every
//! segment is acknowledged.
//!
//! The layer never sleeps and never sends. It returns [`TransportEvent`]s and
//! arms timers through the [`Scheduler`]; the manager feeds fired timers back
//! through [`LowerTransportLayer::timer`].

pub mod segmentation;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::message::{
    AccessMessage, ControlMessage, ControlRequest, MessageHandle, OutboundPdu, TransportEvent,
    UpperTransportPdu,
};
use crate::network::pdu::NetworkPdu;
use crate::queue::DestinationQueues;
use crate::scheduler::{Scheduler, TimerEvent, TimerToken};
use bytes::{Bytes, BytesMut};
use mesh_crypto::MicSize;
use mesh_wire::{
    Address, ControlOpcode, LowerTransportPdu, SegmentAck, SegmentHeader, UnsegmentedAccess,
    UnsegmentedControl, MAX_ACCESS_SEGMENT_SIZE, MAX_CONTROL_SEGMENT_SIZE,
    MAX_UNSEGMENTED_ACCESS_SIZE, MAX_UNSEGMENTED_CONTROL_SIZE,
};
use segmentation::{segment_access, segment_control, seq_zero};
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentKind {
    Access { aid: Option<u8>, szmic: bool },
    Control { opcode: u8 },
}

impl SegmentKind {
    fn segment_size(self) -> usize {
        match self {
            SegmentKind::Access { .. } => MAX_ACCESS_SEGMENT_SIZE,
            SegmentKind::Control { .. } => MAX_CONTROL_SEGMENT_SIZE,
        }
    }
}

/// A segmented message being received
#[derive(Debug)]
struct Reassembly {
    seq_zero: u16,
    sequence: u32,
    kind: SegmentKind,
    destination: Address,
    iv_index: u32,
    network_key_index: u16,
    ttl: u8,
    ttl_zero: bool,
    segments: Vec<Option<Bytes>>,
    block_ack: u32,
    ack_timer: Option<TimerToken>,
    incomplete_timer: TimerToken,
}

impl Reassembly {
    fn is_complete(&self) -> bool {
        self.segments.iter().all(Option::is_some)
    }

    fn payload(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(self.segments.len() * self.kind.segment_size());
        for segment in self.segments.iter().flatten() {
            payload.extend_from_slice(segment);
        }
        payload.freeze()
    }
}

/// The last segmented message received from a source
#[derive(Debug)]
struct Completed {
    seq_zero: u16,
    sequence: u32,
    destination: Address,
    network_key_index: u16,
    ttl_zero: bool,
    /// `None` when reassembly timed out
    block_ack: Option<u32>,
    ack_timer: Option<TimerToken>,
}

/// A segmented message being sent
#[derive(Debug)]
struct OutgoingMessage {
    id: u64,
    handle: Option<MessageHandle>,
    source: Address,
    destination: Address,
    ttl: Option<u8>,
    network_key_index: u16,
    seq_zero: u16,
    first_sequence: u32,
    segments: Vec<LowerTransportPdu>,
    acked: u32,
    sent: bool,
    retransmissions_left: u8,
    retransmit_timer: Option<TimerToken>,
}

impl OutgoingMessage {
    fn complete_block(&self) -> u32 {
        SegmentAck::complete_block(self.segments.len())
    }

    /// Transmit events for every unacknowledged segment
    ///
    /// Only the first segment of the first pass reuses the sequence number
    /// the message was secured with; everything else gets a fresh one.
    fn transmit_unacked(&mut self) -> Vec<TransportEvent> {
        let first_pass = !self.sent;
        self.sent = true;
        self.segments
            .iter()
            .enumerate()
            .filter(|(offset, _)| self.acked & (1 << offset) == 0)
            .map(|(offset, segment)| {
                TransportEvent::Transmit(OutboundPdu {
                    pdu: segment.clone(),
                    source: self.source,
                    destination: self.destination,
                    ttl: self.ttl,
                    network_key_index: self.network_key_index,
                    sequence: (first_pass && offset == 0).then_some(self.first_sequence),
                })
            })
            .collect()
    }
}

fn ack_event(
    source: Address,
    destination: Address,
    seq_zero: u16,
    block_ack: u32,
    network_key_index: u16,
    ttl_zero: bool,
) -> TransportEvent {
    let ack = SegmentAck {
        obo: false,
        seq_zero,
        block_ack,
    };
    TransportEvent::Transmit(OutboundPdu {
        pdu: LowerTransportPdu::UnsegmentedControl(UnsegmentedControl {
            opcode: ControlOpcode::SegmentAck as u8,
            parameters: ack.encode(),
        }),
        source,
        destination,
        ttl: if ttl_zero { Some(0) } else { None },
        network_key_index,
        sequence: None,
    })
}

/// Lower transport layer state
#[derive(Debug)]
pub struct LowerTransportLayer {
    config: TransportConfig,
    scheduler: Scheduler,
    incoming: HashMap<Address, Reassembly>,
    completed: HashMap<Address, Completed>,
    outgoing: DestinationQueues<OutgoingMessage>,
    next_id: u64,
}

impl LowerTransportLayer {
    /// Create the layer
    pub fn new(config: TransportConfig, scheduler: Scheduler) -> Self {
        Self {
            config,
            scheduler,
            incoming: HashMap::new(),
            completed: HashMap::new(),
            outgoing: DestinationQueues::new(),
            next_id: 0,
        }
    }

    /// Whether a segmented message from `source` is partially received
    pub fn is_receiving_message(&self, source: Address) -> bool {
        self.incoming.contains_key(&source)
    }

    /// Number of segmented messages queued for `destination`, in flight included
    pub fn pending_messages(&self, destination: Address) -> usize {
        self.outgoing.len(destination)
    }

    /// Handle a lower transport PDU that passed replay protection
    ///
    /// `sequence` is the sequence number of the message's SeqAuth.
    pub fn receive(
        &mut self,
        network_pdu: &NetworkPdu,
        pdu: LowerTransportPdu,
        sequence: u32,
    ) -> Vec<TransportEvent> {
        match pdu {
            LowerTransportPdu::UnsegmentedAccess(access) => {
                vec![TransportEvent::AccessReceived(AccessMessage {
                    source: network_pdu.source,
                    destination: network_pdu.destination,
                    aid: access.aid,
                    mic: MicSize::Small,
                    sequence,
                    iv_index: network_pdu.iv_index,
                    network_key_index: network_pdu.network_key_index,
                    ttl: network_pdu.ttl,
                    upper_transport_pdu: access.upper_transport_pdu,
                })]
            }
            LowerTransportPdu::UnsegmentedControl(control)
                if control.opcode == ControlOpcode::SegmentAck as u8 =>
            {
                self.segment_ack_received(network_pdu, &control.parameters)
            }
            LowerTransportPdu::UnsegmentedControl(control) => {
                vec![TransportEvent::ControlReceived(ControlMessage {
                    source: network_pdu.source,
                    destination: network_pdu.destination,
                    opcode: control.opcode,
                    parameters: control.parameters,
                    sequence,
                    iv_index: network_pdu.iv_index,
                    network_key_index: network_pdu.network_key_index,
                    ttl: network_pdu.ttl,
                })]
            }
            LowerTransportPdu::SegmentedAccess(segment) => self.receive_segment(
                network_pdu,
                SegmentKind::Access {
                    aid: segment.aid,
                    szmic: segment.szmic,
                },
                segment.header,
                segment.segment,
                sequence,
            ),
            LowerTransportPdu::SegmentedControl(segment) => self.receive_segment(
                network_pdu,
                SegmentKind::Control {
                    opcode: segment.opcode,
                },
                segment.header,
                segment.segment,
                sequence,
            ),
        }
    }

    fn receive_segment(
        &mut self,
        network_pdu: &NetworkPdu,
        kind: SegmentKind,
        header: SegmentHeader,
        segment: Bytes,
        sequence: u32,
    ) -> Vec<TransportEvent> {
        let source = network_pdu.source;

        if let Some(done) = self.completed.get(&source) {
            if done.seq_zero == header.seq_zero && done.sequence == sequence {
                return match done.block_ack {
                    Some(block_ack) if done.destination.is_unicast() => {
                        debug!("segment of completed message from {}, acknowledging again", source);
                        vec![ack_event(
                            done.destination,
                            source,
                            done.seq_zero,
                            block_ack,
                            done.network_key_index,
                            done.ttl_zero,
                        )]
                    }
                    _ => {
                        debug!("segment of finished message from {} ignored", source);
                        Vec::new()
                    }
                };
            }
        }

        let size = kind.segment_size();
        if segment.len() > size || (!header.is_last() && segment.len() != size) {
            warn!(
                "malformed segment from {}: offset={} len={}",
                source,
                header.segment_offset,
                segment.len()
            );
            return Vec::new();
        }

        let stale = self
            .incoming
            .get(&source)
            .is_some_and(|r| r.seq_zero != header.seq_zero || r.sequence != sequence);
        if stale {
            debug!("newer message from {}, abandoning reassembly", source);
            self.incoming.remove(&source);
        }

        let destination = network_pdu.destination;
        let reassembly = self.incoming.entry(source).or_insert_with(|| Reassembly {
            seq_zero: header.seq_zero,
            sequence,
            kind,
            destination,
            iv_index: network_pdu.iv_index,
            network_key_index: network_pdu.network_key_index,
            ttl: network_pdu.ttl,
            ttl_zero: false,
            segments: vec![None; header.segment_count()],
            block_ack: 0,
            ack_timer: destination.is_unicast().then(|| {
                self.scheduler.schedule(
                    self.config.ack_delay(network_pdu.ttl),
                    TimerEvent::SegmentAck {
                        source,
                        seq_zero: header.seq_zero,
                    },
                )
            }),
            incomplete_timer: self.scheduler.schedule(
                self.config.incomplete_timeout,
                TimerEvent::IncompleteTimeout {
                    source,
                    seq_zero: header.seq_zero,
                },
            ),
        });

        if reassembly.kind != kind || reassembly.segments.len() != header.segment_count() {
            warn!("segment from {} does not match its message, dropped", source);
            return Vec::new();
        }
        let offset = header.segment_offset as usize;
        if reassembly.segments[offset].is_some() {
            debug!("duplicate segment {} from {}", offset, source);
            return Vec::new();
        }
        reassembly.segments[offset] = Some(segment);
        reassembly.block_ack |= 1 << offset;
        reassembly.ttl_zero |= network_pdu.ttl == 0;
        reassembly.incomplete_timer = self.scheduler.schedule(
            self.config.incomplete_timeout,
            TimerEvent::IncompleteTimeout {
                source,
                seq_zero: header.seq_zero,
            },
        );

        if !reassembly.is_complete() {
            return Vec::new();
        }
        let Some(reassembly) = self.incoming.remove(&source) else {
            return Vec::new();
        };
        self.finish_reassembly(source, reassembly)
    }

    fn finish_reassembly(&mut self, source: Address, reassembly: Reassembly) -> Vec<TransportEvent> {
        let payload = reassembly.payload();
        debug!(
            "reassembled {} bytes from {} in {} segments",
            payload.len(),
            source,
            reassembly.segments.len()
        );

        let event = match reassembly.kind {
            SegmentKind::Access { aid, szmic } => {
                let mic = MicSize::from_szmic(szmic);
                if payload.len() <= mic.size() {
                    warn!("segmented access message from {} shorter than its MIC", source);
                    None
                } else {
                    Some(TransportEvent::AccessReceived(AccessMessage {
                        source,
                        destination: reassembly.destination,
                        aid,
                        mic,
                        sequence: reassembly.sequence,
                        iv_index: reassembly.iv_index,
                        network_key_index: reassembly.network_key_index,
                        ttl: reassembly.ttl,
                        upper_transport_pdu: payload,
                    }))
                }
            }
            SegmentKind::Control { opcode } => Some(TransportEvent::ControlReceived(ControlMessage {
                source,
                destination: reassembly.destination,
                opcode,
                parameters: payload,
                sequence: reassembly.sequence,
                iv_index: reassembly.iv_index,
                network_key_index: reassembly.network_key_index,
                ttl: reassembly.ttl,
            })),
        };

        self.completed.insert(
            source,
            Completed {
                seq_zero: reassembly.seq_zero,
                sequence: reassembly.sequence,
                destination: reassembly.destination,
                network_key_index: reassembly.network_key_index,
                ttl_zero: reassembly.ttl_zero,
                block_ack: Some(reassembly.block_ack),
                ack_timer: reassembly.ack_timer,
            },
        );
        reassembly.incomplete_timer.cancel();
        event.into_iter().collect()
    }

    /// Handle a fired timer
    pub fn timer(&mut self, event: TimerEvent) -> Vec<TransportEvent> {
        match event {
            TimerEvent::SegmentAck { source, seq_zero } => self.acknowledge(source, seq_zero),
            TimerEvent::IncompleteTimeout { source, seq_zero } => {
                self.incomplete_timeout(source, seq_zero);
                Vec::new()
            }
            TimerEvent::Retransmit { destination, id } => self.retransmit(destination, id),
            TimerEvent::HeartbeatPublication => Vec::new(),
        }
    }

    fn acknowledge(&mut self, source: Address, seq_zero: u16) -> Vec<TransportEvent> {
        if let Some(reassembly) = self.incoming.get_mut(&source) {
            if reassembly.seq_zero == seq_zero {
                let event = ack_event(
                    reassembly.destination,
                    source,
                    seq_zero,
                    reassembly.block_ack,
                    reassembly.network_key_index,
                    reassembly.ttl_zero,
                );
                reassembly.ack_timer = Some(self.scheduler.schedule(
                    self.config.ack_delay(reassembly.ttl),
                    TimerEvent::SegmentAck { source, seq_zero },
                ));
                return vec![event];
            }
        }
        if let Some(done) = self.completed.get_mut(&source) {
            if done.seq_zero == seq_zero && done.ack_timer.take().is_some() {
                if let Some(block_ack) = done.block_ack {
                    return vec![ack_event(
                        done.destination,
                        source,
                        seq_zero,
                        block_ack,
                        done.network_key_index,
                        done.ttl_zero,
                    )];
                }
            }
        }
        Vec::new()
    }

    fn incomplete_timeout(&mut self, source: Address, seq_zero: u16) {
        let matches = self
            .incoming
            .get(&source)
            .is_some_and(|r| r.seq_zero == seq_zero);
        if !matches {
            return;
        }
        if let Some(reassembly) = self.incoming.remove(&source) {
            warn!(
                "incomplete message from {} discarded, {} of {} segments received",
                source,
                reassembly.block_ack.count_ones(),
                reassembly.segments.len()
            );
            self.completed.insert(
                source,
                Completed {
                    seq_zero,
                    sequence: reassembly.sequence,
                    destination: reassembly.destination,
                    network_key_index: reassembly.network_key_index,
                    ttl_zero: reassembly.ttl_zero,
                    block_ack: None,
                    ack_timer: None,
                },
            );
        }
    }

    /// Send an encrypted access message
    ///
    /// Unsegmented messages are handed out immediately with the sequence
    /// number they were secured with. Segmented messages are queued per
    /// destination.
    pub fn send_access(
        &mut self,
        pdu: &UpperTransportPdu,
        segmented: bool,
        ttl: Option<u8>,
        network_key_index: u16,
        handle: MessageHandle,
    ) -> Result<Vec<TransportEvent>, TransportError> {
        let destination = pdu.destination.address;
        if !segmented && !pdu.is_segmented() {
            if pdu.transport_pdu.len() > MAX_UNSEGMENTED_ACCESS_SIZE {
                return Err(TransportError::PayloadTooLong(pdu.transport_pdu.len()));
            }
            return Ok(vec![TransportEvent::Transmit(OutboundPdu {
                pdu: LowerTransportPdu::UnsegmentedAccess(UnsegmentedAccess {
                    aid: pdu.aid,
                    upper_transport_pdu: pdu.transport_pdu.clone(),
                }),
                source: pdu.source,
                destination,
                ttl,
                network_key_index,
                sequence: Some(pdu.sequence),
            })]);
        }

        let segments = segment_access(
            pdu.aid,
            pdu.mic == MicSize::Large,
            pdu.sequence,
            &pdu.transport_pdu,
        )?;
        Ok(self.enqueue(
            Some(handle),
            pdu.source,
            destination,
            ttl,
            network_key_index,
            pdu.sequence,
            segments,
        ))
    }

    /// Send a control message secured with `sequence`
    pub fn send_control(
        &mut self,
        request: &ControlRequest,
        sequence: u32,
    ) -> Result<Vec<TransportEvent>, TransportError> {
        if request.parameters.len() <= MAX_UNSEGMENTED_CONTROL_SIZE {
            return Ok(vec![TransportEvent::Transmit(OutboundPdu {
                pdu: LowerTransportPdu::UnsegmentedControl(UnsegmentedControl {
                    opcode: request.opcode,
                    parameters: request.parameters.clone(),
                }),
                source: request.source,
                destination: request.destination,
                ttl: request.ttl,
                network_key_index: request.network_key_index,
                sequence: Some(sequence),
            })]);
        }
        let segments = segment_control(request.opcode, sequence, &request.parameters)?;
        Ok(self.enqueue(
            None,
            request.source,
            request.destination,
            request.ttl,
            request.network_key_index,
            sequence,
            segments,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn enqueue(
        &mut self,
        handle: Option<MessageHandle>,
        source: Address,
        destination: Address,
        ttl: Option<u8>,
        network_key_index: u16,
        first_sequence: u32,
        segments: Vec<LowerTransportPdu>,
    ) -> Vec<TransportEvent> {
        self.next_id += 1;
        let message = OutgoingMessage {
            id: self.next_id,
            handle,
            source,
            destination,
            ttl,
            network_key_index,
            seq_zero: seq_zero(first_sequence),
            first_sequence,
            segments,
            acked: 0,
            sent: false,
            retransmissions_left: self.config.retransmit_limit,
            retransmit_timer: None,
        };
        if self.outgoing.enqueue(destination, message) {
            self.start_front(destination)
        } else {
            debug!(
                "segmented message to {} queued behind {} others",
                destination,
                self.outgoing.len(destination) - 1
            );
            Vec::new()
        }
    }

    fn start_front(&mut self, destination: Address) -> Vec<TransportEvent> {
        let Some(message) = self.outgoing.front_mut(destination) else {
            return Vec::new();
        };
        let mut events = message.transmit_unacked();
        debug!(
            "sending {} segments to {} seq_zero={}",
            events.len(),
            destination,
            message.seq_zero
        );
        if destination.is_unicast() {
            let ttl = message.ttl.unwrap_or(self.config.default_ttl);
            message.retransmit_timer = Some(self.scheduler.schedule(
                self.config.retransmit_interval(ttl),
                TimerEvent::Retransmit {
                    destination,
                    id: message.id,
                },
            ));
        } else {
            events.extend(self.complete(destination, Ok(())));
        }
        events
    }

    fn complete(
        &mut self,
        destination: Address,
        result: Result<(), TransportError>,
    ) -> Vec<TransportEvent> {
        let Some(mut message) = self.outgoing.dequeue(destination) else {
            return Vec::new();
        };
        if let Some(timer) = message.retransmit_timer.take() {
            timer.cancel();
        }
        debug!(
            "segmented message to {} seq_zero={} finished: {:?}",
            destination, message.seq_zero, result
        );
        let mut events = vec![TransportEvent::SegmentedSendCompleted {
            destination,
            handle: message.handle,
            result,
        }];
        events.extend(self.start_front(destination));
        events
    }

    fn segment_ack_received(&mut self, network_pdu: &NetworkPdu, parameters: &[u8]) -> Vec<TransportEvent> {
        let ack = match SegmentAck::decode(parameters) {
            Ok(ack) => ack,
            Err(e) => {
                warn!("malformed segment acknowledgment from {}: {}", network_pdu.source, e);
                return Vec::new();
            }
        };
        let destination = network_pdu.source;
        let Some(message) = self.outgoing.front_mut(destination) else {
            debug!("segment acknowledgment from {} with nothing in flight", destination);
            return Vec::new();
        };
        if !destination.is_unicast()
            || message.seq_zero != ack.seq_zero
            || message.source != network_pdu.destination
        {
            debug!("stale segment acknowledgment from {} seq_zero={}", destination, ack.seq_zero);
            return Vec::new();
        }
        if ack.is_busy() {
            warn!("{} is busy, segmented message abandoned", destination);
            return self.complete(destination, Err(TransportError::Busy));
        }

        let complete = message.complete_block();
        let newly_acked = ack.block_ack & complete & !message.acked;
        message.acked |= ack.block_ack & complete;
        if message.acked == complete {
            return self.complete(destination, Ok(()));
        }
        if newly_acked == 0 {
            return Vec::new();
        }

        message.retransmissions_left = self.config.retransmit_limit;
        let events = message.transmit_unacked();
        let ttl = message.ttl.unwrap_or(self.config.default_ttl);
        message.retransmit_timer = Some(self.scheduler.schedule(
            self.config.retransmit_interval(ttl),
            TimerEvent::Retransmit {
                destination,
                id: message.id,
            },
        ));
        events
    }

    fn retransmit(&mut self, destination: Address, id: u64) -> Vec<TransportEvent> {
        let Some(message) = self.outgoing.front_mut(destination) else {
            return Vec::new();
        };
        if message.id != id {
            return Vec::new();
        }
        if message.retransmissions_left == 0 {
            warn!(
                "no acknowledgment from {} for seq_zero={}, giving up",
                destination, message.seq_zero
            );
            return self.complete(destination, Err(TransportError::Timeout));
        }
        message.retransmissions_left -= 1;
        let events = message.transmit_unacked();
        let ttl = message.ttl.unwrap_or(self.config.default_ttl);
        message.retransmit_timer = Some(self.scheduler.schedule(
            self.config.retransmit_interval(ttl),
            TimerEvent::Retransmit { destination, id },
        ));
        events
    }

    /// Cancel segmented messages matching `handle`
    ///
    /// Waiting messages are removed. A matching message in flight is aborted
    /// and the next one for its destination starts.
    pub fn cancel(&mut self, handle: &MessageHandle) -> Vec<TransportEvent> {
        let destination = handle.destination;
        let mut events: Vec<TransportEvent> = self
            .outgoing
            .remove_waiting(destination, |m| m.handle.as_ref() == Some(handle))
            .into_iter()
            .map(|m| TransportEvent::SegmentedSendCompleted {
                destination,
                handle: m.handle,
                result: Err(TransportError::Cancelled),
            })
            .collect();
        let in_flight = self
            .outgoing
            .front(destination)
            .is_some_and(|m| m.handle.as_ref() == Some(handle));
        if in_flight {
            events.extend(self.complete(destination, Err(TransportError::Cancelled)));
        }
        events
    }
}
