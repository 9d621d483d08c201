//! Transport control messages.

use crate::error::WireError;
use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Transport control opcodes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlOpcode {
    /// Segment Acknowledgment
    SegmentAck = 0x00,
    /// Friend Poll
    FriendPoll = 0x01,
    /// Friend Update
    FriendUpdate = 0x02,
    /// Friend Request
    FriendRequest = 0x03,
    /// Friend Offer
    FriendOffer = 0x04,
    /// Friend Clear
    FriendClear = 0x05,
    /// Friend Clear Confirm
    FriendClearConfirm = 0x06,
    /// Friend Subscription List Add
    FriendSubscriptionListAdd = 0x07,
    /// Friend Subscription List Remove
    FriendSubscriptionListRemove = 0x08,
    /// Friend Subscription List Confirm
    FriendSubscriptionListConfirm = 0x09,
    /// Heartbeat
    Heartbeat = 0x0A,
}

impl TryFrom<u8> for ControlOpcode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ControlOpcode::SegmentAck),
            0x01 => Ok(ControlOpcode::FriendPoll),
            0x02 => Ok(ControlOpcode::FriendUpdate),
            0x03 => Ok(ControlOpcode::FriendRequest),
            0x04 => Ok(ControlOpcode::FriendOffer),
            0x05 => Ok(ControlOpcode::FriendClear),
            0x06 => Ok(ControlOpcode::FriendClearConfirm),
            0x07 => Ok(ControlOpcode::FriendSubscriptionListAdd),
            0x08 => Ok(ControlOpcode::FriendSubscriptionListRemove),
            0x09 => Ok(ControlOpcode::FriendSubscriptionListConfirm),
            0x0A => Ok(ControlOpcode::Heartbeat),
            _ => Err(WireError::Opcode(value)),
        }
    }
}

/// Segment Acknowledgment parameters
///
/// ```text
/// [OBO|SeqZero hi 7][SeqZero lo 6|RFU 2][BlockAck (32, big-endian)]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentAck {
    /// Sent by a Friend on behalf of a Low Power node
    pub obo: bool,
    /// SeqZero of the acknowledged message
    pub seq_zero: u16,
    /// Bit `n` set when segment `n` has been received
    pub block_ack: u32,
}

impl SegmentAck {
    /// Parameters size
    pub const SIZE: usize = 6;

    /// Block ack with all `segment_count` bits set
    pub fn complete_block(segment_count: usize) -> u32 {
        if segment_count >= 32 {
            u32::MAX
        } else {
            (1u32 << segment_count) - 1
        }
    }

    /// Whether every one of `segment_count` segments is acknowledged
    pub fn is_complete(&self, segment_count: usize) -> bool {
        let mask = Self::complete_block(segment_count);
        self.block_ack & mask == mask
    }

    /// Whether a given segment is acknowledged
    pub fn is_acked(&self, segment_offset: u8) -> bool {
        segment_offset < 32 && self.block_ack & (1 << segment_offset) != 0
    }

    /// A zero block ack means the receiver is busy and cancelled the transfer
    pub fn is_busy(&self) -> bool {
        self.block_ack == 0
    }

    /// Encode parameters
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u8(((self.obo as u8) << 7) | ((self.seq_zero >> 6) as u8 & 0x7F));
        buf.put_u8(((self.seq_zero & 0x3F) as u8) << 2);
        buf.put_u32(self.block_ack);
        buf.freeze()
    }

    /// Decode parameters
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() != Self::SIZE {
            return Err(WireError::Length {
                need: Self::SIZE,
                got: data.len(),
            });
        }
        Ok(Self {
            obo: data[0] & 0x80 != 0,
            seq_zero: (((data[0] & 0x7F) as u16) << 6) | ((data[1] >> 2) as u16),
            block_ack: u32::from_be_bytes([data[2], data[3], data[4], data[5]]),
        })
    }
}

bitflags! {
    /// Node features reported in Heartbeat messages
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Features: u16 {
        /// Relay feature in use
        const RELAY = 1 << 0;
        /// Proxy feature in use
        const PROXY = 1 << 1;
        /// Friend feature in use
        const FRIEND = 1 << 2;
        /// Low Power feature in use
        const LOW_POWER = 1 << 3;
    }
}

/// Heartbeat parameters: `[RFU|InitTTL(7)][Features (16, big-endian)]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// TTL the Heartbeat was originally sent with
    pub init_ttl: u8,
    /// Features currently active on the sender
    pub features: Features,
}

impl HeartbeatPayload {
    /// Parameters size
    pub const SIZE: usize = 3;

    /// Encode parameters
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u8(self.init_ttl & 0x7F);
        buf.put_u16(self.features.bits());
        buf.freeze()
    }

    /// Decode parameters; unknown feature bits are ignored
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() != Self::SIZE {
            return Err(WireError::Length {
                need: Self::SIZE,
                got: data.len(),
            });
        }
        Ok(Self {
            init_ttl: data[0] & 0x7F,
            features: Features::from_bits_truncate(u16::from_be_bytes([data[1], data[2]])),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_conversion() {
        assert_eq!(ControlOpcode::try_from(0x00).unwrap(), ControlOpcode::SegmentAck);
        assert_eq!(ControlOpcode::try_from(0x0A).unwrap(), ControlOpcode::Heartbeat);
        assert_eq!(ControlOpcode::try_from(0x7F), Err(WireError::Opcode(0x7F)));
    }

    #[test]
    fn test_segment_ack_layout() {
        let ack = SegmentAck {
            obo: false,
            seq_zero: 0x1FFF,
            block_ack: 0x0000_0003,
        };
        assert_eq!(ack.encode().as_ref(), &[0x7F, 0xFC, 0x00, 0x00, 0x00, 0x03]);
        assert_eq!(SegmentAck::decode(&ack.encode()).unwrap(), ack);
        assert!(ack.is_complete(2));
        assert!(!ack.is_complete(3));
        assert!(ack.is_acked(1));
        assert!(!ack.is_acked(2));
    }

    #[test]
    fn test_complete_block() {
        assert_eq!(SegmentAck::complete_block(1), 0x1);
        assert_eq!(SegmentAck::complete_block(5), 0x1F);
        assert_eq!(SegmentAck::complete_block(32), u32::MAX);
    }

    #[test]
    fn test_heartbeat_payload() {
        let hb = HeartbeatPayload {
            init_ttl: 5,
            features: Features::RELAY | Features::PROXY,
        };
        assert_eq!(hb.encode().as_ref(), &[0x05, 0x00, 0x03]);
        assert_eq!(HeartbeatPayload::decode(&hb.encode()).unwrap(), hb);
        assert!(HeartbeatPayload::decode(&[0x05]).is_err());
    }
}
