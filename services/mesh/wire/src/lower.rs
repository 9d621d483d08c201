//! Lower transport PDU headers.
//!
//! The first bit of every lower transport PDU is SEG. Together with the CTL
//! bit of the enclosing Network PDU it selects one of four layouts.

use crate::error::WireError;
use crate::network::PduType;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Largest upper transport PDU that fits an unsegmented access message
pub const MAX_UNSEGMENTED_ACCESS_SIZE: usize = 15;

/// Largest parameters block of an unsegmented control message
pub const MAX_UNSEGMENTED_CONTROL_SIZE: usize = 11;

/// Segment payload size for access messages
pub const MAX_ACCESS_SEGMENT_SIZE: usize = 12;

/// Segment payload size for control messages
pub const MAX_CONTROL_SEGMENT_SIZE: usize = 8;

/// SegN is 5 bits wide
pub const MAX_SEGMENTS: usize = 32;

/// SeqZero is 13 bits wide
pub const SEQ_ZERO_MASK: u32 = 0x1FFF;

/// Segmentation header fields shared by access and control segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentHeader {
    /// Low 13 bits of the sequence number of the first segment
    pub seq_zero: u16,
    /// SegO, 0-based
    pub segment_offset: u8,
    /// SegN, 0-based index of the last segment
    pub last_segment_number: u8,
}

impl SegmentHeader {
    /// Create a header, validating field widths and SegO <= SegN
    pub fn new(seq_zero: u16, segment_offset: u8, last_segment_number: u8) -> Result<Self, WireError> {
        if last_segment_number as usize >= MAX_SEGMENTS {
            return Err(WireError::Size(last_segment_number as usize + 1));
        }
        if segment_offset > last_segment_number {
            return Err(WireError::SegmentOffset {
                offset: segment_offset,
                last: last_segment_number,
            });
        }
        Ok(Self {
            seq_zero: seq_zero & SEQ_ZERO_MASK as u16,
            segment_offset,
            last_segment_number,
        })
    }

    /// Number of segments in the message
    pub fn segment_count(&self) -> usize {
        self.last_segment_number as usize + 1
    }

    /// Whether this is the final segment of the message
    pub fn is_last(&self) -> bool {
        self.segment_offset == self.last_segment_number
    }

    /// Pack bytes 1..4 of the segmented header; `flag` is SZMIC or RFU
    fn put(&self, flag: bool, buf: &mut BytesMut) {
        buf.put_u8(((flag as u8) << 7) | ((self.seq_zero >> 6) as u8 & 0x7F));
        buf.put_u8((((self.seq_zero & 0x3F) as u8) << 2) | (self.segment_offset >> 3));
        buf.put_u8(((self.segment_offset & 0x07) << 5) | (self.last_segment_number & 0x1F));
    }

    /// Unpack bytes 1..4; returns the SZMIC/RFU flag and the header
    fn parse(data: &[u8]) -> Result<(bool, Self), WireError> {
        let flag = data[1] & 0x80 != 0;
        let seq_zero = (((data[1] & 0x7F) as u16) << 6) | ((data[2] >> 2) as u16);
        let segment_offset = ((data[2] & 0x03) << 3) | (data[3] >> 5);
        let last_segment_number = data[3] & 0x1F;
        Ok((flag, Self::new(seq_zero, segment_offset, last_segment_number)?))
    }
}

/// Unsegmented access message: `[0|AKF|AID] upper transport PDU`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsegmentedAccess {
    /// Application key identifier; `None` when signed with a device key
    pub aid: Option<u8>,
    /// Encrypted access payload followed by a 32-bit TransMIC
    pub upper_transport_pdu: Bytes,
}

/// One segment of a segmented access message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentedAccess {
    /// Application key identifier; `None` when signed with a device key
    pub aid: Option<u8>,
    /// Whether the TransMIC is 64 bits
    pub szmic: bool,
    /// Segmentation fields
    pub header: SegmentHeader,
    /// Segment of the upper transport PDU
    pub segment: Bytes,
}

/// Unsegmented control message: `[0|Opcode] parameters`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsegmentedControl {
    /// 7-bit control opcode
    pub opcode: u8,
    /// Opcode parameters
    pub parameters: Bytes,
}

/// One segment of a segmented control message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentedControl {
    /// 7-bit control opcode
    pub opcode: u8,
    /// Segmentation fields
    pub header: SegmentHeader,
    /// Segment of the parameters
    pub segment: Bytes,
}

/// A decoded lower transport PDU
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LowerTransportPdu {
    /// CTL = 0, SEG = 0
    UnsegmentedAccess(UnsegmentedAccess),
    /// CTL = 0, SEG = 1
    SegmentedAccess(SegmentedAccess),
    /// CTL = 1, SEG = 0
    UnsegmentedControl(UnsegmentedControl),
    /// CTL = 1, SEG = 1
    SegmentedControl(SegmentedControl),
}

fn akf_aid(aid: Option<u8>) -> u8 {
    match aid {
        Some(aid) => 0x40 | (aid & 0x3F),
        None => 0x00,
    }
}

fn parse_aid(byte: u8) -> Option<u8> {
    if byte & 0x40 != 0 {
        Some(byte & 0x3F)
    } else {
        None
    }
}

impl LowerTransportPdu {
    /// Decode a lower transport PDU carried by a Network PDU of `pdu_type`
    pub fn decode(pdu_type: PduType, data: &[u8]) -> Result<Self, WireError> {
        WireError::check_len(data, 1)?;
        let segmented = data[0] & 0x80 != 0;

        match (pdu_type, segmented) {
            (PduType::Access, false) => {
                // AKF|AID plus at least one access byte and a 32-bit TransMIC
                WireError::check_len(data, 6)?;
                if data.len() > 1 + MAX_UNSEGMENTED_ACCESS_SIZE {
                    return Err(WireError::Size(data.len()));
                }
                Ok(LowerTransportPdu::UnsegmentedAccess(UnsegmentedAccess {
                    aid: parse_aid(data[0]),
                    upper_transport_pdu: Bytes::copy_from_slice(&data[1..]),
                }))
            }
            (PduType::Access, true) => {
                WireError::check_len(data, 5)?;
                if data.len() > 4 + MAX_ACCESS_SEGMENT_SIZE {
                    return Err(WireError::Size(data.len()));
                }
                let (szmic, header) = SegmentHeader::parse(data)?;
                Ok(LowerTransportPdu::SegmentedAccess(SegmentedAccess {
                    aid: parse_aid(data[0]),
                    szmic,
                    header,
                    segment: Bytes::copy_from_slice(&data[4..]),
                }))
            }
            (PduType::Control, false) => {
                if data.len() > 1 + MAX_UNSEGMENTED_CONTROL_SIZE {
                    return Err(WireError::Size(data.len()));
                }
                Ok(LowerTransportPdu::UnsegmentedControl(UnsegmentedControl {
                    opcode: data[0] & 0x7F,
                    parameters: Bytes::copy_from_slice(&data[1..]),
                }))
            }
            (PduType::Control, true) => {
                WireError::check_len(data, 5)?;
                if data.len() > 4 + MAX_CONTROL_SEGMENT_SIZE {
                    return Err(WireError::Size(data.len()));
                }
                let (rfu, header) = SegmentHeader::parse(data)?;
                if rfu {
                    return Err(WireError::Reserved);
                }
                Ok(LowerTransportPdu::SegmentedControl(SegmentedControl {
                    opcode: data[0] & 0x7F,
                    header,
                    segment: Bytes::copy_from_slice(&data[4..]),
                }))
            }
        }
    }

    /// Encode to bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            LowerTransportPdu::UnsegmentedAccess(pdu) => {
                buf.put_u8(akf_aid(pdu.aid));
                buf.put_slice(&pdu.upper_transport_pdu);
            }
            LowerTransportPdu::SegmentedAccess(pdu) => {
                buf.put_u8(0x80 | akf_aid(pdu.aid));
                pdu.header.put(pdu.szmic, &mut buf);
                buf.put_slice(&pdu.segment);
            }
            LowerTransportPdu::UnsegmentedControl(pdu) => {
                buf.put_u8(pdu.opcode & 0x7F);
                buf.put_slice(&pdu.parameters);
            }
            LowerTransportPdu::SegmentedControl(pdu) => {
                buf.put_u8(0x80 | (pdu.opcode & 0x7F));
                pdu.header.put(false, &mut buf);
                buf.put_slice(&pdu.segment);
            }
        }
        buf.freeze()
    }

    /// PDU type of the enclosing Network PDU
    pub fn pdu_type(&self) -> PduType {
        match self {
            LowerTransportPdu::UnsegmentedAccess(_) | LowerTransportPdu::SegmentedAccess(_) => {
                PduType::Access
            }
            LowerTransportPdu::UnsegmentedControl(_) | LowerTransportPdu::SegmentedControl(_) => {
                PduType::Control
            }
        }
    }

    /// Segmentation fields, if this is a segment
    pub fn segment_header(&self) -> Option<&SegmentHeader> {
        match self {
            LowerTransportPdu::SegmentedAccess(pdu) => Some(&pdu.header),
            LowerTransportPdu::SegmentedControl(pdu) => Some(&pdu.header),
            _ => None,
        }
    }
}
