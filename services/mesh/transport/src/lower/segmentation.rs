//! Splitting transport PDUs into segments and SeqAuth arithmetic.

use crate::error::TransportError;
use bytes::Bytes;
use mesh_wire::{
    LowerTransportPdu, SegmentHeader, SegmentedAccess, SegmentedControl, MAX_ACCESS_SEGMENT_SIZE,
    MAX_CONTROL_SEGMENT_SIZE, MAX_SEGMENTS, SEQ_ZERO_MASK,
};

/// SeqZero of a message whose first segment used `sequence`
pub fn seq_zero(sequence: u32) -> u16 {
    (sequence & SEQ_ZERO_MASK) as u16
}

/// Sequence number of SeqAuth for a segment sent with `sequence`
///
/// SeqZero holds the low 13 bits of the sequence number of the message's
/// first segment, which is never newer than any later segment. `None` when
/// no such sequence number exists.
pub fn seq_auth_sequence(sequence: u32, seq_zero: u16) -> Option<u32> {
    let low = sequence & SEQ_ZERO_MASK;
    let seq_zero = seq_zero as u32 & SEQ_ZERO_MASK;
    if low < seq_zero {
        sequence.checked_sub(low + (SEQ_ZERO_MASK + 1) - seq_zero)
    } else {
        Some(sequence - (low - seq_zero))
    }
}

/// Whether a message with `seq_auth` passes replay protection
///
/// Unsegmented messages must be strictly newer than the last one accepted
/// from the source. Segments may repeat the SeqAuth of the message they
/// belong to.
pub fn accepts_seq_auth(last: Option<u64>, seq_auth: u64, segmented: bool) -> bool {
    match last {
        None => true,
        Some(last) if segmented => seq_auth >= last,
        Some(last) => seq_auth > last,
    }
}

fn chunks(payload: &Bytes, size: usize) -> Result<Vec<Bytes>, TransportError> {
    let count = payload.len().div_ceil(size);
    if count == 0 || count > MAX_SEGMENTS {
        return Err(TransportError::PayloadTooLong(payload.len()));
    }
    Ok((0..count)
        .map(|i| payload.slice(i * size..((i + 1) * size).min(payload.len())))
        .collect())
}

/// Segment an encrypted upper transport PDU
pub fn segment_access(
    aid: Option<u8>,
    szmic: bool,
    sequence: u32,
    transport_pdu: &Bytes,
) -> Result<Vec<LowerTransportPdu>, TransportError> {
    let parts = chunks(transport_pdu, MAX_ACCESS_SEGMENT_SIZE)?;
    let last = (parts.len() - 1) as u8;
    parts
        .into_iter()
        .enumerate()
        .map(|(offset, segment)| {
            Ok(LowerTransportPdu::SegmentedAccess(SegmentedAccess {
                aid,
                szmic,
                header: SegmentHeader::new(seq_zero(sequence), offset as u8, last)?,
                segment,
            }))
        })
        .collect()
}

/// Segment control message parameters
pub fn segment_control(
    opcode: u8,
    sequence: u32,
    parameters: &Bytes,
) -> Result<Vec<LowerTransportPdu>, TransportError> {
    let parts = chunks(parameters, MAX_CONTROL_SEGMENT_SIZE)?;
    let last = (parts.len() - 1) as u8;
    parts
        .into_iter()
        .enumerate()
        .map(|(offset, segment)| {
            Ok(LowerTransportPdu::SegmentedControl(SegmentedControl {
                opcode,
                header: SegmentHeader::new(seq_zero(sequence), offset as u8, last)?,
                segment,
            }))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_auth_sequence() {
        assert_eq!(seq_auth_sequence(0x3129AB, 0x09AB), Some(0x3129AB));
        assert_eq!(seq_auth_sequence(0x3129AD, 0x09AB), Some(0x3129AB));
        // SeqZero wrapped: first segment 0x1FFE, later segment 0x2001
        assert_eq!(seq_auth_sequence(0x2001, 0x1FFE), Some(0x1FFE));
        assert_eq!(seq_auth_sequence(0x0001, 0x1FFE), None);
    }

    #[test]
    fn test_replay_window() {
        assert!(accepts_seq_auth(None, 5, false));
        assert!(accepts_seq_auth(Some(4), 5, false));
        assert!(!accepts_seq_auth(Some(5), 5, false));
        assert!(accepts_seq_auth(Some(5), 5, true));
        assert!(!accepts_seq_auth(Some(6), 5, true));
    }

    #[test]
    fn test_twenty_bytes_make_two_segments() {
        let pdu = Bytes::from((0u8..20).collect::<Vec<_>>());
        let segments = segment_access(Some(0x26), false, 0x2005, &pdu).unwrap();
        assert_eq!(segments.len(), 2);
        for (i, segment) in segments.iter().enumerate() {
            let LowerTransportPdu::SegmentedAccess(segment) = segment else {
                panic!("not an access segment");
            };
            assert_eq!(segment.header.seq_zero, 0x0005);
            assert_eq!(segment.header.last_segment_number, 1);
            assert_eq!(segment.header.segment_offset as usize, i);
            assert_eq!(segment.segment.len(), if i == 0 { 12 } else { 8 });
        }
    }

    #[test]
    fn test_segment_limits() {
        assert!(segment_access(None, false, 0, &Bytes::new()).is_err());
        let too_long = Bytes::from(vec![0; MAX_SEGMENTS * MAX_ACCESS_SEGMENT_SIZE + 1]);
        assert!(segment_access(None, false, 0, &too_long).is_err());
        let control = segment_control(0x0A, 7, &Bytes::from(vec![1; 17])).unwrap();
        assert_eq!(control.len(), 3);
    }
}
