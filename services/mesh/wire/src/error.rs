//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Not enough bytes for the layout being decoded
    #[error("too short: need {need} bytes, got {got}")]
    Length {
        /// Minimum number of bytes required
        need: usize,
        /// Number of bytes available
        got: usize,
    },

    /// Payload larger than the layout allows
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Segment offset beyond the last segment number
    #[error("segment offset {offset} exceeds last segment number {last}")]
    SegmentOffset {
        /// SegO field
        offset: u8,
        /// SegN field
        last: u8,
    },

    /// Unknown control opcode
    #[error("unknown control opcode {0:#04x}")]
    Opcode(u8),

    /// Unknown beacon type
    #[error("unknown beacon type {0}")]
    BeaconType(u8),

    /// Reserved bits nonzero
    #[error("reserved bits nonzero")]
    Reserved,

    /// Malformed field
    #[error("malformed {0}")]
    Malformed(&'static str),
}

impl WireError {
    pub(crate) fn check_len(data: &[u8], need: usize) -> Result<(), WireError> {
        if data.len() < need {
            Err(WireError::Length {
                need,
                got: data.len(),
            })
        } else {
            Ok(())
        }
    }
}
