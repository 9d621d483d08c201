//! Access layer opcode framing.
//!
//! The transport layers never interpret access messages, but cancellation
//! handles are keyed by opcode, so the opcode has to be read off the front of
//! an access PDU.

use crate::error::WireError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An access layer opcode (1, 2 or 3 octets)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Opcode(pub u32);

impl Opcode {
    /// Number of octets this opcode takes on the wire
    pub fn size(self) -> usize {
        if self.0 < 0x80 {
            1
        } else if self.0 < 0x1_0000 {
            2
        } else {
            3
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#X}", self.0)
    }
}

/// Read the opcode at the start of an access PDU
pub fn access_opcode(pdu: &[u8]) -> Result<Opcode, WireError> {
    WireError::check_len(pdu, 1)?;
    match pdu[0] >> 6 {
        0b00 | 0b01 => {
            if pdu[0] == 0x7F {
                Err(WireError::Malformed("reserved access opcode"))
            } else {
                Ok(Opcode(pdu[0] as u32))
            }
        }
        0b10 => {
            WireError::check_len(pdu, 2)?;
            Ok(Opcode(u16::from_be_bytes([pdu[0], pdu[1]]) as u32))
        }
        _ => {
            WireError::check_len(pdu, 3)?;
            Ok(Opcode(u32::from_be_bytes([0, pdu[0], pdu[1], pdu[2]])))
        }
    }
}
