//! Sequence number and replay protection state for the mesh.
//!
//! Every outgoing Network PDU needs a 24-bit sequence number that is never
//! reused for a given source address and IV Index, and every incoming message
//! is checked against the last SeqAuth seen from its source. Both live behind
//! the [`SequenceAuthority`] trait so persistence stays outside the protocol
//! layers.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use async_trait::async_trait;
use mesh_wire::Address;
use thiserror::Error;

/// Largest 24-bit sequence number
pub const MAX_SEQUENCE_NUMBER: u32 = 0x00FF_FFFF;

/// Storage errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// All 24-bit sequence numbers for this source have been used
    #[error("sequence numbers exhausted for {0}")]
    SequenceExhausted(Address),
    /// Backend-specific error
    #[error("Backend error: {0}")]
    Backend(String),
}

/// SeqAuth: IV Index in the upper bits, 24-bit sequence number in the lower
pub fn seq_auth(iv_index: u32, sequence: u32) -> u64 {
    ((iv_index as u64) << 24) | (sequence & MAX_SEQUENCE_NUMBER) as u64
}

/// Source of sequence numbers and keeper of replay state
#[async_trait]
pub trait SequenceAuthority: Send + Sync {
    /// Allocate the next sequence number for a local source address
    async fn next_sequence_number(&self, source: Address) -> Result<u32, StorageError>;

    /// Restart sequence numbers after an IV Index change
    async fn reset_sequence_number(&self, source: Address) -> Result<(), StorageError>;

    /// Last SeqAuth accepted from a remote source
    async fn last_seq_auth(&self, source: Address) -> Result<Option<u64>, StorageError>;

    /// Record the SeqAuth of an accepted message
    async fn set_last_seq_auth(&self, source: Address, seq_auth: u64) -> Result<(), StorageError>;
}

// Re-export main types
pub use backend::mem::{MemoryMessageCache, MemorySequenceStore};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_auth_ordering() {
        assert_eq!(seq_auth(1, 0), 0x0100_0000);
        assert!(seq_auth(1, 0) > seq_auth(0, MAX_SEQUENCE_NUMBER));
        assert_eq!(seq_auth(0x1234_5678, 0x01FF_FFFF), 0x12_3456_78FF_FFFF);
    }
}
