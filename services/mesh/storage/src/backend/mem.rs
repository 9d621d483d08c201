//! In-memory storage backend for development and testing

use crate::{SequenceAuthority, StorageError, MAX_SEQUENCE_NUMBER};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use mesh_wire::Address;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// In-memory sequence authority
#[derive(Clone, Default)]
pub struct MemorySequenceStore {
    /// Per-source next sequence number to hand out
    next_sequence: Arc<DashMap<Address, u32>>,
    /// Per-source last accepted SeqAuth
    last_seq_auth: Arc<DashMap<Address, u64>>,
}

impl MemorySequenceStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Start handing out sequence numbers for `source` at `sequence`
    pub fn with_sequence(self, source: Address, sequence: u32) -> Self {
        self.next_sequence.insert(source, sequence);
        self
    }
}

#[async_trait]
impl SequenceAuthority for MemorySequenceStore {
    async fn next_sequence_number(&self, source: Address) -> Result<u32, StorageError> {
        let mut next = self.next_sequence.entry(source).or_insert(0);
        let sequence = *next;
        if sequence > MAX_SEQUENCE_NUMBER {
            warn!("sequence space exhausted source={}", source);
            return Err(StorageError::SequenceExhausted(source));
        }
        *next = sequence + 1;
        Ok(sequence)
    }

    async fn reset_sequence_number(&self, source: Address) -> Result<(), StorageError> {
        debug!("sequence reset source={}", source);
        self.next_sequence.insert(source, 0);
        Ok(())
    }

    async fn last_seq_auth(&self, source: Address) -> Result<Option<u64>, StorageError> {
        Ok(self.last_seq_auth.get(&source).map(|v| *v))
    }

    async fn set_last_seq_auth(&self, source: Address, seq_auth: u64) -> Result<(), StorageError> {
        debug!("seq_auth source={} value={:#x}", source, seq_auth);
        self.last_seq_auth.insert(source, seq_auth);
        Ok(())
    }
}

/// Bounded cache of raw Network PDUs already processed
///
/// The oldest entry is evicted once `capacity` is reached.
pub struct MemoryMessageCache {
    seen: HashSet<Bytes>,
    order: VecDeque<Bytes>,
    capacity: usize,
}

impl MemoryMessageCache {
    /// Create a cache holding up to `capacity` PDUs
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record a PDU; returns `false` if it was already in the cache
    pub fn insert(&mut self, pdu: &[u8]) -> bool {
        if self.seen.contains(pdu) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        let pdu = Bytes::copy_from_slice(pdu);
        self.seen.insert(pdu.clone());
        self.order.push_back(pdu);
        true
    }

    /// Whether a PDU is in the cache
    pub fn contains(&self, pdu: &[u8]) -> bool {
        self.seen.contains(pdu)
    }

    /// Number of cached PDUs
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for MemoryMessageCache {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequence_numbers_per_source() {
        let store = MemorySequenceStore::new().with_sequence(Address(0x0002), 10);

        assert_eq!(store.next_sequence_number(Address(0x0001)).await.unwrap(), 0);
        assert_eq!(store.next_sequence_number(Address(0x0001)).await.unwrap(), 1);
        assert_eq!(store.next_sequence_number(Address(0x0002)).await.unwrap(), 10);

        store.reset_sequence_number(Address(0x0001)).await.unwrap();
        assert_eq!(store.next_sequence_number(Address(0x0001)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sequence_exhausted() {
        let store = MemorySequenceStore::new().with_sequence(Address(0x0001), MAX_SEQUENCE_NUMBER);
        assert_eq!(
            store.next_sequence_number(Address(0x0001)).await.unwrap(),
            MAX_SEQUENCE_NUMBER
        );
        assert_eq!(
            store.next_sequence_number(Address(0x0001)).await,
            Err(StorageError::SequenceExhausted(Address(0x0001)))
        );
    }

    #[tokio::test]
    async fn test_seq_auth_roundtrip() {
        let store = MemorySequenceStore::new();
        assert_eq!(store.last_seq_auth(Address(0x1201)).await.unwrap(), None);
        store.set_last_seq_auth(Address(0x1201), 0x42).await.unwrap();
        assert_eq!(store.last_seq_auth(Address(0x1201)).await.unwrap(), Some(0x42));
    }

    #[test]
    fn test_message_cache_eviction() {
        let mut cache = MemoryMessageCache::new(2);
        assert!(cache.insert(b"one"));
        assert!(!cache.insert(b"one"));
        assert!(cache.insert(b"two"));
        assert!(cache.insert(b"three"));
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(b"one"));
        assert!(cache.contains(b"three"));
        assert!(cache.insert(b"one"));
    }
}
