//! Per-destination outbound FIFOs.
//!
//! The front entry of a destination's queue is the message in flight; the
//! rest wait for it to complete. Both transport layers use this to admit one
//! segmented message per destination at a time.

use mesh_wire::Address;
use std::collections::{HashMap, VecDeque};

/// FIFO queues keyed by destination address
#[derive(Debug)]
pub struct DestinationQueues<T> {
    queues: HashMap<Address, VecDeque<T>>,
}

impl<T> Default for DestinationQueues<T> {
    fn default() -> Self {
        Self {
            queues: HashMap::new(),
        }
    }
}

impl<T> DestinationQueues<T> {
    /// Create empty queues
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry; returns `true` if it is now in flight
    pub fn enqueue(&mut self, destination: Address, entry: T) -> bool {
        let queue = self.queues.entry(destination).or_default();
        queue.push_back(entry);
        queue.len() == 1
    }

    /// The in-flight entry for `destination`
    pub fn front(&self, destination: Address) -> Option<&T> {
        self.queues.get(&destination).and_then(|q| q.front())
    }

    /// The in-flight entry for `destination`, mutably
    pub fn front_mut(&mut self, destination: Address) -> Option<&mut T> {
        self.queues.get_mut(&destination).and_then(|q| q.front_mut())
    }

    /// Remove the in-flight entry; the next one, if any, becomes in flight
    pub fn dequeue(&mut self, destination: Address) -> Option<T> {
        let queue = self.queues.get_mut(&destination)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&destination);
        }
        entry
    }

    /// Remove waiting (not in-flight) entries matching `predicate`
    pub fn remove_waiting<F>(&mut self, destination: Address, mut predicate: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let Some(queue) = self.queues.get_mut(&destination) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(queue.len());
        for (i, entry) in queue.drain(..).enumerate() {
            if i > 0 && predicate(&entry) {
                removed.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        *queue = kept;
        removed
    }

    /// Number of entries, in flight included, for `destination`
    pub fn len(&self, destination: Address) -> usize {
        self.queues.get(&destination).map_or(0, |q| q.len())
    }

    /// Whether nothing is queued for any destination
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Destinations with something in flight
    pub fn destinations(&self) -> impl Iterator<Item = Address> + '_ {
        self.queues.keys().copied()
    }
}
