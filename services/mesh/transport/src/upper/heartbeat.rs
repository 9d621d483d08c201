//! Heartbeat publication and subscription state.
//!
//! Counts and periods are configured as logarithms: a log value `n` in
//! `0x01..=0x11` stands for `2^(n-1)`, zero disables, and a publication count
//! log of `0xFF` publishes indefinitely.

use crate::error::TransportError;
use crate::message::ControlMessage;
use mesh_wire::{Address, Features, HeartbeatPayload, WireError};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Publication count log meaning "publish forever"
pub const INDEFINITE_COUNT_LOG: u8 = 0xFF;

/// Largest count or period log with a defined value
pub const MAX_LOG: u8 = 0x11;

/// `2^(log-1)`, or zero for a zero log
pub fn log_to_value(log: u8) -> Option<u32> {
    match log {
        0 => Some(0),
        1..=MAX_LOG => Some(1u32 << (log - 1)),
        _ => None,
    }
}

/// Smallest log whose value is not greater than `value`
pub fn value_to_log(value: u32) -> u8 {
    if value == 0 {
        0
    } else {
        (32 - value.leading_zeros()) as u8
    }
}

fn period_from_log(period_log: u8) -> Result<Duration, TransportError> {
    log_to_value(period_log)
        .map(|secs| Duration::from_secs(secs as u64))
        .ok_or(TransportError::Wire(WireError::Malformed("heartbeat period log")))
}

/// A received Heartbeat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Heartbeat {
    /// Publishing node
    pub source: Address,
    /// Destination it was published to
    pub destination: Address,
    /// TTL it was sent with
    pub init_ttl: u8,
    /// TTL it arrived with
    pub received_ttl: u8,
    /// Features active on the publisher
    pub features: Features,
}

impl Heartbeat {
    /// Interpret a Heartbeat control message
    pub fn from_control(message: &ControlMessage) -> Result<Self, WireError> {
        let payload = HeartbeatPayload::decode(&message.parameters)?;
        Ok(Self {
            source: message.source,
            destination: message.destination,
            init_ttl: payload.init_ttl,
            received_ttl: message.ttl,
            features: payload.features,
        })
    }

    /// Number of hops the message travelled
    pub fn hops(&self) -> u8 {
        self.init_ttl.saturating_sub(self.received_ttl).saturating_add(1)
    }
}

/// Heartbeat publication state of the local node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatPublication {
    /// Where Heartbeats are published
    pub destination: Address,
    /// Publication period log
    pub period_log: u8,
    /// TTL of published Heartbeats
    pub ttl: u8,
    /// Network key to publish on
    pub network_key_index: u16,
    remaining: Option<u32>,
}

impl HeartbeatPublication {
    /// Create a publication; `count_log` 0xFF publishes indefinitely
    pub fn new(
        destination: Address,
        count_log: u8,
        period_log: u8,
        ttl: u8,
        network_key_index: u16,
    ) -> Result<Self, TransportError> {
        if destination.is_virtual() {
            return Err(TransportError::InvalidAddress(destination));
        }
        period_from_log(period_log)?;
        let remaining = if count_log == INDEFINITE_COUNT_LOG {
            None
        } else {
            Some(log_to_value(count_log).ok_or(TransportError::Wire(WireError::Malformed(
                "heartbeat count log",
            )))?)
        };
        Ok(Self {
            destination,
            period_log,
            ttl: ttl & 0x7F,
            network_key_index,
            remaining,
        })
    }

    /// Publication period, `None` when periodic publication is off
    pub fn period(&self) -> Option<Duration> {
        period_from_log(self.period_log)
            .ok()
            .filter(|period| !period.is_zero())
    }

    /// Heartbeats left to publish, `None` when indefinite
    pub fn remaining(&self) -> Option<u32> {
        self.remaining
    }

    /// Remaining count as a log
    pub fn count_log(&self) -> u8 {
        match self.remaining {
            None => INDEFINITE_COUNT_LOG,
            Some(count) => value_to_log(count),
        }
    }

    /// Whether another Heartbeat is due
    pub fn is_active(&self) -> bool {
        !self.destination.is_unassigned() && self.period().is_some() && self.remaining != Some(0)
    }

    /// Count one published Heartbeat; returns whether publishing continues
    pub fn published(&mut self) -> bool {
        if let Some(count) = self.remaining.as_mut() {
            *count = count.saturating_sub(1);
        }
        self.is_active()
    }
}

/// Heartbeat subscription state of the local node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatSubscription {
    /// Accepted publisher
    pub source: Address,
    /// Accepted destination
    pub destination: Address,
    period: Duration,
    started: Instant,
    /// Heartbeats counted so far, saturating at 0xFFFF
    pub count: u16,
    /// Fewest hops seen, 0x7F before any Heartbeat
    pub min_hops: u8,
    /// Most hops seen
    pub max_hops: u8,
}

impl HeartbeatSubscription {
    /// Subscribe for `2^(period_log-1)` seconds starting now
    pub fn new(source: Address, destination: Address, period_log: u8) -> Result<Self, TransportError> {
        if !source.is_unicast() {
            return Err(TransportError::InvalidAddress(source));
        }
        if destination.is_virtual() || destination.is_unassigned() {
            return Err(TransportError::InvalidAddress(destination));
        }
        Ok(Self {
            source,
            destination,
            period: period_from_log(period_log)?,
            started: Instant::now(),
            count: 0,
            min_hops: 0x7F,
            max_hops: 0,
        })
    }

    /// Time left in the subscription period
    pub fn remaining_period(&self, now: Instant) -> Duration {
        (self.started + self.period).saturating_duration_since(now)
    }

    /// Whether the subscription period is still running
    pub fn is_active(&self, now: Instant) -> bool {
        !self.remaining_period(now).is_zero()
    }

    /// Count `heartbeat` if it matches; returns whether it was counted
    pub fn record(&mut self, heartbeat: &Heartbeat, now: Instant) -> bool {
        if !self.is_active(now)
            || heartbeat.source != self.source
            || heartbeat.destination != self.destination
        {
            return false;
        }
        let hops = heartbeat.hops();
        self.count = self.count.saturating_add(1);
        self.min_hops = self.min_hops.min(hops);
        self.max_hops = self.max_hops.max(hops);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn heartbeat(source: u16, init_ttl: u8, received_ttl: u8) -> Heartbeat {
        Heartbeat {
            source: Address(source),
            destination: Address(0x0001),
            init_ttl,
            received_ttl,
            features: Features::RELAY,
        }
    }

    #[test]
    fn test_log_encoding() {
        assert_eq!(log_to_value(0), Some(0));
        assert_eq!(log_to_value(1), Some(1));
        assert_eq!(log_to_value(0x11), Some(0x1_0000));
        assert_eq!(log_to_value(0x12), None);
        assert_eq!(value_to_log(0), 0);
        assert_eq!(value_to_log(1), 1);
        assert_eq!(value_to_log(5), 3);
        assert_eq!(value_to_log(0xFFFF), 0x10);
    }

    #[test]
    fn test_heartbeat_from_control() {
        let message = ControlMessage {
            source: Address(0x0005),
            destination: Address(0x0001),
            opcode: 0x0A,
            parameters: Bytes::from_static(&[0x07, 0x00, 0x01]),
            sequence: 1,
            iv_index: 0,
            network_key_index: 0,
            ttl: 4,
        };
        let hb = Heartbeat::from_control(&message).unwrap();
        assert_eq!(hb.init_ttl, 7);
        assert_eq!(hb.features, Features::RELAY);
        assert_eq!(hb.hops(), 4);
    }

    #[test]
    fn test_publication_countdown() {
        let mut publication = HeartbeatPublication::new(Address(0xC000), 2, 1, 5, 0).unwrap();
        assert_eq!(publication.remaining(), Some(2));
        assert_eq!(publication.period(), Some(Duration::from_secs(1)));
        assert!(publication.is_active());
        assert!(publication.published());
        assert!(!publication.published());
        assert!(!publication.published());
        assert_eq!(publication.remaining(), Some(0));

        let mut forever = HeartbeatPublication::new(Address(0xC000), 0xFF, 3, 5, 0).unwrap();
        for _ in 0..100 {
            assert!(forever.published());
        }
        assert_eq!(forever.count_log(), INDEFINITE_COUNT_LOG);

        let off = HeartbeatPublication::new(Address(0xC000), 4, 0, 5, 0).unwrap();
        assert!(!off.is_active());
        assert!(HeartbeatPublication::new(Address(0xC000), 0x20, 1, 5, 0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_counts_and_expires() {
        let mut sub = HeartbeatSubscription::new(Address(0x0005), Address(0x0001), 2).unwrap();
        let now = Instant::now();
        assert!(sub.record(&heartbeat(0x0005, 7, 4), now));
        assert!(sub.record(&heartbeat(0x0005, 7, 7), now));
        assert!(!sub.record(&heartbeat(0x0006, 7, 7), now));
        assert_eq!(sub.count, 2);
        assert_eq!(sub.min_hops, 1);
        assert_eq!(sub.max_hops, 4);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!sub.is_active(Instant::now()));
        assert!(!sub.record(&heartbeat(0x0005, 7, 4), Instant::now()));
        assert_eq!(sub.count, 2);
    }
}
