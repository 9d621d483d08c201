//! Transport layer timing and sizing.

use mesh_wire::Features;
use std::time::Duration;

/// Transport layer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// TTL used when a message does not specify one
    pub default_ttl: u8,
    /// Number of raw Network PDUs remembered for duplicate detection
    pub network_cache_size: usize,
    /// How long an incomplete segmented message is kept
    pub incomplete_timeout: Duration,
    /// Segment Acknowledgment delay, fixed part
    pub ack_delay_base: Duration,
    /// Segment Acknowledgment delay, added per unit of TTL
    pub ack_delay_per_ttl: Duration,
    /// Segment retransmission interval, fixed part
    pub retransmit_base: Duration,
    /// Segment retransmission interval, added per unit of TTL
    pub retransmit_per_ttl: Duration,
    /// Retransmissions of unacknowledged segments before giving up
    pub retransmit_limit: u8,
    /// Features advertised in Heartbeat messages
    pub features: Features,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default_ttl: 5,
            network_cache_size: 100,
            incomplete_timeout: Duration::from_secs(10),
            ack_delay_base: Duration::from_millis(150),
            ack_delay_per_ttl: Duration::from_millis(50),
            retransmit_base: Duration::from_millis(200),
            retransmit_per_ttl: Duration::from_millis(50),
            retransmit_limit: 4,
            features: Features::empty(),
        }
    }
}

impl TransportConfig {
    /// Delay before acknowledging segments that arrived with `ttl`
    pub fn ack_delay(&self, ttl: u8) -> Duration {
        self.ack_delay_base + self.ack_delay_per_ttl * ttl as u32
    }

    /// Interval between retransmissions of segments sent with `ttl`
    pub fn retransmit_interval(&self, ttl: u8) -> Duration {
        self.retransmit_base + self.retransmit_per_ttl * ttl as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays() {
        let config = TransportConfig::default();
        assert_eq!(config.ack_delay(0), Duration::from_millis(150));
        assert_eq!(config.ack_delay(5), Duration::from_millis(400));
        assert_eq!(config.retransmit_interval(5), Duration::from_millis(450));
    }
}
