//! Collaborators at the edges of the stack.

use crate::error::TransportError;
use crate::keys::KeySet;
use crate::message::{MessageHandle, UpperTransportPdu};
use crate::network::beacon::Beacon;
use crate::upper::heartbeat::Heartbeat;
use async_trait::async_trait;
use bytes::Bytes;

/// Sends raw Network PDUs over the radio
///
/// Delivery is best effort; nothing waits for physical acknowledgment.
#[async_trait]
pub trait Bearer: Send + Sync + std::fmt::Debug {
    /// Transmit one Network PDU
    async fn transmit(&self, pdu: Bytes) -> anyhow::Result<()>;

    /// Transmit one beacon; bearers that tag PDU kinds override this
    async fn transmit_beacon(&self, beacon: Bytes) -> anyhow::Result<()> {
        self.transmit(beacon).await
    }
}

/// Receives decoded traffic and send outcomes
pub trait AccessHandler: Send + Sync + std::fmt::Debug {
    /// A decrypted access message and the keys that opened it
    fn handle(&self, pdu: &UpperTransportPdu, key_set: &KeySet);

    /// A beacon authenticated against one of the network keys
    fn beacon_received(&self, _beacon: &Beacon) {}

    /// A Heartbeat matched the active subscription
    fn heartbeat_received(&self, _heartbeat: &Heartbeat) {}

    /// An access message was sent, and acknowledged when segmented to a unicast
    fn message_sent(&self, _handle: &MessageHandle) {}

    /// An access message was not delivered
    fn message_failed(&self, _handle: &MessageHandle, _error: &TransportError) {}
}
