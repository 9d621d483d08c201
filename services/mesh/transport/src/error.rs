//! Transport error types.

use mesh_crypto::CryptoError;
use mesh_storage::StorageError;
use mesh_wire::{Address, WireError};
use thiserror::Error;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The message was cancelled before it was fully acknowledged
    #[error("message cancelled")]
    Cancelled,

    /// Segment acknowledgments never completed
    #[error("timed out waiting for segment acknowledgment")]
    Timeout,

    /// The receiver answered with an empty block ack
    #[error("receiver busy")]
    Busy,

    /// No network key with this index
    #[error("unknown network key index {0}")]
    UnknownNetworkKey(u16),

    /// Key index outside 0..=4095
    #[error("invalid key index {0}")]
    InvalidKeyIndex(u16),

    /// Node has no device key
    #[error("no device key for node {0}")]
    MissingDeviceKey(Address),

    /// Payload does not fit
    #[error("payload too long: {0} bytes")]
    PayloadTooLong(usize),

    /// Address not valid in this position
    #[error("invalid address {0}")]
    InvalidAddress(Address),

    /// Sequence authority failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Packet layout failure
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Encryption failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The bearer could not transmit
    #[error("bearer error: {0}")]
    Bearer(String),

    /// The manager task is gone
    #[error("network manager stopped")]
    ManagerStopped,
}
