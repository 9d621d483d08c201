//! Bit-exact Bluetooth Mesh packet layouts.
//!
//! This crate holds the pure packing and unpacking of the structures that the
//! network and transport layers exchange. Nothing here touches key material:
//! obfuscation, encryption and authentication live in `mesh-crypto`, and the
//! layers that combine both live in `mesh-transport`.
//!
//! ## Network PDU
//!
//! ```text
//! +-----------+------------------------------+-------------------------+-------------+
//! | IVI | NID | CTL|TTL  SEQ(3)  SRC(2)      | DST(2)  TransportPDU    | NetMIC      |
//! | 1b  | 7b  | obfuscated (6 bytes)         | encrypted (3..18 bytes) | 4 or 8      |
//! +-----------+------------------------------+-------------------------+-------------+
//! ```
//!
//! ## Lower transport headers
//!
//! ```text
//! unsegmented access   [SEG=0|AKF|AID(6)] upper transport PDU (5..15)
//! segmented access     [SEG=1|AKF|AID(6)][SZMIC|SeqZero hi 7][SeqZero lo 6|SegO hi 2]
//!                      [SegO lo 3|SegN 5] segment (1..12)
//! unsegmented control  [SEG=0|Opcode(7)] parameters (0..11)
//! segmented control    [SEG=1|Opcode(7)][RFU|SeqZero hi 7][SeqZero lo 6|SegO hi 2]
//!                      [SegO lo 3|SegN 5] segment (1..8)
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod access;
pub mod address;
pub mod beacon;
pub mod control;
pub mod error;
pub mod lower;
pub mod network;

// Re-export main types
pub use access::{access_opcode, Opcode};
pub use address::Address;
pub use beacon::{
    BeaconFlags, BeaconType, OobInformation, PrivateBeaconFields, SecureNetworkBeaconFields,
    UnprovisionedDeviceBeacon, PRIVATE_BEACON_SIZE, SECURE_NETWORK_BEACON_SIZE,
};
pub use control::{ControlOpcode, Features, HeartbeatPayload, SegmentAck};
pub use error::WireError;
pub use lower::{
    LowerTransportPdu, SegmentHeader, SegmentedAccess, SegmentedControl, UnsegmentedAccess,
    UnsegmentedControl, MAX_ACCESS_SEGMENT_SIZE, MAX_CONTROL_SEGMENT_SIZE, MAX_SEGMENTS,
    MAX_UNSEGMENTED_ACCESS_SIZE, MAX_UNSEGMENTED_CONTROL_SIZE, SEQ_ZERO_MASK,
};
pub use network::{
    IviNid, NetworkHeader, PduType, CONTROL_NETWORK_PDU_MIN_SIZE, NETWORK_PDU_MIN_SIZE,
    OBFUSCATED_HEADER_SIZE, PRIVACY_RANDOM_SIZE,
};
