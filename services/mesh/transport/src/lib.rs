//! Bluetooth Mesh network, lower transport and upper transport layers.
//!
//! This crate turns an access payload plus a key set into encrypted,
//! optionally segmented Network PDUs, and turns received Network PDUs back
//! into decrypted access payloads.
//!
//! ## Layers
//!
//! - **Network**: Network PDU and beacon codecs, duplicate filtering
//! - **Lower transport**: segmentation, reassembly, Segment Acknowledgments
//!   and retransmission, one segmented message in flight per destination
//! - **Upper transport**: access payload encryption and key selection,
//!   outbound queuing, Heartbeat publication and subscription
//!
//! The layers are plain state machines. A [`NetworkManager`] owns them on a
//! single task and is the only place that talks to the [`Bearer`], the
//! [`AccessHandler`] and the [`SequenceAuthority`](mesh_storage::SequenceAuthority).
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_transport::{
//!     AccessHandler, Bearer, IvIndex, KeySet, MeshNetwork, NetworkKey, NetworkManager,
//!     TransportConfig, UpperTransportPdu,
//! };
//! use mesh_storage::MemorySequenceStore;
//! use mesh_wire::Address;
//! use std::sync::Arc;
//!
//! #[derive(Debug)]
//! struct Radio;
//!
//! #[async_trait::async_trait]
//! impl Bearer for Radio {
//!     async fn transmit(&self, pdu: bytes::Bytes) -> anyhow::Result<()> {
//!         println!("tx {:02x?}", &pdu[..]);
//!         Ok(())
//!     }
//! }
//!
//! #[derive(Debug)]
//! struct Printer;
//!
//! impl AccessHandler for Printer {
//!     fn handle(&self, pdu: &UpperTransportPdu, _keys: &KeySet) {
//!         println!("rx {:02x?} from {}", &pdu.access_pdu[..], pdu.source);
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut network = MeshNetwork::new(Address(0x0001), IvIndex::new(0, false));
//! network.network_keys.push(NetworkKey::new(0, [0x7D; 16])?);
//!
//! let manager = NetworkManager::start(
//!     network,
//!     TransportConfig::default(),
//!     Arc::new(Radio),
//!     Arc::new(Printer),
//!     Arc::new(MemorySequenceStore::default()),
//! );
//! manager.receive(bytes::Bytes::from_static(&[0x68; 20]))?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bearer;
pub mod config;
pub mod error;
pub mod keys;
pub mod lower;
pub mod manager;
pub mod message;
pub mod network;
pub mod queue;
pub mod scheduler;
pub mod upper;

// Re-export main types
pub use bearer::{AccessHandler, Bearer};
pub use config::TransportConfig;
pub use error::TransportError;
pub use keys::{
    ApplicationKey, Group, IvIndex, KeyRefreshPhase, KeySet, MeshAddress, MeshNetwork, NetworkKey,
    NetworkKeyDerivatives, Node, Security, MAX_KEY_INDEX,
};
pub use lower::LowerTransportLayer;
pub use manager::{BeaconKind, NetworkManager};
pub use message::{
    AccessMessage, AccessRequest, ControlMessage, ControlRequest, MessageHandle, OutboundPdu,
    TransportEvent, UpperTransportPdu, MAX_UPPER_TRANSPORT_PDU_SIZE,
};
pub use network::beacon::{Beacon, PrivateBeacon, SecureNetworkBeacon};
pub use network::pdu::NetworkPdu;
pub use network::NetworkLayer;
pub use queue::DestinationQueues;
pub use scheduler::{Scheduler, TimerEvent, TimerToken};
pub use upper::heartbeat::{Heartbeat, HeartbeatPublication, HeartbeatSubscription};
pub use upper::UpperTransportLayer;
