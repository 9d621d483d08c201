//! Cryptographic toolbox for the Bluetooth Mesh network and transport layers.
//!
//! Everything here is a pure function of its inputs. Key selection, IV Index
//! handling and packet layout belong to the callers; this crate only provides
//! the primitives and the exact byte layouts they are fed with.
//!
//! - AES-ECB and AES-CMAC building blocks, `s1` and the `k1`..`k4` derivations
//! - AES-CCM with 32-bit or 64-bit MIC
//! - Network, application and device nonces
//! - Network header obfuscation
//! - Secure Network beacon authentication and Private beacon sealing

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod beacon;
pub mod encryption;
pub mod error;
pub mod nonce;
pub mod primitives;
pub mod privacy;

/// A 128-bit key
pub type Key = [u8; 16];

/// A 13-byte CCM nonce
pub type Nonce = [u8; 13];

// Re-export main types
pub use beacon::{
    beacon_key, private_beacon_key, private_beacon_open, private_beacon_seal,
    secure_beacon_authentication,
};
pub use encryption::{decrypt, encrypt, MicSize};
pub use error::CryptoError;
pub use nonce::{application_nonce, device_nonce, network_nonce};
pub use primitives::{aes_cmac, aes_ecb, k1, k2, k3, k4, s1, virtual_address, NetworkDerivatives};
pub use privacy::{obfuscate, privacy_random, PRIVACY_RANDOM_SIZE};
