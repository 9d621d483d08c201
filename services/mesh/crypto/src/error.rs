//! Crypto error types.

use thiserror::Error;

/// Crypto errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// MIC check failed
    #[error("authentication failed")]
    Authentication,

    /// Input shorter than the MIC it should carry
    #[error("input too short for {mic}-byte MIC: {got} bytes")]
    Truncated {
        /// MIC length
        mic: usize,
        /// Input length
        got: usize,
    },

    /// Plaintext or associated data too long for CCM
    #[error("CCM encryption failed")]
    Encryption,
}
