//! Network header obfuscation.
//!
//! The six header bytes after IVI/NID are XORed with the first six bytes of
//! `PECB = e(PrivacyKey, 0x0000000000 | IV Index | PrivacyRandom)`, where the
//! privacy random is the first seven bytes of the encrypted part of the PDU.
//! Obfuscation is its own inverse.

use crate::primitives::aes_ecb;
use crate::Key;

/// Bytes of ciphertext used as privacy random
pub const PRIVACY_RANDOM_SIZE: usize = 7;

/// Take the privacy random from the start of `EncDST || EncTransportPDU || NetMIC`
pub fn privacy_random(encrypted: &[u8]) -> Option<[u8; PRIVACY_RANDOM_SIZE]> {
    let mut random = [0u8; PRIVACY_RANDOM_SIZE];
    random.copy_from_slice(encrypted.get(..PRIVACY_RANDOM_SIZE)?);
    Some(random)
}

/// Obfuscate or deobfuscate the `CTL,TTL | SEQ | SRC` header
pub fn obfuscate(
    privacy_key: &Key,
    iv_index: u32,
    random: &[u8; PRIVACY_RANDOM_SIZE],
    header: &[u8; 6],
) -> [u8; 6] {
    let mut block = [0u8; 16];
    block[5..9].copy_from_slice(&iv_index.to_be_bytes());
    block[9..16].copy_from_slice(random);
    let pecb = aes_ecb(privacy_key, &block);

    let mut out = [0u8; 6];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = header[i] ^ pecb[i];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_obfuscation() {
        let mut privacy_key = [0u8; 16];
        privacy_key.copy_from_slice(&hex::decode("8b84eedec100067d670971dd2aa700cf").unwrap());
        let encrypted = hex::decode("b5e5bfdacbaf6cb7fb6bff871f035444ce83a670df").unwrap();
        let random = privacy_random(&encrypted).unwrap();

        let header = [0x80, 0x00, 0x00, 0x01, 0x12, 0x01];
        let obfuscated = obfuscate(&privacy_key, 0x1234_5678, &random, &header);
        assert_eq!(obfuscated.to_vec(), hex::decode("eca487516765").unwrap());
        assert_eq!(obfuscate(&privacy_key, 0x1234_5678, &random, &obfuscated), header);
    }

    #[test]
    fn test_privacy_random_too_short() {
        assert!(privacy_random(&[0u8; 6]).is_none());
    }
}
