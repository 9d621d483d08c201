//! AES-CCM with the two MIC sizes the mesh uses.

use crate::error::CryptoError;
use crate::{Key, Nonce};
use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{AeadInPlace, KeyInit};
use ccm::consts::{U13, U4, U8};
use ccm::Ccm;

type AesCcm32 = Ccm<Aes128, U4, U13>;
type AesCcm64 = Ccm<Aes128, U8, U13>;

/// Size of the message integrity check appended by CCM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MicSize {
    /// 32-bit MIC
    Small,
    /// 64-bit MIC
    Large,
}

impl MicSize {
    /// MIC length in bytes
    pub fn size(self) -> usize {
        match self {
            MicSize::Small => 4,
            MicSize::Large => 8,
        }
    }

    /// The SZMIC / ASZMIC bit
    pub fn szmic(self) -> bool {
        matches!(self, MicSize::Large)
    }

    /// Size selected by a SZMIC / ASZMIC bit
    pub fn from_szmic(szmic: bool) -> Self {
        if szmic {
            MicSize::Large
        } else {
            MicSize::Small
        }
    }
}

/// Encrypt `plaintext` and append the MIC
pub fn encrypt(
    key: &Key,
    nonce: &Nonce,
    aad: &[u8],
    plaintext: &[u8],
    mic: MicSize,
) -> Result<Vec<u8>, CryptoError> {
    let mut buf = Vec::with_capacity(plaintext.len() + mic.size());
    buf.extend_from_slice(plaintext);
    let key = GenericArray::from_slice(key);
    let nonce = GenericArray::from_slice(nonce);

    let tag = match mic {
        MicSize::Small => AesCcm32::new(key)
            .encrypt_in_place_detached(nonce, aad, &mut buf)
            .map(|tag| tag.to_vec()),
        MicSize::Large => AesCcm64::new(key)
            .encrypt_in_place_detached(nonce, aad, &mut buf)
            .map(|tag| tag.to_vec()),
    }
    .map_err(|_| CryptoError::Encryption)?;

    buf.extend_from_slice(&tag);
    Ok(buf)
}

/// Decrypt `data` whose trailing bytes are the MIC
pub fn decrypt(
    key: &Key,
    nonce: &Nonce,
    aad: &[u8],
    data: &[u8],
    mic: MicSize,
) -> Result<Vec<u8>, CryptoError> {
    if data.len() < mic.size() {
        return Err(CryptoError::Truncated {
            mic: mic.size(),
            got: data.len(),
        });
    }
    let (ciphertext, tag) = data.split_at(data.len() - mic.size());
    let mut buf = ciphertext.to_vec();
    let key = GenericArray::from_slice(key);
    let nonce = GenericArray::from_slice(nonce);

    match mic {
        MicSize::Small => AesCcm32::new(key).decrypt_in_place_detached(
            nonce,
            aad,
            &mut buf,
            GenericArray::from_slice(tag),
        ),
        MicSize::Large => AesCcm64::new(key).decrypt_in_place_detached(
            nonce,
            aad,
            &mut buf,
            GenericArray::from_slice(tag),
        ),
    }
    .map_err(|_| CryptoError::Authentication)?;

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mic_sizes() {
        let key = [0x11; 16];
        let nonce = [0x22; 13];
        let small = encrypt(&key, &nonce, &[], b"hello", MicSize::Small).unwrap();
        let large = encrypt(&key, &nonce, &[], b"hello", MicSize::Large).unwrap();
        assert_eq!(small.len(), 9);
        assert_eq!(large.len(), 13);
        assert_eq!(small[..5], large[..5]);
        assert_eq!(decrypt(&key, &nonce, &[], &large, MicSize::Large).unwrap(), b"hello");
    }

    #[test]
    fn test_tampered_or_wrong_aad() {
        let key = [0x11; 16];
        let nonce = [0x22; 13];
        let mut sealed = encrypt(&key, &nonce, b"label", b"payload", MicSize::Small).unwrap();
        assert_eq!(
            decrypt(&key, &nonce, b"other", &sealed, MicSize::Small),
            Err(CryptoError::Authentication)
        );
        sealed[0] ^= 0x01;
        assert_eq!(
            decrypt(&key, &nonce, b"label", &sealed, MicSize::Small),
            Err(CryptoError::Authentication)
        );
        assert!(matches!(
            decrypt(&key, &nonce, &[], &[0x00; 3], MicSize::Small),
            Err(CryptoError::Truncated { mic: 4, got: 3 })
        ));
    }
}
