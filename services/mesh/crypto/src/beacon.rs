//! Beacon keys and authentication.

use crate::encryption::{decrypt, encrypt, MicSize};
use crate::error::CryptoError;
use crate::primitives::{aes_cmac, k1, s1};
use crate::Key;

const ID128: &[u8] = b"id128\x01";

/// Beacon key used to authenticate Secure Network beacons
pub fn beacon_key(network_key: &Key) -> Key {
    k1(network_key, &s1(b"nkbk"), ID128)
}

/// Private beacon key used to seal Private beacons
pub fn private_beacon_key(network_key: &Key) -> Key {
    k1(network_key, &s1(b"nkpk"), ID128)
}

/// Authentication value of a Secure Network beacon over `flags | NetworkID | IV Index`
pub fn secure_beacon_authentication(beacon_key: &Key, authenticated: &[u8; 13]) -> [u8; 8] {
    let mac = aes_cmac(beacon_key, authenticated);
    let mut auth = [0u8; 8];
    auth.copy_from_slice(&mac[..8]);
    auth
}

/// Seal `flags | IV Index` of a Private beacon
///
/// Returns the obfuscated data and the authentication tag.
pub fn private_beacon_seal(
    private_beacon_key: &Key,
    random: &[u8; 13],
    flags: u8,
    iv_index: u32,
) -> Result<([u8; 5], [u8; 8]), CryptoError> {
    let mut plaintext = [0u8; 5];
    plaintext[0] = flags;
    plaintext[1..].copy_from_slice(&iv_index.to_be_bytes());

    let sealed = encrypt(private_beacon_key, random, &[], &plaintext, MicSize::Large)?;
    let mut obfuscated = [0u8; 5];
    obfuscated.copy_from_slice(&sealed[..5]);
    let mut tag = [0u8; 8];
    tag.copy_from_slice(&sealed[5..]);
    Ok((obfuscated, tag))
}

/// Open a Private beacon, returning `(flags, IV Index)` when the tag matches
pub fn private_beacon_open(
    private_beacon_key: &Key,
    random: &[u8; 13],
    obfuscated: &[u8; 5],
    tag: &[u8; 8],
) -> Option<(u8, u32)> {
    let mut sealed = [0u8; 13];
    sealed[..5].copy_from_slice(obfuscated);
    sealed[5..].copy_from_slice(tag);
    let plain = decrypt(private_beacon_key, random, &[], &sealed, MicSize::Large).ok()?;
    Some((
        plain[0],
        u32::from_be_bytes([plain[1], plain[2], plain[3], plain[4]]),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_beacon_tag_changes_with_data() {
        let key = beacon_key(&[0x7D; 16]);
        let mut data = [0u8; 13];
        let auth = secure_beacon_authentication(&key, &data);
        data[12] ^= 0x01;
        assert_ne!(auth, secure_beacon_authentication(&key, &data));
    }

    #[test]
    fn test_private_beacon_seal_open() {
        let key = private_beacon_key(&[0x7D; 16]);
        let random = [0x43; 13];
        let (obfuscated, tag) = private_beacon_seal(&key, &random, 0x02, 0x1010_ABCD).unwrap();
        assert_eq!(
            private_beacon_open(&key, &random, &obfuscated, &tag),
            Some((0x02, 0x1010_ABCD))
        );

        let mut bad = tag;
        bad[7] ^= 0x01;
        assert_eq!(private_beacon_open(&key, &random, &obfuscated, &bad), None);
        assert_eq!(private_beacon_open(&beacon_key(&[0x7D; 16]), &random, &obfuscated, &tag), None);
    }

    #[test]
    fn test_beacon_keys_differ() {
        assert_ne!(beacon_key(&[1; 16]), private_beacon_key(&[1; 16]));
    }
}
