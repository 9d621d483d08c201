//! AES building blocks and the mesh key derivation functions.

use crate::Key;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

/// AES-128 encryption of a single block
pub fn aes_ecb(key: &Key, block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut out);
    let mut result = [0u8; 16];
    result.copy_from_slice(&out);
    result
}

/// AES-CMAC over `data`
pub fn aes_cmac(key: &Key, data: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key));
    mac.update(data);
    let tag = mac.finalize().into_bytes();
    let mut result = [0u8; 16];
    result.copy_from_slice(&tag);
    result
}

/// Salt generation: CMAC with the all-zero key
pub fn s1(m: &[u8]) -> Key {
    aes_cmac(&[0u8; 16], m)
}

/// Generic key derivation
pub fn k1(n: &[u8], salt: &Key, p: &[u8]) -> Key {
    let t = aes_cmac(salt, n);
    aes_cmac(&t, p)
}

/// Keys derived from a network key by `k2`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkDerivatives {
    /// 7-bit network identifier
    pub nid: u8,
    /// Network PDU encryption key
    pub encryption_key: Key,
    /// Network header privacy key
    pub privacy_key: Key,
}

/// Network key material derivation
///
/// `p` is `0x00` for the master credentials.
pub fn k2(n: &Key, p: &[u8]) -> NetworkDerivatives {
    let salt = s1(b"smk2");
    let t = aes_cmac(&salt, n);

    let mut input = Vec::with_capacity(16 + p.len() + 1);
    input.extend_from_slice(p);
    input.push(0x01);
    let t1 = aes_cmac(&t, &input);

    input.clear();
    input.extend_from_slice(&t1);
    input.extend_from_slice(p);
    input.push(0x02);
    let t2 = aes_cmac(&t, &input);

    input.clear();
    input.extend_from_slice(&t2);
    input.extend_from_slice(p);
    input.push(0x03);
    let t3 = aes_cmac(&t, &input);

    NetworkDerivatives {
        nid: t1[15] & 0x7F,
        encryption_key: t2,
        privacy_key: t3,
    }
}

/// Network ID derivation
pub fn k3(n: &Key) -> [u8; 8] {
    let salt = s1(b"smk3");
    let t = aes_cmac(&salt, n);
    let out = aes_cmac(&t, b"id64\x01");
    let mut id = [0u8; 8];
    id.copy_from_slice(&out[8..]);
    id
}

/// Application key identifier derivation
pub fn k4(n: &Key) -> u8 {
    let salt = s1(b"smk4");
    let t = aes_cmac(&salt, n);
    let out = aes_cmac(&t, b"id6\x01");
    out[15] & 0x3F
}

/// Virtual address for a 128-bit Label UUID
pub fn virtual_address(label: &[u8; 16]) -> u16 {
    let salt = s1(b"vtad");
    let hash = aes_cmac(&salt, label);
    0x8000 | (u16::from_be_bytes([hash[14], hash[15]]) & 0x3FFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Key {
        let mut k = [0u8; 16];
        k.copy_from_slice(&hex::decode(s).unwrap());
        k
    }

    #[test]
    fn test_s1() {
        assert_eq!(s1(b"test"), key("b73cefbd641ef2ea598c2b6efb62f79c"));
    }

    #[test]
    fn test_k1() {
        let n = key("3216d1509884b533248541792b877f98");
        let salt = key("2ba14ffa0df84a2831938d57d276cab4");
        let p = hex::decode("5a09d60797eeb4478aada59db3352a0d").unwrap();
        assert_eq!(k1(&n, &salt, &p), key("f6ed15a8934afbe7d83e8dcb57fcf5d7"));
    }

    #[test]
    fn test_k2_master() {
        let derived = k2(&key("f7a2a44f8e8a8029064f173ddc1e2b00"), &[0x00]);
        assert_eq!(derived.nid, 0x7F);
        assert_eq!(derived.encryption_key, key("9f589181a0f50de73c8070c7a6d27f46"));
        assert_eq!(derived.privacy_key, key("4c715bd4a64b938f99b453351653124f"));
    }

    #[test]
    fn test_k2_sample_network_key() {
        let derived = k2(&key("7dd7364cd842ad18c17c2b820c84c3d6"), &[0x00]);
        assert_eq!(derived.nid, 0x68);
        assert_eq!(derived.encryption_key, key("0953fa93e7caac9638f58820220a398e"));
        assert_eq!(derived.privacy_key, key("8b84eedec100067d670971dd2aa700cf"));
    }

    #[test]
    fn test_k3() {
        let id = k3(&key("f7a2a44f8e8a8029064f173ddc1e2b00"));
        assert_eq!(id.to_vec(), hex::decode("ff046958233db014").unwrap());
    }

    #[test]
    fn test_k4() {
        assert_eq!(k4(&key("3216d1509884b533248541792b877f98")), 0x38);
        assert_eq!(k4(&key("63964771734fbd76e3b40519d1d94a48")), 0x26);
    }

    #[test]
    fn test_virtual_address_range() {
        let address = virtual_address(&[0x42; 16]);
        assert_eq!(address & 0xC000, 0x8000);
        assert_eq!(address, virtual_address(&[0x42; 16]));
    }
}
