//! CCM nonce layouts.

use crate::Nonce;

const NETWORK_NONCE: u8 = 0x00;
const APPLICATION_NONCE: u8 = 0x01;
const DEVICE_NONCE: u8 = 0x02;

/// Network nonce: `0x00 | CTL,TTL | SEQ | SRC | 0x0000 | IV Index`
pub fn network_nonce(ctl_ttl: u8, sequence: u32, source: u16, iv_index: u32) -> Nonce {
    let mut nonce = [0u8; 13];
    nonce[0] = NETWORK_NONCE;
    nonce[1] = ctl_ttl;
    nonce[2..5].copy_from_slice(&sequence.to_be_bytes()[1..]);
    nonce[5..7].copy_from_slice(&source.to_be_bytes());
    nonce[9..13].copy_from_slice(&iv_index.to_be_bytes());
    nonce
}

fn transport_nonce(
    kind: u8,
    aszmic: bool,
    sequence: u32,
    source: u16,
    destination: u16,
    iv_index: u32,
) -> Nonce {
    let mut nonce = [0u8; 13];
    nonce[0] = kind;
    nonce[1] = (aszmic as u8) << 7;
    nonce[2..5].copy_from_slice(&sequence.to_be_bytes()[1..]);
    nonce[5..7].copy_from_slice(&source.to_be_bytes());
    nonce[7..9].copy_from_slice(&destination.to_be_bytes());
    nonce[9..13].copy_from_slice(&iv_index.to_be_bytes());
    nonce
}

/// Application nonce, for payloads secured with an application key
pub fn application_nonce(
    aszmic: bool,
    sequence: u32,
    source: u16,
    destination: u16,
    iv_index: u32,
) -> Nonce {
    transport_nonce(APPLICATION_NONCE, aszmic, sequence, source, destination, iv_index)
}

/// Device nonce, for payloads secured with a device key
pub fn device_nonce(
    aszmic: bool,
    sequence: u32,
    source: u16,
    destination: u16,
    iv_index: u32,
) -> Nonce {
    transport_nonce(DEVICE_NONCE, aszmic, sequence, source, destination, iv_index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_nonce_sample() {
        let nonce = network_nonce(0x80, 0x000001, 0x1201, 0x1234_5678);
        assert_eq!(nonce.to_vec(), hex::decode("00800000011201000012345678").unwrap());
    }

    #[test]
    fn test_transport_nonce_layout() {
        let nonce = application_nonce(true, 0x07080B, 0x1234, 0x9736, 0x1234_5677);
        assert_eq!(nonce.to_vec(), hex::decode("018007080b1234973612345677").unwrap());

        let nonce = device_nonce(false, 0x000006, 0x0003, 0x1201, 0x1234_5678);
        assert_eq!(nonce.to_vec(), hex::decode("02000000060003120112345678").unwrap());
    }
}
