//! 16-bit mesh addresses.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 16-bit mesh address
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub u16);

impl Address {
    /// The unassigned address
    pub const UNASSIGNED: Address = Address(0x0000);
    /// All-proxies fixed group
    pub const ALL_PROXIES: Address = Address(0xFFFC);
    /// All-friends fixed group
    pub const ALL_FRIENDS: Address = Address(0xFFFD);
    /// All-relays fixed group
    pub const ALL_RELAYS: Address = Address(0xFFFE);
    /// All-nodes fixed group
    pub const ALL_NODES: Address = Address(0xFFFF);

    /// Address 0x0000
    pub fn is_unassigned(self) -> bool {
        self.0 == 0
    }

    /// 0x0001..=0x7FFF
    pub fn is_unicast(self) -> bool {
        self.0 & 0x8000 == 0 && self.0 != 0
    }

    /// 0x8000..=0xBFFF
    pub fn is_virtual(self) -> bool {
        self.0 & 0xC000 == 0x8000
    }

    /// 0xC000..=0xFFFF
    pub fn is_group(self) -> bool {
        self.0 & 0xC000 == 0xC000
    }

    /// Fixed group addresses defined by the mesh profile
    pub fn is_fixed_group(self) -> bool {
        self.0 >= Self::ALL_PROXIES.0
    }

    /// Big-endian bytes as they appear on the wire
    pub fn to_be_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    /// Read a big-endian address
    pub fn from_be_bytes(bytes: [u8; 2]) -> Self {
        Address(u16::from_be_bytes(bytes))
    }
}

impl From<u16> for Address {
    fn from(value: u16) -> Self {
        Address(value)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_classes() {
        assert!(Address::UNASSIGNED.is_unassigned());
        assert!(!Address::UNASSIGNED.is_unicast());
        assert!(Address(0x0001).is_unicast());
        assert!(Address(0x7FFF).is_unicast());
        assert!(Address(0x8000).is_virtual());
        assert!(Address(0xBFFF).is_virtual());
        assert!(Address(0xC000).is_group());
        assert!(Address::ALL_NODES.is_group());
        assert!(Address::ALL_NODES.is_fixed_group());
        assert!(!Address(0xC001).is_fixed_group());
    }

    #[test]
    fn test_display() {
        assert_eq!(Address(0x1201).to_string(), "1201");
    }
}
