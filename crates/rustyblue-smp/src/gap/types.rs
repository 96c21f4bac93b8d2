use crate::gap::constants::*;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Central,
    Peripheral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressType {
    Public,
    Random,
    PublicIdentity,
    RandomIdentity,
}

impl AddressType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            PUBLIC_DEVICE_ADDRESS => Some(AddressType::Public),
            RANDOM_DEVICE_ADDRESS => Some(AddressType::Random),
            PUBLIC_IDENTITY_ADDRESS => Some(AddressType::PublicIdentity),
            RANDOM_IDENTITY_ADDRESS => Some(AddressType::RandomIdentity),
            _ => None,
        }
    }
}

impl From<AddressType> for u8 {
    fn from(value: AddressType) -> Self {
        match value {
            AddressType::Public => PUBLIC_DEVICE_ADDRESS,
            AddressType::Random => RANDOM_DEVICE_ADDRESS,
            AddressType::PublicIdentity => PUBLIC_IDENTITY_ADDRESS,
            AddressType::RandomIdentity => RANDOM_IDENTITY_ADDRESS,
        }
    }
}

/// Bluetooth device address, stored little-endian as it travels on air.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

/// An LE device address together with its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeAddress {
    pub addr_type: AddressType,
    pub address: BdAddr,
}

impl LeAddress {
    pub fn new(addr_type: AddressType, address: BdAddr) -> Self {
        Self { addr_type, address }
    }

    pub fn public(bytes: [u8; 6]) -> Self {
        Self::new(AddressType::Public, BdAddr::new(bytes))
    }

    pub fn random(bytes: [u8; 6]) -> Self {
        Self::new(AddressType::Random, BdAddr::new(bytes))
    }

    /// Wire value of the address type as carried in SMP PDUs and the
    /// crypto toolbox.
    pub fn type_u8(&self) -> u8 {
        self.addr_type.into()
    }

    /// Random static address: random type with the two most significant
    /// bits set.
    pub fn is_static_random(&self) -> bool {
        self.addr_type == AddressType::Random
            && self.address.bytes[5] & RANDOM_ADDRESS_SUBTYPE_MASK == RANDOM_STATIC_SUBTYPE
    }

    /// Resolvable private address: random type with the top bits `01`.
    pub fn is_resolvable_private(&self) -> bool {
        self.addr_type == AddressType::Random
            && self.address.bytes[5] & RANDOM_ADDRESS_SUBTYPE_MASK == RANDOM_RESOLVABLE_SUBTYPE
    }

    /// Whether the address can serve as a device identity.
    pub fn is_identity(&self) -> bool {
        self.addr_type == AddressType::Public || self.is_static_random()
    }
}

impl fmt::Display for LeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.addr_type {
            AddressType::Public => "public",
            AddressType::Random => "random",
            AddressType::PublicIdentity => "public-id",
            AddressType::RandomIdentity => "random-id",
        };
        write!(f, "{} ({})", self.address, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_address_classes() {
        let public = LeAddress::public([1, 2, 3, 4, 5, 6]);
        assert!(public.is_identity());

        let static_random = LeAddress::random([1, 2, 3, 4, 5, 0xC6]);
        assert!(static_random.is_static_random());
        assert!(static_random.is_identity());

        let rpa = LeAddress::random([1, 2, 3, 4, 5, 0x46]);
        assert!(rpa.is_resolvable_private());
        assert!(!rpa.is_identity());

        let non_resolvable = LeAddress::random([1, 2, 3, 4, 5, 0x06]);
        assert!(!non_resolvable.is_identity());
    }

    #[test]
    fn test_address_display_is_msb_first() {
        let addr = BdAddr::new([0xB6, 0xB5, 0xB4, 0xB3, 0xB2, 0xB1]);
        assert_eq!(addr.to_string(), "B1:B2:B3:B4:B5:B6");
    }

    #[test]
    fn test_address_type_round_trip() {
        for value in 0u8..4 {
            let parsed = AddressType::from_u8(value).unwrap();
            assert_eq!(u8::from(parsed), value);
        }
        assert!(AddressType::from_u8(4).is_none());
    }
}
