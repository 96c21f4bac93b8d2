// Address types
pub const PUBLIC_DEVICE_ADDRESS: u8 = 0x00;
pub const RANDOM_DEVICE_ADDRESS: u8 = 0x01;
pub const PUBLIC_IDENTITY_ADDRESS: u8 = 0x02;
pub const RANDOM_IDENTITY_ADDRESS: u8 = 0x03;

// Random address sub-types, two most significant bits of the MSB
pub const RANDOM_ADDRESS_SUBTYPE_MASK: u8 = 0xC0;
pub const RANDOM_STATIC_SUBTYPE: u8 = 0xC0;
pub const RANDOM_RESOLVABLE_SUBTYPE: u8 = 0x40;
