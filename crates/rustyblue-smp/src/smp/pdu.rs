//! Security Manager PDUs
//!
//! Every PDU is a one byte opcode followed by a fixed size payload. A PDU
//! whose payload length differs from the one its opcode defines is
//! rejected. `parse` functions take the complete PDU, opcode included, and
//! `serialize` produces the same layout.

use super::constants::*;
use super::ecdh::PublicKey;
use super::types::*;
use crate::gap::{AddressType, BdAddr, LeAddress};
use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt};
use std::fmt;
use std::io::{Cursor, Read};

/// SMP command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    PairingRequest,
    PairingResponse,
    PairingConfirm,
    PairingRandom,
    PairingFailed,
    EncryptionInformation,
    CentralIdentification,
    IdentityInformation,
    IdentityAddressInformation,
    SigningInformation,
    SecurityRequest,
    PairingPublicKey,
    PairingDhKeyCheck,
    KeypressNotification,
}

impl Opcode {
    /// Convert to u8 value for protocol
    pub fn to_u8(&self) -> u8 {
        match self {
            Opcode::PairingRequest => SMP_PAIRING_REQUEST,
            Opcode::PairingResponse => SMP_PAIRING_RESPONSE,
            Opcode::PairingConfirm => SMP_PAIRING_CONFIRM,
            Opcode::PairingRandom => SMP_PAIRING_RANDOM,
            Opcode::PairingFailed => SMP_PAIRING_FAILED,
            Opcode::EncryptionInformation => SMP_ENCRYPTION_INFORMATION,
            Opcode::CentralIdentification => SMP_CENTRAL_IDENTIFICATION,
            Opcode::IdentityInformation => SMP_IDENTITY_INFORMATION,
            Opcode::IdentityAddressInformation => SMP_IDENTITY_ADDRESS_INFORMATION,
            Opcode::SigningInformation => SMP_SIGNING_INFORMATION,
            Opcode::SecurityRequest => SMP_SECURITY_REQUEST,
            Opcode::PairingPublicKey => SMP_PAIRING_PUBLIC_KEY,
            Opcode::PairingDhKeyCheck => SMP_PAIRING_DHKEY_CHECK,
            Opcode::KeypressNotification => SMP_PAIRING_KEYPRESS_NOTIFICATION,
        }
    }

    /// Convert from u8 value from protocol
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            SMP_PAIRING_REQUEST => Some(Opcode::PairingRequest),
            SMP_PAIRING_RESPONSE => Some(Opcode::PairingResponse),
            SMP_PAIRING_CONFIRM => Some(Opcode::PairingConfirm),
            SMP_PAIRING_RANDOM => Some(Opcode::PairingRandom),
            SMP_PAIRING_FAILED => Some(Opcode::PairingFailed),
            SMP_ENCRYPTION_INFORMATION => Some(Opcode::EncryptionInformation),
            SMP_CENTRAL_IDENTIFICATION => Some(Opcode::CentralIdentification),
            SMP_IDENTITY_INFORMATION => Some(Opcode::IdentityInformation),
            SMP_IDENTITY_ADDRESS_INFORMATION => Some(Opcode::IdentityAddressInformation),
            SMP_SIGNING_INFORMATION => Some(Opcode::SigningInformation),
            SMP_SECURITY_REQUEST => Some(Opcode::SecurityRequest),
            SMP_PAIRING_PUBLIC_KEY => Some(Opcode::PairingPublicKey),
            SMP_PAIRING_DHKEY_CHECK => Some(Opcode::PairingDhKeyCheck),
            SMP_PAIRING_KEYPRESS_NOTIFICATION => Some(Opcode::KeypressNotification),
            _ => None,
        }
    }

    /// Payload length this opcode requires, opcode byte excluded
    pub fn payload_len(&self) -> usize {
        match self {
            Opcode::PairingRequest | Opcode::PairingResponse => SMP_PAIRING_FEATURES_LEN,
            Opcode::PairingConfirm
            | Opcode::PairingRandom
            | Opcode::EncryptionInformation
            | Opcode::IdentityInformation
            | Opcode::SigningInformation
            | Opcode::PairingDhKeyCheck => SMP_VALUE_128_LEN,
            Opcode::PairingFailed => SMP_PAIRING_FAILED_LEN,
            Opcode::CentralIdentification => SMP_CENTRAL_IDENTIFICATION_LEN,
            Opcode::IdentityAddressInformation => SMP_IDENTITY_ADDRESS_LEN,
            Opcode::SecurityRequest => SMP_SECURITY_REQUEST_LEN,
            Opcode::PairingPublicKey => SMP_PUBLIC_KEY_LEN,
            Opcode::KeypressNotification => SMP_KEYPRESS_LEN,
        }
    }

    /// Member of an expected-PDU set
    pub fn bit(&self) -> PduSet {
        PduSet::from_bits_truncate(1 << self.to_u8())
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

bitflags! {
    /// Set of PDUs a session currently accepts, one bit per opcode
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PduSet: u16 {
        const PAIRING_REQUEST = 1 << SMP_PAIRING_REQUEST;
        const PAIRING_RESPONSE = 1 << SMP_PAIRING_RESPONSE;
        const PAIRING_CONFIRM = 1 << SMP_PAIRING_CONFIRM;
        const PAIRING_RANDOM = 1 << SMP_PAIRING_RANDOM;
        const PAIRING_FAILED = 1 << SMP_PAIRING_FAILED;
        const ENCRYPTION_INFORMATION = 1 << SMP_ENCRYPTION_INFORMATION;
        const CENTRAL_IDENTIFICATION = 1 << SMP_CENTRAL_IDENTIFICATION;
        const IDENTITY_INFORMATION = 1 << SMP_IDENTITY_INFORMATION;
        const IDENTITY_ADDRESS_INFORMATION = 1 << SMP_IDENTITY_ADDRESS_INFORMATION;
        const SIGNING_INFORMATION = 1 << SMP_SIGNING_INFORMATION;
        const SECURITY_REQUEST = 1 << SMP_SECURITY_REQUEST;
        const PAIRING_PUBLIC_KEY = 1 << SMP_PAIRING_PUBLIC_KEY;
        const PAIRING_DHKEY_CHECK = 1 << SMP_PAIRING_DHKEY_CHECK;
        const KEYPRESS_NOTIFICATION = 1 << SMP_PAIRING_KEYPRESS_NOTIFICATION;
    }
}

fn check_len(data: &[u8], opcode: Opcode) -> SmpResult<()> {
    let expected = opcode.payload_len() + 1;
    if data.len() != expected || data[0] != opcode.to_u8() {
        return Err(SmpError::InvalidParameter(format!(
            "{} must be {} bytes, got {}",
            opcode,
            expected,
            data.len()
        )));
    }
    Ok(())
}

fn value_128(data: &[u8]) -> [u8; 16] {
    let mut value = [0u8; 16];
    value.copy_from_slice(&data[1..17]);
    value
}

fn pdu_128(opcode: Opcode, value: &[u8; 16]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(17);
    packet.push(opcode.to_u8());
    packet.extend_from_slice(value);
    packet
}

/// Pairing request/response packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingFeatures {
    /// IO capability, kept raw since peers may send reserved values
    pub io_capability: u8,
    /// OOB data flag
    pub oob_data_flag: u8,
    /// Authentication requirements
    pub auth_req: AuthReq,
    /// Maximum encryption key size
    pub max_key_size: u8,
    /// Initiator key distribution
    pub initiator_key_dist: KeyDist,
    /// Responder key distribution
    pub responder_key_dist: KeyDist,
}

impl PairingFeatures {
    /// Create new pairing features
    pub fn new(
        io_capability: IoCapability,
        oob_data_present: bool,
        auth_req: AuthReq,
        max_key_size: u8,
        initiator_key_dist: KeyDist,
        responder_key_dist: KeyDist,
    ) -> Self {
        Self {
            io_capability: io_capability.to_u8(),
            oob_data_flag: if oob_data_present {
                SMP_OOB_PRESENT
            } else {
                SMP_OOB_NOT_PRESENT
            },
            auth_req,
            max_key_size,
            initiator_key_dist,
            responder_key_dist,
        }
    }

    pub fn oob_data_present(&self) -> bool {
        self.oob_data_flag & SMP_OOB_PRESENT != 0
    }

    /// Parse a Pairing Request or Pairing Response
    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        let opcode = match data.first().copied().and_then(Opcode::from_u8) {
            Some(op @ (Opcode::PairingRequest | Opcode::PairingResponse)) => op,
            _ => {
                return Err(SmpError::InvalidParameter(
                    "not a pairing request or response".into(),
                ))
            }
        };
        check_len(data, opcode)?;

        Ok(Self {
            io_capability: data[1],
            oob_data_flag: data[2],
            auth_req: AuthReq::from_bits_retain(data[3]),
            max_key_size: data[4],
            initiator_key_dist: KeyDist::from_bits_retain(data[5]),
            responder_key_dist: KeyDist::from_bits_retain(data[6]),
        })
    }

    /// Serialize to raw packet
    pub fn serialize(&self, is_request: bool) -> Vec<u8> {
        self.to_bytes(is_request).to_vec()
    }

    /// Serialize into the fixed 7 byte form fed to `c1`
    pub fn to_bytes(&self, is_request: bool) -> [u8; 7] {
        [
            if is_request {
                SMP_PAIRING_REQUEST
            } else {
                SMP_PAIRING_RESPONSE
            },
            self.io_capability,
            self.oob_data_flag,
            self.auth_req.bits(),
            self.max_key_size,
            self.initiator_key_dist.bits(),
            self.responder_key_dist.bits(),
        ]
    }
}

/// Pairing confirm packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingConfirm {
    /// Confirm value
    pub confirm_value: [u8; 16],
}

impl PairingConfirm {
    pub fn new(confirm_value: [u8; 16]) -> Self {
        Self { confirm_value }
    }

    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        check_len(data, Opcode::PairingConfirm)?;
        Ok(Self::new(value_128(data)))
    }

    pub fn serialize(&self) -> Vec<u8> {
        pdu_128(Opcode::PairingConfirm, &self.confirm_value)
    }
}

/// Pairing random packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingRandom {
    /// Random value
    pub random_value: [u8; 16],
}

impl PairingRandom {
    pub fn new(random_value: [u8; 16]) -> Self {
        Self { random_value }
    }

    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        check_len(data, Opcode::PairingRandom)?;
        Ok(Self::new(value_128(data)))
    }

    pub fn serialize(&self) -> Vec<u8> {
        pdu_128(Opcode::PairingRandom, &self.random_value)
    }
}

/// Pairing failed packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingFailed {
    /// Raw reason code; unknown codes are reported as unspecified
    pub reason: u8,
}

impl PairingFailed {
    pub fn new(reason: FailureReason) -> Self {
        Self {
            reason: reason.to_u8(),
        }
    }

    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        check_len(data, Opcode::PairingFailed)?;
        Ok(Self { reason: data[1] })
    }

    pub fn serialize(&self) -> Vec<u8> {
        vec![SMP_PAIRING_FAILED, self.reason]
    }

    pub fn failure_reason(&self) -> FailureReason {
        FailureReason::from_u8(self.reason).unwrap_or(FailureReason::UnspecifiedReason)
    }
}

/// Encryption information packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionInformation {
    /// Long Term Key
    pub ltk: [u8; 16],
}

impl EncryptionInformation {
    pub fn new(ltk: [u8; 16]) -> Self {
        Self { ltk }
    }

    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        check_len(data, Opcode::EncryptionInformation)?;
        Ok(Self::new(value_128(data)))
    }

    pub fn serialize(&self) -> Vec<u8> {
        pdu_128(Opcode::EncryptionInformation, &self.ltk)
    }
}

/// Central identification packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CentralIdentification {
    /// EDIV (Encrypted Diversifier)
    pub ediv: u16,
    /// RAND (Random number)
    pub rand: [u8; 8],
}

impl CentralIdentification {
    pub fn new(ediv: u16, rand: [u8; 8]) -> Self {
        Self { ediv, rand }
    }

    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        check_len(data, Opcode::CentralIdentification)?;

        let mut cursor = Cursor::new(&data[1..]);
        let ediv = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| SmpError::InvalidParameter("Failed to read EDIV".into()))?;

        let mut rand = [0u8; 8];
        cursor
            .read_exact(&mut rand)
            .map_err(|_| SmpError::InvalidParameter("Failed to read RAND".into()))?;

        Ok(Self { ediv, rand })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(11);

        packet.push(SMP_CENTRAL_IDENTIFICATION);
        packet.extend_from_slice(&self.ediv.to_le_bytes());
        packet.extend_from_slice(&self.rand);

        packet
    }
}

/// Identity information packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityInformation {
    /// Identity Resolving Key
    pub irk: [u8; 16],
}

impl IdentityInformation {
    pub fn new(irk: [u8; 16]) -> Self {
        Self { irk }
    }

    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        check_len(data, Opcode::IdentityInformation)?;
        Ok(Self::new(value_128(data)))
    }

    pub fn serialize(&self) -> Vec<u8> {
        pdu_128(Opcode::IdentityInformation, &self.irk)
    }
}

/// Identity address information packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityAddressInformation {
    /// Raw address type (public or random)
    pub addr_type: u8,
    /// Bluetooth device address
    pub bd_addr: BdAddr,
}

impl IdentityAddressInformation {
    pub fn new(address: &LeAddress) -> Self {
        Self {
            addr_type: address.type_u8(),
            bd_addr: address.address,
        }
    }

    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        check_len(data, Opcode::IdentityAddressInformation)?;

        let bd_addr = BdAddr::from_slice(&data[2..8])
            .ok_or_else(|| SmpError::InvalidParameter("Invalid address".into()))?;

        Ok(Self {
            addr_type: data[1],
            bd_addr,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(8);

        packet.push(SMP_IDENTITY_ADDRESS_INFORMATION);
        packet.push(self.addr_type);
        packet.extend_from_slice(self.bd_addr.as_slice());

        packet
    }

    /// The carried address, if its type is one an LE device can use
    pub fn address(&self) -> Option<LeAddress> {
        AddressType::from_u8(self.addr_type).map(|addr_type| LeAddress::new(addr_type, self.bd_addr))
    }
}

/// Signing information packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigningInformation {
    /// Connection Signature Resolving Key
    pub csrk: [u8; 16],
}

impl SigningInformation {
    pub fn new(csrk: [u8; 16]) -> Self {
        Self { csrk }
    }

    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        check_len(data, Opcode::SigningInformation)?;
        Ok(Self::new(value_128(data)))
    }

    pub fn serialize(&self) -> Vec<u8> {
        pdu_128(Opcode::SigningInformation, &self.csrk)
    }
}

/// Security request packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityRequest {
    /// Authentication requirements
    pub auth_req: AuthReq,
}

impl SecurityRequest {
    pub fn new(auth_req: AuthReq) -> Self {
        Self { auth_req }
    }

    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        check_len(data, Opcode::SecurityRequest)?;
        Ok(Self::new(AuthReq::from_bits_retain(data[1])))
    }

    pub fn serialize(&self) -> Vec<u8> {
        vec![SMP_SECURITY_REQUEST, self.auth_req.bits()]
    }
}

/// Pairing public key packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingPublicKey {
    pub key: PublicKey,
}

impl PairingPublicKey {
    pub fn new(key: PublicKey) -> Self {
        Self { key }
    }

    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        check_len(data, Opcode::PairingPublicKey)?;

        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(&data[1..65]);
        Ok(Self::new(PublicKey::from_bytes(&bytes)))
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(65);

        packet.push(SMP_PAIRING_PUBLIC_KEY);
        packet.extend_from_slice(&self.key.to_bytes());

        packet
    }
}

/// Pairing DHKey check packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingDhKeyCheck {
    /// DHKey check value
    pub check: [u8; 16],
}

impl PairingDhKeyCheck {
    pub fn new(check: [u8; 16]) -> Self {
        Self { check }
    }

    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        check_len(data, Opcode::PairingDhKeyCheck)?;
        Ok(Self::new(value_128(data)))
    }

    pub fn serialize(&self) -> Vec<u8> {
        pdu_128(Opcode::PairingDhKeyCheck, &self.check)
    }
}

/// Keypress notification packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeypressNotification {
    /// Raw notification type
    pub notification_type: u8,
}

impl KeypressNotification {
    pub fn new(notification_type: KeypressNotificationType) -> Self {
        Self {
            notification_type: notification_type.to_u8(),
        }
    }

    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        check_len(data, Opcode::KeypressNotification)?;
        Ok(Self {
            notification_type: data[1],
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        vec![SMP_PAIRING_KEYPRESS_NOTIFICATION, self.notification_type]
    }

    /// Convert to KeypressNotificationType
    pub fn to_notification_type(&self) -> Option<KeypressNotificationType> {
        KeypressNotificationType::from_u8(self.notification_type)
    }
}

/// A decoded SMP PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmpPdu {
    PairingRequest(PairingFeatures),
    PairingResponse(PairingFeatures),
    PairingConfirm(PairingConfirm),
    PairingRandom(PairingRandom),
    PairingFailed(PairingFailed),
    EncryptionInformation(EncryptionInformation),
    CentralIdentification(CentralIdentification),
    IdentityInformation(IdentityInformation),
    IdentityAddressInformation(IdentityAddressInformation),
    SigningInformation(SigningInformation),
    SecurityRequest(SecurityRequest),
    PairingPublicKey(PairingPublicKey),
    PairingDhKeyCheck(PairingDhKeyCheck),
    KeypressNotification(KeypressNotification),
}

impl SmpPdu {
    /// Decode a complete PDU whose opcode has already been classified.
    pub fn parse(opcode: Opcode, data: &[u8]) -> SmpResult<Self> {
        Ok(match opcode {
            Opcode::PairingRequest => SmpPdu::PairingRequest(PairingFeatures::parse(data)?),
            Opcode::PairingResponse => SmpPdu::PairingResponse(PairingFeatures::parse(data)?),
            Opcode::PairingConfirm => SmpPdu::PairingConfirm(PairingConfirm::parse(data)?),
            Opcode::PairingRandom => SmpPdu::PairingRandom(PairingRandom::parse(data)?),
            Opcode::PairingFailed => SmpPdu::PairingFailed(PairingFailed::parse(data)?),
            Opcode::EncryptionInformation => {
                SmpPdu::EncryptionInformation(EncryptionInformation::parse(data)?)
            }
            Opcode::CentralIdentification => {
                SmpPdu::CentralIdentification(CentralIdentification::parse(data)?)
            }
            Opcode::IdentityInformation => {
                SmpPdu::IdentityInformation(IdentityInformation::parse(data)?)
            }
            Opcode::IdentityAddressInformation => {
                SmpPdu::IdentityAddressInformation(IdentityAddressInformation::parse(data)?)
            }
            Opcode::SigningInformation => {
                SmpPdu::SigningInformation(SigningInformation::parse(data)?)
            }
            Opcode::SecurityRequest => SmpPdu::SecurityRequest(SecurityRequest::parse(data)?),
            Opcode::PairingPublicKey => SmpPdu::PairingPublicKey(PairingPublicKey::parse(data)?),
            Opcode::PairingDhKeyCheck => {
                SmpPdu::PairingDhKeyCheck(PairingDhKeyCheck::parse(data)?)
            }
            Opcode::KeypressNotification => {
                SmpPdu::KeypressNotification(KeypressNotification::parse(data)?)
            }
        })
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            SmpPdu::PairingRequest(_) => Opcode::PairingRequest,
            SmpPdu::PairingResponse(_) => Opcode::PairingResponse,
            SmpPdu::PairingConfirm(_) => Opcode::PairingConfirm,
            SmpPdu::PairingRandom(_) => Opcode::PairingRandom,
            SmpPdu::PairingFailed(_) => Opcode::PairingFailed,
            SmpPdu::EncryptionInformation(_) => Opcode::EncryptionInformation,
            SmpPdu::CentralIdentification(_) => Opcode::CentralIdentification,
            SmpPdu::IdentityInformation(_) => Opcode::IdentityInformation,
            SmpPdu::IdentityAddressInformation(_) => Opcode::IdentityAddressInformation,
            SmpPdu::SigningInformation(_) => Opcode::SigningInformation,
            SmpPdu::SecurityRequest(_) => Opcode::SecurityRequest,
            SmpPdu::PairingPublicKey(_) => Opcode::PairingPublicKey,
            SmpPdu::PairingDhKeyCheck(_) => Opcode::PairingDhKeyCheck,
            SmpPdu::KeypressNotification(_) => Opcode::KeypressNotification,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_pairing_request_layout() {
        let features = PairingFeatures::new(
            IoCapability::KeyboardDisplay,
            false,
            AuthReq::BONDING | AuthReq::MITM,
            16,
            KeyDist::ENC_KEY,
            KeyDist::ENC_KEY | KeyDist::ID_KEY,
        );
        let bytes = features.serialize(true);
        assert_eq!(bytes, vec![0x01, 0x04, 0x00, 0x05, 0x10, 0x01, 0x03]);
        assert_eq!(PairingFeatures::parse(&bytes).unwrap(), features);
        assert_eq!(features.to_bytes(false)[0], SMP_PAIRING_RESPONSE);
    }

    #[test]
    fn test_lengths_are_exact() {
        let short = [SMP_PAIRING_REQUEST, 0x03, 0x00, 0x01, 0x10, 0x07];
        assert!(PairingFeatures::parse(&short).is_err());

        let long = [SMP_PAIRING_FAILED, 0x08, 0x00];
        assert!(PairingFailed::parse(&long).is_err());

        let mut confirm = vec![SMP_PAIRING_CONFIRM];
        confirm.extend_from_slice(&[0xAA; 16]);
        assert!(PairingConfirm::parse(&confirm).is_ok());
        confirm.push(0);
        assert!(PairingConfirm::parse(&confirm).is_err());
    }

    #[test]
    fn test_central_identification_order() {
        let pdu = CentralIdentification::new(0x1234, [1, 2, 3, 4, 5, 6, 7, 8]);
        let bytes = pdu.serialize();
        assert_eq!(&bytes[..3], &[SMP_CENTRAL_IDENTIFICATION, 0x34, 0x12]);
        assert_eq!(CentralIdentification::parse(&bytes).unwrap(), pdu);
    }

    #[test]
    fn test_identity_address_type_checked() {
        let address = LeAddress::random([1, 2, 3, 4, 5, 0xC0]);
        let pdu = IdentityAddressInformation::new(&address);
        assert_eq!(pdu.address(), Some(address));

        let bytes = [SMP_IDENTITY_ADDRESS_INFORMATION, 0x07, 1, 2, 3, 4, 5, 6];
        let parsed = IdentityAddressInformation::parse(&bytes).unwrap();
        assert!(parsed.address().is_none());
    }

    #[test]
    fn test_unknown_failure_reason_is_unspecified() {
        let pdu = PairingFailed::parse(&[SMP_PAIRING_FAILED, 0x42]).unwrap();
        assert_eq!(pdu.failure_reason(), FailureReason::UnspecifiedReason);
    }

    #[test]
    fn test_pdu_set_membership() {
        let set = Opcode::PairingConfirm.bit() | Opcode::KeypressNotification.bit();
        assert!(set.contains(PduSet::PAIRING_CONFIRM));
        assert!(!set.contains(Opcode::PairingRandom.bit()));
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(data in proptest::collection::vec(any::<u8>(), 0..80)) {
            if let Some(opcode) = data.first().copied().and_then(Opcode::from_u8) {
                let parsed = SmpPdu::parse(opcode, &data);
                prop_assert_eq!(parsed.is_ok(), data.len() == opcode.payload_len() + 1);
            }
        }
    }
}
