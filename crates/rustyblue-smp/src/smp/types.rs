//! Type definitions for the Security Manager Protocol
use super::constants::*;
use crate::gap::LeAddress;
use bitflags::bitflags;
use std::fmt;
use thiserror::Error;
use zeroize::Zeroize;

/// HCI connection handle identifying one LE link.
pub type ConnectionHandle = u16;

/// SMP Error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SmpError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Pairing failed: {0}")]
    PairingFailed(FailureReason),

    #[error("Invalid state for operation")]
    InvalidState,

    #[error("Operation already in progress")]
    Busy,

    #[error("Operation timeout")]
    Timeout,

    #[error("Connection not found")]
    ConnectionNotFound,

    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Key store error: {0}")]
    KeyStoreError(String),
}

/// Result type for SMP operations
pub type SmpResult<T> = Result<T, SmpError>;

/// Reason codes carried in a Pairing Failed PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    PasskeyEntryFailed,
    OobNotAvailable,
    AuthenticationRequirements,
    ConfirmValueFailed,
    PairingNotSupported,
    EncryptionKeySize,
    CommandNotSupported,
    UnspecifiedReason,
    RepeatedAttempts,
    InvalidParameters,
    DhKeyCheckFailed,
    NumericComparisonFailed,
    BrEdrPairingInProgress,
    CrossTransportKeyNotAllowed,
    KeyRejected,
}

impl FailureReason {
    /// Convert to u8 value for protocol
    pub fn to_u8(&self) -> u8 {
        match self {
            FailureReason::PasskeyEntryFailed => SMP_REASON_PASSKEY_ENTRY_FAILED,
            FailureReason::OobNotAvailable => SMP_REASON_OOB_NOT_AVAILABLE,
            FailureReason::AuthenticationRequirements => SMP_REASON_AUTHENTICATION_REQUIREMENTS,
            FailureReason::ConfirmValueFailed => SMP_REASON_CONFIRM_VALUE_FAILED,
            FailureReason::PairingNotSupported => SMP_REASON_PAIRING_NOT_SUPPORTED,
            FailureReason::EncryptionKeySize => SMP_REASON_ENCRYPTION_KEY_SIZE,
            FailureReason::CommandNotSupported => SMP_REASON_COMMAND_NOT_SUPPORTED,
            FailureReason::UnspecifiedReason => SMP_REASON_UNSPECIFIED_REASON,
            FailureReason::RepeatedAttempts => SMP_REASON_REPEATED_ATTEMPTS,
            FailureReason::InvalidParameters => SMP_REASON_INVALID_PARAMETERS,
            FailureReason::DhKeyCheckFailed => SMP_REASON_DHKEY_CHECK_FAILED,
            FailureReason::NumericComparisonFailed => SMP_REASON_NUMERIC_COMPARISON_FAILED,
            FailureReason::BrEdrPairingInProgress => SMP_REASON_BR_EDR_PAIRING_IN_PROGRESS,
            FailureReason::CrossTransportKeyNotAllowed => {
                SMP_REASON_CROSS_TRANSPORT_KEY_NOT_ALLOWED
            }
            FailureReason::KeyRejected => SMP_REASON_KEY_REJECTED,
        }
    }

    /// Convert from u8 value from protocol
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            SMP_REASON_PASSKEY_ENTRY_FAILED => Some(FailureReason::PasskeyEntryFailed),
            SMP_REASON_OOB_NOT_AVAILABLE => Some(FailureReason::OobNotAvailable),
            SMP_REASON_AUTHENTICATION_REQUIREMENTS => {
                Some(FailureReason::AuthenticationRequirements)
            }
            SMP_REASON_CONFIRM_VALUE_FAILED => Some(FailureReason::ConfirmValueFailed),
            SMP_REASON_PAIRING_NOT_SUPPORTED => Some(FailureReason::PairingNotSupported),
            SMP_REASON_ENCRYPTION_KEY_SIZE => Some(FailureReason::EncryptionKeySize),
            SMP_REASON_COMMAND_NOT_SUPPORTED => Some(FailureReason::CommandNotSupported),
            SMP_REASON_UNSPECIFIED_REASON => Some(FailureReason::UnspecifiedReason),
            SMP_REASON_REPEATED_ATTEMPTS => Some(FailureReason::RepeatedAttempts),
            SMP_REASON_INVALID_PARAMETERS => Some(FailureReason::InvalidParameters),
            SMP_REASON_DHKEY_CHECK_FAILED => Some(FailureReason::DhKeyCheckFailed),
            SMP_REASON_NUMERIC_COMPARISON_FAILED => Some(FailureReason::NumericComparisonFailed),
            SMP_REASON_BR_EDR_PAIRING_IN_PROGRESS => Some(FailureReason::BrEdrPairingInProgress),
            SMP_REASON_CROSS_TRANSPORT_KEY_NOT_ALLOWED => {
                Some(FailureReason::CrossTransportKeyNotAllowed)
            }
            SMP_REASON_KEY_REJECTED => Some(FailureReason::KeyRejected),
            _ => None,
        }
    }

    /// Security error class reported upward for this reason.
    pub fn security_error(&self) -> SecurityError {
        match self {
            FailureReason::PasskeyEntryFailed
            | FailureReason::DhKeyCheckFailed
            | FailureReason::NumericComparisonFailed
            | FailureReason::ConfirmValueFailed => SecurityError::AuthenticationFailure,
            FailureReason::OobNotAvailable => SecurityError::OobNotAvailable,
            FailureReason::AuthenticationRequirements | FailureReason::EncryptionKeySize => {
                SecurityError::AuthenticationRequirement
            }
            FailureReason::PairingNotSupported | FailureReason::CommandNotSupported => {
                SecurityError::PairingNotSupported
            }
            FailureReason::RepeatedAttempts
            | FailureReason::BrEdrPairingInProgress
            | FailureReason::CrossTransportKeyNotAllowed => SecurityError::PairingNotAllowed,
            FailureReason::InvalidParameters => SecurityError::InvalidParameter,
            FailureReason::KeyRejected => SecurityError::KeyRejected,
            FailureReason::UnspecifiedReason => SecurityError::Unspecified,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::PasskeyEntryFailed => write!(f, "Passkey entry failed"),
            FailureReason::OobNotAvailable => write!(f, "OOB data not available"),
            FailureReason::AuthenticationRequirements => {
                write!(f, "Authentication requirements not met")
            }
            FailureReason::ConfirmValueFailed => write!(f, "Confirm value failed"),
            FailureReason::PairingNotSupported => write!(f, "Pairing not supported"),
            FailureReason::EncryptionKeySize => write!(f, "Encryption key size issue"),
            FailureReason::CommandNotSupported => write!(f, "Command not supported"),
            FailureReason::UnspecifiedReason => write!(f, "Unspecified reason"),
            FailureReason::RepeatedAttempts => write!(f, "Too many pairing attempts"),
            FailureReason::InvalidParameters => write!(f, "Invalid parameters"),
            FailureReason::DhKeyCheckFailed => write!(f, "DHKey check failed"),
            FailureReason::NumericComparisonFailed => write!(f, "Numeric comparison failed"),
            FailureReason::BrEdrPairingInProgress => write!(f, "BR/EDR pairing in progress"),
            FailureReason::CrossTransportKeyNotAllowed => {
                write!(f, "Cross-transport key not allowed")
            }
            FailureReason::KeyRejected => write!(f, "Key rejected"),
        }
    }
}

/// Security error class reported to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityError {
    AuthenticationFailure,
    PinOrKeyMissing,
    OobNotAvailable,
    AuthenticationRequirement,
    PairingNotSupported,
    PairingNotAllowed,
    InvalidParameter,
    KeyRejected,
    Unspecified,
}

impl SecurityError {
    /// Map an HCI status from an encryption change event.
    pub fn from_hci_status(status: u8) -> Self {
        match status {
            HCI_ERR_AUTHENTICATION_FAILURE => SecurityError::AuthenticationFailure,
            HCI_ERR_PIN_OR_KEY_MISSING => SecurityError::PinOrKeyMissing,
            HCI_ERR_PAIRING_NOT_ALLOWED => SecurityError::PairingNotAllowed,
            HCI_ERR_PAIRING_NOT_SUPPORTED => SecurityError::PairingNotSupported,
            HCI_ERR_INVALID_PARAMETERS => SecurityError::InvalidParameter,
            _ => SecurityError::Unspecified,
        }
    }

    /// Pairing Failed reason to report for a failure of this class.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            SecurityError::OobNotAvailable => FailureReason::OobNotAvailable,
            SecurityError::AuthenticationFailure | SecurityError::AuthenticationRequirement => {
                FailureReason::AuthenticationRequirements
            }
            SecurityError::PairingNotSupported => FailureReason::PairingNotSupported,
            SecurityError::InvalidParameter => FailureReason::InvalidParameters,
            SecurityError::KeyRejected => FailureReason::KeyRejected,
            SecurityError::PinOrKeyMissing
            | SecurityError::PairingNotAllowed
            | SecurityError::Unspecified => FailureReason::UnspecifiedReason,
        }
    }
}

impl fmt::Display for SecurityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityError::AuthenticationFailure => write!(f, "Authentication failure"),
            SecurityError::PinOrKeyMissing => write!(f, "PIN or key missing"),
            SecurityError::OobNotAvailable => write!(f, "OOB data not available"),
            SecurityError::AuthenticationRequirement => write!(f, "Authentication requirement"),
            SecurityError::PairingNotSupported => write!(f, "Pairing not supported"),
            SecurityError::PairingNotAllowed => write!(f, "Pairing not allowed"),
            SecurityError::InvalidParameter => write!(f, "Invalid parameter"),
            SecurityError::KeyRejected => write!(f, "Key rejected"),
            SecurityError::Unspecified => write!(f, "Unspecified"),
        }
    }
}

/// IO Capability types for pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCapability {
    /// Display only capability
    DisplayOnly,
    /// Display with yes/no capability
    DisplayYesNo,
    /// Keyboard only
    KeyboardOnly,
    /// No input, no output
    NoInputNoOutput,
    /// Both keyboard and display
    KeyboardDisplay,
}

impl IoCapability {
    /// Convert to u8 value for protocol
    pub fn to_u8(&self) -> u8 {
        match self {
            IoCapability::DisplayOnly => SMP_IO_CAPABILITY_DISPLAY_ONLY,
            IoCapability::DisplayYesNo => SMP_IO_CAPABILITY_DISPLAY_YES_NO,
            IoCapability::KeyboardOnly => SMP_IO_CAPABILITY_KEYBOARD_ONLY,
            IoCapability::NoInputNoOutput => SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT,
            IoCapability::KeyboardDisplay => SMP_IO_CAPABILITY_KEYBOARD_DISPLAY,
        }
    }

    /// Convert from u8 value from protocol
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            SMP_IO_CAPABILITY_DISPLAY_ONLY => Some(IoCapability::DisplayOnly),
            SMP_IO_CAPABILITY_DISPLAY_YES_NO => Some(IoCapability::DisplayYesNo),
            SMP_IO_CAPABILITY_KEYBOARD_ONLY => Some(IoCapability::KeyboardOnly),
            SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT => Some(IoCapability::NoInputNoOutput),
            SMP_IO_CAPABILITY_KEYBOARD_DISPLAY => Some(IoCapability::KeyboardDisplay),
            _ => None,
        }
    }
}

impl fmt::Display for IoCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoCapability::DisplayOnly => write!(f, "Display Only"),
            IoCapability::DisplayYesNo => write!(f, "Display Yes/No"),
            IoCapability::KeyboardOnly => write!(f, "Keyboard Only"),
            IoCapability::NoInputNoOutput => write!(f, "No Input No Output"),
            IoCapability::KeyboardDisplay => write!(f, "Keyboard Display"),
        }
    }
}

/// Pairing methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingMethod {
    /// Just Works, no user interaction and no MITM protection
    JustWorks,
    /// The local device displays a passkey the peer types in
    PasskeyDisplay,
    /// The local user types in the passkey shown by the peer
    PasskeyInput,
    /// Numeric comparison, Secure Connections only
    PasskeyConfirm,
    /// Legacy out of band, a shared temporary key
    LegacyOob,
    /// Secure Connections out of band
    ScOob,
}

impl PairingMethod {
    /// Passkey entry in either direction.
    pub fn is_passkey(&self) -> bool {
        matches!(self, PairingMethod::PasskeyDisplay | PairingMethod::PasskeyInput)
    }

    /// Whether keys from this method are MITM protected.
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, PairingMethod::JustWorks)
    }
}

impl fmt::Display for PairingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingMethod::JustWorks => write!(f, "Just Works"),
            PairingMethod::PasskeyDisplay => write!(f, "Passkey Display"),
            PairingMethod::PasskeyInput => write!(f, "Passkey Input"),
            PairingMethod::PasskeyConfirm => write!(f, "Numeric Comparison"),
            PairingMethod::LegacyOob => write!(f, "Legacy Out of Band"),
            PairingMethod::ScOob => write!(f, "Secure Connections Out of Band"),
        }
    }
}

bitflags! {
    /// Authentication requirements field of a pairing PDU
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AuthReq: u8 {
        const BONDING = SMP_AUTH_REQ_BONDING;
        const MITM = SMP_AUTH_REQ_MITM;
        const SC = SMP_AUTH_REQ_SC;
        const KEYPRESS = SMP_AUTH_REQ_KEYPRESS;
        const CT2 = SMP_AUTH_REQ_CT2;
    }
}

bitflags! {
    /// Key distribution mask; each bit is one key type
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct KeyDist: u8 {
        /// Encryption key (LTK, EDIV, Rand), legacy pairing only
        const ENC_KEY = SMP_KEY_DIST_ENC_KEY;
        /// Identity key (IRK and identity address)
        const ID_KEY = SMP_KEY_DIST_ID_KEY;
        /// Signing key (CSRK)
        const SIGN_KEY = SMP_KEY_DIST_SIGN_KEY;
        /// Derive the BR/EDR link key
        const LINK_KEY = SMP_KEY_DIST_LINK_KEY;
    }
}

/// Out of band data for Secure Connections pairing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Zeroize)]
pub struct OobData {
    /// Random value (r)
    pub r: [u8; 16],
    /// Confirm value (c = f4(PKx, PKx, r, 0))
    pub c: [u8; 16],
}

/// Which side of an SC OOB exchange has data to contribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScOobConfig {
    /// Only the local OOB data is used, the peer received it
    LocalOnly,
    /// Only the peer's OOB data is used, it was received locally
    RemoteOnly,
    /// Both peers exchanged data
    BothPeers,
    NoData,
}

/// Out of band data the application is asked to provide
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OobRequest {
    /// 16 byte temporary key for legacy OOB pairing
    LegacyTk,
    /// Secure Connections OOB data
    SecureConnections(ScOobConfig),
}

/// Security level for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityLevel {
    /// No security (unencrypted)
    None = 0,
    /// Encryption without authentication (Just Works)
    EncryptionOnly = 1,
    /// Encryption with authentication (MITM protection)
    EncryptionWithAuthentication = 2,
    /// Authenticated Secure Connections with a 128 bit key
    SecureConnections = 3,
}

impl SecurityLevel {
    /// Check if this security level includes encryption
    pub fn is_encrypted(&self) -> bool {
        *self >= SecurityLevel::EncryptionOnly
    }

    /// Check if this security level includes authentication
    pub fn is_authenticated(&self) -> bool {
        *self >= SecurityLevel::EncryptionWithAuthentication
    }

    /// Check if this security level uses Secure Connections
    pub fn is_secure_connections(&self) -> bool {
        *self >= SecurityLevel::SecureConnections
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityLevel::None => write!(f, "L1 (no security)"),
            SecurityLevel::EncryptionOnly => write!(f, "L2 (encryption)"),
            SecurityLevel::EncryptionWithAuthentication => {
                write!(f, "L3 (authenticated encryption)")
            }
            SecurityLevel::SecureConnections => write!(f, "L4 (secure connections)"),
        }
    }
}

/// Keypress notification type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeypressNotificationType {
    /// Entry started
    EntryStarted,
    /// Digit entered
    DigitEntered,
    /// Digit erased
    DigitErased,
    /// Cleared
    Cleared,
    /// Entry completed
    EntryCompleted,
}

impl KeypressNotificationType {
    /// Convert to u8 value for protocol
    pub fn to_u8(&self) -> u8 {
        match self {
            KeypressNotificationType::EntryStarted => SMP_KEYPRESS_ENTRY_STARTED,
            KeypressNotificationType::DigitEntered => SMP_KEYPRESS_DIGIT_ENTERED,
            KeypressNotificationType::DigitErased => SMP_KEYPRESS_DIGIT_ERASED,
            KeypressNotificationType::Cleared => SMP_KEYPRESS_CLEARED,
            KeypressNotificationType::EntryCompleted => SMP_KEYPRESS_ENTRY_COMPLETED,
        }
    }

    /// Convert from u8 value from protocol
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            SMP_KEYPRESS_ENTRY_STARTED => Some(KeypressNotificationType::EntryStarted),
            SMP_KEYPRESS_DIGIT_ENTERED => Some(KeypressNotificationType::DigitEntered),
            SMP_KEYPRESS_DIGIT_ERASED => Some(KeypressNotificationType::DigitErased),
            SMP_KEYPRESS_CLEARED => Some(KeypressNotificationType::Cleared),
            SMP_KEYPRESS_ENTRY_COMPLETED => Some(KeypressNotificationType::EntryCompleted),
            _ => None,
        }
    }
}

/// SMP Event types for callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmpEvent {
    /// Show this passkey to the user
    DisplayPasskey(ConnectionHandle, u32),
    /// Ask the user to type the passkey shown on the peer
    PasskeyRequest(ConnectionHandle),
    /// Ask the user whether both devices show this number
    NumericComparisonRequest(ConnectionHandle, u32),
    /// Ask the user to allow pairing with an unauthenticated method
    PairingConsentRequest(ConnectionHandle, PairingMethod),
    /// Ask the application for out of band data
    OobDataRequest(ConnectionHandle, OobRequest),
    /// The peer reported a keypress during passkey entry
    KeypressReceived(ConnectionHandle, KeypressNotificationType),
    /// Pairing completed
    PairingComplete { conn: ConnectionHandle, bonded: bool },
    /// Pairing failed
    PairingFailed {
        conn: ConnectionHandle,
        reason: FailureReason,
        error: SecurityError,
    },
    /// Link security changed, or failed to change
    SecurityChanged {
        conn: ConnectionHandle,
        level: SecurityLevel,
        error: Option<SecurityError>,
    },
    /// The peer distributed an identity address
    IdentityResolved {
        conn: ConnectionHandle,
        address: LeAddress,
        identity: LeAddress,
    },
}

// HCI status codes seen in encryption change events
const HCI_ERR_AUTHENTICATION_FAILURE: u8 = 0x05;
const HCI_ERR_PIN_OR_KEY_MISSING: u8 = 0x06;
const HCI_ERR_INVALID_PARAMETERS: u8 = 0x12;
const HCI_ERR_PAIRING_NOT_ALLOWED: u8 = 0x18;
const HCI_ERR_PAIRING_NOT_SUPPORTED: u8 = 0x29;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_codes() {
        for code in 0x01..=0x0F {
            let reason = FailureReason::from_u8(code).unwrap();
            assert_eq!(reason.to_u8(), code);
        }
        assert!(FailureReason::from_u8(0x00).is_none());
        assert!(FailureReason::from_u8(0x10).is_none());
    }

    #[test]
    fn test_failure_reason_security_class() {
        assert_eq!(
            FailureReason::DhKeyCheckFailed.security_error(),
            SecurityError::AuthenticationFailure
        );
        assert_eq!(
            FailureReason::EncryptionKeySize.security_error(),
            SecurityError::AuthenticationRequirement
        );
        assert_eq!(
            FailureReason::CommandNotSupported.security_error(),
            SecurityError::PairingNotSupported
        );
    }

    #[test]
    fn test_hci_status_mapping() {
        let err = SecurityError::from_hci_status(0x06);
        assert_eq!(err, SecurityError::PinOrKeyMissing);
        assert_eq!(err.failure_reason(), FailureReason::UnspecifiedReason);
        assert_eq!(
            SecurityError::from_hci_status(0x05).failure_reason(),
            FailureReason::AuthenticationRequirements
        );
    }

    #[test]
    fn test_auth_req_drops_reserved_bits() {
        let auth = AuthReq::from_bits_truncate(0xC5);
        assert!(auth.contains(AuthReq::BONDING | AuthReq::MITM));
        assert_eq!(auth.bits(), 0x05);
    }

    #[test]
    fn test_security_level_ordering() {
        assert!(SecurityLevel::SecureConnections.is_authenticated());
        assert!(!SecurityLevel::EncryptionOnly.is_authenticated());
        assert!(SecurityLevel::None < SecurityLevel::EncryptionOnly);
    }
}
