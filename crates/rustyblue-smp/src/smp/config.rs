//! Security Manager configuration

use super::constants::*;
use super::types::*;
use crate::gap::LeAddress;
use std::time::Duration;

/// Secure Connections support level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScSupport {
    /// Legacy pairing only
    Disabled,
    /// Secure Connections preferred, legacy accepted
    Enabled,
    /// Refuse legacy pairing
    Only,
}

/// Order in which remote key distribution PDUs are armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyDistributionOrder {
    /// Remote keys are accepted once the encryption change is reported.
    #[default]
    Standard,
    /// The first remote key PDU is accepted as soon as encryption is
    /// requested. Works around controllers that report the encryption
    /// change after delivering the peer's first encrypted PDU.
    EarlyRemoteKeys,
}

/// Configuration shared by every pairing session of an [`SmpManager`].
///
/// [`SmpManager`]: super::SmpManager
#[derive(Debug, Clone)]
pub struct SmpConfig {
    pub io_capability: IoCapability,
    /// Request bonding in outgoing pairing features
    pub bondable: bool,
    /// Fail pairing if the peer does not bond
    pub bonding_required: bool,
    /// Request MITM protection when the IO capability allows it
    pub mitm: bool,
    pub secure_connections: ScSupport,
    /// Largest encryption key size offered (7..=16)
    pub max_key_size: u8,
    /// Keys this device distributes
    pub local_keys: KeyDist,
    /// Keys this device accepts from the peer
    pub remote_keys: KeyDist,
    pub ct2: bool,
    pub keypress_notifications: bool,
    /// Display this passkey instead of a random one
    pub fixed_passkey: Option<u32>,
    /// Legacy OOB temporary key available from the peer
    pub legacy_oob_present: bool,
    /// Secure Connections OOB data available from the peer
    pub sc_oob_present: bool,
    /// Ask the user before Just Works or fixed passkey pairing
    pub pairing_consent: bool,
    /// Let an unauthenticated pairing replace an unauthenticated bond
    pub allow_unauthenticated_overwrite: bool,
    /// Use the Secure Connections debug key pair
    pub use_debug_keys: bool,
    /// Identity root used to derive the distributed IRK
    pub identity_root: [u8; 16],
    /// Identity address distributed with the IRK
    pub identity_address: Option<LeAddress>,
    /// Security level a pairing must be able to reach
    pub required_security: SecurityLevel,
    pub timeout: Duration,
    pub key_distribution_order: KeyDistributionOrder,
}

impl Default for SmpConfig {
    fn default() -> Self {
        Self {
            io_capability: IoCapability::NoInputNoOutput,
            bondable: true,
            bonding_required: false,
            mitm: false,
            secure_connections: ScSupport::Enabled,
            max_key_size: SMP_MAX_ENCRYPTION_KEY_SIZE,
            local_keys: KeyDist::ENC_KEY | KeyDist::ID_KEY | KeyDist::SIGN_KEY,
            remote_keys: KeyDist::ENC_KEY | KeyDist::ID_KEY | KeyDist::SIGN_KEY,
            ct2: true,
            keypress_notifications: false,
            fixed_passkey: None,
            legacy_oob_present: false,
            sc_oob_present: false,
            pairing_consent: false,
            allow_unauthenticated_overwrite: false,
            use_debug_keys: false,
            identity_root: [0; 16],
            identity_address: None,
            required_security: SecurityLevel::EncryptionOnly,
            timeout: Duration::from_millis(SMP_TIMEOUT_GENERAL),
            key_distribution_order: KeyDistributionOrder::Standard,
        }
    }
}

impl SmpConfig {
    pub fn with_io_capability(mut self, io_capability: IoCapability) -> Self {
        self.io_capability = io_capability;
        self
    }

    pub fn with_bondable(mut self, bondable: bool) -> Self {
        self.bondable = bondable;
        self
    }

    pub fn with_mitm(mut self, mitm: bool) -> Self {
        self.mitm = mitm;
        self
    }

    pub fn with_secure_connections(mut self, support: ScSupport) -> Self {
        self.secure_connections = support;
        self
    }

    pub fn with_max_key_size(mut self, size: u8) -> Self {
        self.max_key_size = size;
        self
    }

    pub fn with_key_distribution(mut self, local: KeyDist, remote: KeyDist) -> Self {
        self.local_keys = local;
        self.remote_keys = remote;
        self
    }

    pub fn with_fixed_passkey(mut self, passkey: u32) -> Self {
        self.fixed_passkey = Some(passkey);
        self
    }

    pub fn with_identity(mut self, identity_root: [u8; 16], address: LeAddress) -> Self {
        self.identity_root = identity_root;
        self.identity_address = Some(address);
        self
    }

    pub fn with_required_security(mut self, level: SecurityLevel) -> Self {
        self.required_security = level;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_key_distribution_order(mut self, order: KeyDistributionOrder) -> Self {
        self.key_distribution_order = order;
        self
    }

    /// Check that the configuration can be used for pairing
    pub fn validate(&self) -> SmpResult<()> {
        if !(SMP_MIN_ENCRYPTION_KEY_SIZE..=SMP_MAX_ENCRYPTION_KEY_SIZE).contains(&self.max_key_size) {
            return Err(SmpError::InvalidParameter(format!(
                "max key size {} outside {}..={}",
                self.max_key_size, SMP_MIN_ENCRYPTION_KEY_SIZE, SMP_MAX_ENCRYPTION_KEY_SIZE
            )));
        }

        if let Some(passkey) = self.fixed_passkey {
            if passkey > SMP_PASSKEY_MAX {
                return Err(SmpError::InvalidParameter(format!(
                    "fixed passkey {} has more than six digits",
                    passkey
                )));
            }
        }

        if let Some(address) = self.identity_address {
            if !address.is_identity() {
                return Err(SmpError::InvalidParameter(format!(
                    "{} is not an identity address",
                    address
                )));
            }
        }

        Ok(())
    }

    /// Whether Secure Connections is offered at all
    pub fn sc_supported(&self) -> bool {
        self.secure_connections != ScSupport::Disabled
    }

    /// Keys offered when sending over a Secure Connections link
    pub(crate) fn local_keys_sc(&self) -> KeyDist {
        self.local_keys & !KeyDist::ENC_KEY
    }

    /// Keys accepted over a Secure Connections link
    pub(crate) fn remote_keys_sc(&self) -> KeyDist {
        self.remote_keys & !KeyDist::ENC_KEY
    }

    /// Security level every pairing must reach
    pub(crate) fn effective_required_security(&self) -> SecurityLevel {
        if self.secure_connections == ScSupport::Only {
            SecurityLevel::SecureConnections
        } else {
            self.required_security
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SmpConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.key_distribution_order, KeyDistributionOrder::Standard);
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_bad_key_size() {
        assert!(SmpConfig::default().with_max_key_size(6).validate().is_err());
        assert!(SmpConfig::default().with_max_key_size(17).validate().is_err());
        assert!(SmpConfig::default().with_max_key_size(7).validate().is_ok());
    }

    #[test]
    fn test_rejects_long_fixed_passkey() {
        let config = SmpConfig::default().with_fixed_passkey(1_000_000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_private_identity_address() {
        let rpa = LeAddress::random([1, 2, 3, 4, 5, 0x41]);
        let config = SmpConfig::default().with_identity([1; 16], rpa);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sc_masks_drop_encryption_key() {
        let config = SmpConfig::default();
        assert!(!config.local_keys_sc().contains(KeyDist::ENC_KEY));
        assert!(config.remote_keys_sc().contains(KeyDist::ID_KEY));
    }
}
