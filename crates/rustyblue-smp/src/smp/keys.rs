//! Key management for Security Manager Protocol
//!
//! A [`KeySet`] holds everything one pairing produced for a peer: the Long
//! Term Key used to re-encrypt the link, the peer's Identity Resolving Key
//! and identity address, signing keys and an optional BR/EDR link key.
//! Bonded key sets are persisted through the [`KeyStore`] trait, keyed by
//! the peer's identity address.

use super::crypto;
use super::types::*;
use crate::gap::LeAddress;
use bitflags::bitflags;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop};

bitflags! {
    /// Properties of the pairing that produced a key set
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct KeyFlags: u8 {
        /// MITM protected pairing method
        const AUTHENTICATED = 0x01;
        /// LE Secure Connections pairing
        const SECURE_CONNECTIONS = 0x02;
        /// Paired using the Secure Connections debug key pair
        const DEBUG = 0x04;
        /// Authenticated out of band
        const OOB = 0x08;
    }
}

/// Long Term Key (LTK) information
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct LongTermKey {
    /// Key value, least significant byte first
    pub key: [u8; 16],
    /// EDIV (Encrypted Diversifier)
    pub ediv: u16,
    /// RAND (Random number)
    pub rand: [u8; 8],
}

impl LongTermKey {
    /// Create a new Long Term Key
    pub fn new(key: [u8; 16], ediv: u16, rand: [u8; 8]) -> Self {
        Self { key, ediv, rand }
    }

    /// Secure Connections keys are always looked up with EDIV and Rand zero.
    pub fn secure_connections(key: [u8; 16]) -> Self {
        Self::new(key, 0, [0; 8])
    }

    pub fn matches(&self, ediv: u16, rand: &[u8; 8]) -> bool {
        self.ediv == ediv && self.rand == *rand
    }
}

impl fmt::Debug for LongTermKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LongTermKey")
            .field("ediv", &self.ediv)
            .field("rand", &hex::encode(self.rand))
            .finish_non_exhaustive()
    }
}

/// Connection Signature Resolving Key (CSRK)
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SigningKey {
    /// Key value
    pub key: [u8; 16],
    /// Counter for signed data
    pub counter: u32,
}

impl SigningKey {
    pub fn new(key: [u8; 16]) -> Self {
        Self { key, counter: 0 }
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

/// Keys and properties of one pairing with a peer
#[derive(Clone, PartialEq, Eq)]
pub struct KeySet {
    /// Identity address of the peer, or its connection address if the peer
    /// did not distribute one
    pub address: LeAddress,
    /// Encryption key size negotiated during pairing
    pub enc_size: u8,
    pub flags: KeyFlags,
    /// Key used when this device encrypts the link as central: the
    /// Secure Connections LTK or the LTK the peer distributed.
    pub ltk: Option<LongTermKey>,
    /// Legacy LTK this device distributed, answered when the peer
    /// encrypts the link as central.
    pub local_ltk: Option<LongTermKey>,
    /// Identity Resolving Key of the peer
    pub irk: Option<[u8; 16]>,
    pub local_csrk: Option<SigningKey>,
    pub remote_csrk: Option<SigningKey>,
    /// BR/EDR link key derived from the Secure Connections LTK
    pub link_key: Option<[u8; 16]>,
}

impl KeySet {
    /// Create an empty key set for a peer
    pub fn new(address: LeAddress) -> Self {
        Self {
            address,
            enc_size: 0,
            flags: KeyFlags::empty(),
            ltk: None,
            local_ltk: None,
            irk: None,
            local_csrk: None,
            remote_csrk: None,
            link_key: None,
        }
    }

    /// Whether the set can encrypt a link in either role
    pub fn has_ltk(&self) -> bool {
        self.ltk.is_some() || self.local_ltk.is_some()
    }

    pub fn is_authenticated(&self) -> bool {
        self.flags.contains(KeyFlags::AUTHENTICATED)
    }

    pub fn is_secure_connections(&self) -> bool {
        self.flags.contains(KeyFlags::SECURE_CONNECTIONS)
    }

    pub fn is_debug(&self) -> bool {
        self.flags.contains(KeyFlags::DEBUG)
    }

    /// Security level a link encrypted with these keys reaches
    pub fn security_level(&self) -> SecurityLevel {
        if !self.has_ltk() {
            SecurityLevel::None
        } else if !self.is_authenticated() {
            SecurityLevel::EncryptionOnly
        } else if self.is_secure_connections() && self.enc_size == 16 {
            SecurityLevel::SecureConnections
        } else {
            SecurityLevel::EncryptionWithAuthentication
        }
    }

    /// Whether encrypting with these keys reaches `required`
    pub fn satisfies(&self, required: SecurityLevel) -> bool {
        self.security_level() >= required
    }
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySet")
            .field("address", &self.address)
            .field("enc_size", &self.enc_size)
            .field("flags", &self.flags)
            .field("ltk", &self.ltk)
            .field("local_ltk", &self.local_ltk)
            .field("irk", &self.irk.map(|_| ".."))
            .field("local_csrk", &self.local_csrk)
            .field("remote_csrk", &self.remote_csrk)
            .field("link_key", &self.link_key.map(|_| ".."))
            .finish()
    }
}

/// Key Store trait for persistent storage of security keys
///
/// Implementations are shared between the manager and the application, so
/// every method takes `&self`.
pub trait KeyStore {
    /// Save keys for a device, replacing any previous entry
    fn save_keys(&self, address: &LeAddress, keys: &KeySet) -> SmpResult<()>;

    /// Load keys for a device
    fn load_keys(&self, address: &LeAddress) -> SmpResult<Option<KeySet>>;

    /// Delete keys for a device
    fn delete_keys(&self, address: &LeAddress) -> SmpResult<()>;

    /// Identity address a connection address belongs to, if bonded
    fn resolve_identity(&self, address: &LeAddress) -> SmpResult<Option<LeAddress>>;

    /// Get all paired devices
    fn get_paired_devices(&self) -> SmpResult<Vec<LeAddress>>;
}

impl<T: KeyStore + ?Sized> KeyStore for Arc<T> {
    fn save_keys(&self, address: &LeAddress, keys: &KeySet) -> SmpResult<()> {
        (**self).save_keys(address, keys)
    }

    fn load_keys(&self, address: &LeAddress) -> SmpResult<Option<KeySet>> {
        (**self).load_keys(address)
    }

    fn delete_keys(&self, address: &LeAddress) -> SmpResult<()> {
        (**self).delete_keys(address)
    }

    fn resolve_identity(&self, address: &LeAddress) -> SmpResult<Option<LeAddress>> {
        (**self).resolve_identity(address)
    }

    fn get_paired_devices(&self) -> SmpResult<Vec<LeAddress>> {
        (**self).get_paired_devices()
    }
}

/// In-memory implementation of KeyStore
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    /// Device key storage
    keys: RwLock<HashMap<LeAddress, KeySet>>,
}

fn poisoned<T>(_: T) -> SmpError {
    SmpError::KeyStoreError("key store lock poisoned".to_string())
}

impl MemoryKeyStore {
    /// Create a new empty in-memory key store
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.read().map(|store| store.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyStore for MemoryKeyStore {
    fn save_keys(&self, address: &LeAddress, keys: &KeySet) -> SmpResult<()> {
        let mut store = self.keys.write().map_err(poisoned)?;
        store.insert(*address, keys.clone());
        Ok(())
    }

    fn load_keys(&self, address: &LeAddress) -> SmpResult<Option<KeySet>> {
        let store = self.keys.read().map_err(poisoned)?;
        Ok(store.get(address).cloned())
    }

    fn delete_keys(&self, address: &LeAddress) -> SmpResult<()> {
        let mut store = self.keys.write().map_err(poisoned)?;
        store.remove(address);
        Ok(())
    }

    fn resolve_identity(&self, address: &LeAddress) -> SmpResult<Option<LeAddress>> {
        let store = self.keys.read().map_err(poisoned)?;

        if store.contains_key(address) {
            return Ok(Some(*address));
        }

        if !address.is_resolvable_private() {
            return Ok(None);
        }

        for (identity, keys) in store.iter() {
            let Some(irk) = keys.irk.as_ref() else {
                continue;
            };

            match crypto::irk_matches(irk, address) {
                Ok(true) => return Ok(Some(*identity)),
                Ok(false) => {}
                Err(e) => warn!(%identity, "failed to resolve address: {}", e),
            }
        }

        Ok(None)
    }

    fn get_paired_devices(&self) -> SmpResult<Vec<LeAddress>> {
        let store = self.keys.read().map_err(poisoned)?;
        let devices = store.keys().cloned().collect();
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> LeAddress {
        LeAddress::public([0x11, 0x22, 0x33, 0x44, 0x55, 0x66])
    }

    fn bonded(flags: KeyFlags, enc_size: u8) -> KeySet {
        let mut keys = KeySet::new(peer());
        keys.flags = flags;
        keys.enc_size = enc_size;
        keys.ltk = Some(LongTermKey::secure_connections([0x5a; 16]));
        keys
    }

    #[test]
    fn test_security_level_from_flags() {
        assert_eq!(KeySet::new(peer()).security_level(), SecurityLevel::None);
        assert_eq!(
            bonded(KeyFlags::empty(), 16).security_level(),
            SecurityLevel::EncryptionOnly
        );
        assert_eq!(
            bonded(KeyFlags::AUTHENTICATED, 16).security_level(),
            SecurityLevel::EncryptionWithAuthentication
        );
        assert_eq!(
            bonded(KeyFlags::AUTHENTICATED | KeyFlags::SECURE_CONNECTIONS, 16).security_level(),
            SecurityLevel::SecureConnections
        );
        // Short keys never reach the highest level
        assert_eq!(
            bonded(KeyFlags::AUTHENTICATED | KeyFlags::SECURE_CONNECTIONS, 12).security_level(),
            SecurityLevel::EncryptionWithAuthentication
        );
    }

    #[test]
    fn test_satisfies() {
        let keys = bonded(KeyFlags::AUTHENTICATED, 16);
        assert!(keys.satisfies(SecurityLevel::EncryptionOnly));
        assert!(keys.satisfies(SecurityLevel::EncryptionWithAuthentication));
        assert!(!keys.satisfies(SecurityLevel::SecureConnections));
    }

    #[test]
    fn test_ltk_debug_redacts_key() {
        let ltk = LongTermKey::new([0xAB; 16], 0x1234, [1; 8]);
        let text = format!("{:?}", ltk);
        assert!(!text.contains("ab, ab") && !text.contains("171"));
        assert!(text.contains("4660"));
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryKeyStore::new();
        let keys = bonded(KeyFlags::AUTHENTICATED, 16);

        store.save_keys(&peer(), &keys).unwrap();
        assert_eq!(store.load_keys(&peer()).unwrap(), Some(keys));
        assert_eq!(store.get_paired_devices().unwrap(), vec![peer()]);

        store.delete_keys(&peer()).unwrap();
        assert!(store.load_keys(&peer()).unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_resolve_identity_with_irk() {
        let irk = [
            0x9b, 0x7d, 0x39, 0x0a, 0xa6, 0x10, 0x10, 0x34, 0x05, 0xad, 0xc8, 0x57, 0xa3, 0x34,
            0x02, 0xec,
        ];
        let prand = [0x94, 0x81, 0x70];
        let hash = crypto::ah(&irk, &prand).unwrap();
        let mut rpa = [0u8; 6];
        rpa[0..3].copy_from_slice(&hash);
        rpa[3..6].copy_from_slice(&prand);

        let store = MemoryKeyStore::new();
        let mut keys = bonded(KeyFlags::empty(), 16);
        keys.irk = Some(irk);
        store.save_keys(&peer(), &keys).unwrap();

        let rpa = LeAddress::random(rpa);
        assert!(rpa.is_resolvable_private());
        assert_eq!(store.resolve_identity(&rpa).unwrap(), Some(peer()));
        assert_eq!(store.resolve_identity(&peer()).unwrap(), Some(peer()));

        let stranger = LeAddress::random([1, 2, 3, 0x11, 0x22, 0x73]);
        assert_eq!(store.resolve_identity(&stranger).unwrap(), None);
    }

    #[test]
    fn test_shared_store_through_arc() {
        let store = Arc::new(MemoryKeyStore::new());
        let shared: Arc<dyn KeyStore + Send + Sync> = store.clone();
        shared
            .save_keys(&peer(), &bonded(KeyFlags::empty(), 7))
            .unwrap();
        assert_eq!(store.len(), 1);
    }
}
