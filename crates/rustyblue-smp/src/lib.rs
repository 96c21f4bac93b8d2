//! RustyBlue SMP - the Bluetooth LE Security Manager
//!
//! This library implements LE pairing and key management: the Security
//! Manager Protocol state machine, the security toolbox functions, an ECDH
//! key agreement service running off the connection's event path, and key
//! distribution and storage for bonded devices.
//!
//! The crate does not talk to a controller itself. Lower layers feed it
//! PDUs and controller events and implement [`SmpTransport`] to carry out
//! what it asks for.

pub mod gap;
pub mod smp;

// Re-export common types for convenience
pub use gap::{AddressType, BdAddr, LeAddress, Role};
pub use smp::{
    FailureReason, IoCapability, KeySet, KeyStore, MemoryKeyStore, PairingMethod, SecurityLevel,
    SmpConfig, SmpError, SmpEvent, SmpManager, SmpResult, SmpTransport,
};
