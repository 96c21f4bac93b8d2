//! Security Manager Protocol (SMP) implementation
//!
//! This module implements the LE Security Manager, which is responsible for:
//! - Pairing devices with legacy or Secure Connections pairing
//! - Generating and distributing encryption, identity and signing keys
//! - Authenticating the peer with passkeys, numeric comparison or OOB data
//! - Re-encrypting links with the keys of an existing bond
//!
//! [`SmpManager`] is the entry point. It owns the pairing state of every
//! connection and talks to the lower layers through [`SmpTransport`].

mod config;
mod constants;
mod crypto;
mod ecdh;
mod keys;
mod manager;
mod method;
mod pdu;
mod session;
mod types;


// Re-export public API
pub use self::config::*;
pub use self::constants::*;
pub use self::ecdh::{DhKey, EcdhEvent, EcdhService, PublicKey};
pub use self::keys::*;
pub use self::manager::{SmpEventCallback, SmpManager, SmpTransport};
pub use self::method::pairing_method;
pub use self::pdu::*;
pub use self::session::{EncryptionRequest, Phase};
pub use self::types::*;

/// Security toolbox functions
pub mod toolbox {
    pub use super::crypto::*;
}
