//! Elliptic curve key agreement service
//!
//! A single P-256 key pair is shared by every pairing session of a host.
//! Key generation and Diffie-Hellman computation run on a dedicated worker
//! thread that owns the private key; requests and results travel over
//! `flume` channels. Results are only applied to the service state when
//! the owner drains them on its own event path, so the worker never touches
//! session state.
//!
//! At most one operation is outstanding at any time. A second generation
//! request joins the current one through the waiter set instead of
//! starting another.

use super::constants::*;
use super::types::*;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, FieldBytes, SecretKey};
use rand_core::OsRng;
use std::collections::BTreeSet;
use std::fmt;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// P-256 public key as carried in the Pairing Public Key PDU: X then Y,
/// each least significant byte first.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey {
    pub x: [u8; 32],
    pub y: [u8; 32],
}

impl PublicKey {
    pub fn new(x: [u8; 32], y: [u8; 32]) -> Self {
        Self { x, y }
    }

    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        x.copy_from_slice(&bytes[0..32]);
        y.copy_from_slice(&bytes[32..64]);
        Self { x, y }
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[0..32].copy_from_slice(&self.x);
        out[32..64].copy_from_slice(&self.y);
        out
    }

    /// The published Secure Connections debug public key.
    pub fn debug_key() -> Self {
        let mut x = SMP_DEBUG_PUBLIC_KEY_X;
        let mut y = SMP_DEBUG_PUBLIC_KEY_Y;
        x.reverse();
        y.reverse();
        Self { x, y }
    }

    pub fn is_debug_key(&self) -> bool {
        *self == Self::debug_key()
    }

    /// Decode into a curve point; `None` if the point is not on the curve.
    pub(crate) fn to_p256(&self) -> Option<p256::PublicKey> {
        let mut x = self.x;
        let mut y = self.y;
        x.reverse();
        y.reverse();

        let point =
            EncodedPoint::from_affine_coordinates(&FieldBytes::from(x), &FieldBytes::from(y), false);
        Option::from(p256::PublicKey::from_encoded_point(&point))
    }

    pub(crate) fn from_p256(key: &p256::PublicKey) -> Option<Self> {
        let point = key.to_encoded_point(false);
        let mut out = Self {
            x: [0; 32],
            y: [0; 32],
        };
        out.x.copy_from_slice(point.x()?);
        out.y.copy_from_slice(point.y()?);
        out.x.reverse();
        out.y.reverse();
        Some(out)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey(x: {})", hex::encode(self.x))
    }
}

/// Diffie-Hellman shared secret, least significant byte first.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DhKey(pub [u8; 32]);

impl fmt::Debug for DhKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DhKey(..)")
    }
}

enum EcdhJob {
    GenerateKey { debug: bool },
    ComputeDhKey {
        requester: ConnectionHandle,
        peer: PublicKey,
    },
    Shutdown,
}

enum EcdhCompletion {
    PublicKey(Option<PublicKey>),
    DhKey {
        requester: ConnectionHandle,
        dhkey: Option<DhKey>,
    },
}

/// A finished operation, as seen by the owner of the service
#[derive(Debug)]
pub enum EcdhEvent {
    /// Key generation finished; every waiter registered until now is
    /// listed and the waiter set is empty again.
    PublicKeyReady {
        key: Option<PublicKey>,
        waiters: Vec<ConnectionHandle>,
    },
    /// The shared secret for `requester` is ready, or failed.
    DhKeyReady {
        requester: ConnectionHandle,
        dhkey: Option<DhKey>,
    },
}

/// Owner side of the key agreement worker
pub struct EcdhService {
    jobs: flume::Sender<EcdhJob>,
    completions: flume::Receiver<EcdhCompletion>,
    worker: Option<JoinHandle<()>>,
    debug_keys: bool,
    public_key: Option<PublicKey>,
    generating: bool,
    dhkey_for: Option<ConnectionHandle>,
    waiters: BTreeSet<ConnectionHandle>,
}

impl EcdhService {
    /// Start the worker thread. No key pair exists until
    /// [`generate_public_key`](Self::generate_public_key) completes.
    pub fn new(debug_keys: bool) -> SmpResult<Self> {
        let (jobs, job_rx) = flume::unbounded();
        let (completion_tx, completions) = flume::unbounded();

        let worker = thread::Builder::new()
            .name("smp-ecdh".to_string())
            .spawn(move || run_worker(job_rx, completion_tx))
            .map_err(|e| SmpError::CryptoError(format!("failed to start ECDH worker: {}", e)))?;

        Ok(Self {
            jobs,
            completions,
            worker: Some(worker),
            debug_keys,
            public_key: None,
            generating: false,
            dhkey_for: None,
            waiters: BTreeSet::new(),
        })
    }

    /// Current local public key, if one has been generated.
    pub fn public_key(&self) -> Option<&PublicKey> {
        self.public_key.as_ref()
    }

    pub fn debug_keys(&self) -> bool {
        self.debug_keys
    }

    /// Switch to or from the debug key pair. Takes effect on the next
    /// generation.
    pub fn set_debug_keys(&mut self, enabled: bool) {
        self.debug_keys = enabled;
    }

    pub fn is_generating(&self) -> bool {
        self.generating
    }

    /// Connection whose shared secret is being computed.
    pub fn dhkey_in_flight(&self) -> Option<ConnectionHandle> {
        self.dhkey_for
    }

    /// Whether a new operation can be started right now.
    pub fn is_idle(&self) -> bool {
        !self.generating && self.dhkey_for.is_none()
    }

    /// Start generating a fresh key pair, discarding the current one.
    pub fn generate_public_key(&mut self) -> SmpResult<()> {
        if !self.is_idle() {
            return Err(SmpError::Busy);
        }

        self.submit(EcdhJob::GenerateKey {
            debug: self.debug_keys,
        })?;
        self.generating = true;
        self.public_key = None;
        debug!(debug_keys = self.debug_keys, "public key generation started");
        Ok(())
    }

    /// Register a connection to be told about the next generated key.
    pub fn add_waiter(&mut self, conn: ConnectionHandle) {
        self.waiters.insert(conn);
    }

    pub fn remove_waiter(&mut self, conn: ConnectionHandle) {
        self.waiters.remove(&conn);
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    /// Start computing the shared secret with `peer` on behalf of
    /// `requester`.
    pub fn compute_dhkey(&mut self, requester: ConnectionHandle, peer: &PublicKey) -> SmpResult<()> {
        if !self.is_idle() {
            return Err(SmpError::Busy);
        }

        if self.public_key.is_none() {
            return Err(SmpError::InvalidState);
        }

        self.submit(EcdhJob::ComputeDhKey {
            requester,
            peer: *peer,
        })?;
        self.dhkey_for = Some(requester);
        debug!(conn = requester, "DHKey computation started");
        Ok(())
    }

    fn submit(&self, job: EcdhJob) -> SmpResult<()> {
        self.jobs
            .send(job)
            .map_err(|_| SmpError::CryptoError("ECDH worker stopped".to_string()))
    }

    /// Apply one finished operation without blocking.
    pub fn poll(&mut self) -> Option<EcdhEvent> {
        let completion = self.completions.try_recv().ok()?;
        Some(self.complete(completion))
    }

    /// Wait up to `timeout` for one finished operation.
    pub fn wait(&mut self, timeout: Duration) -> Option<EcdhEvent> {
        let completion = self.completions.recv_timeout(timeout).ok()?;
        Some(self.complete(completion))
    }

    fn complete(&mut self, completion: EcdhCompletion) -> EcdhEvent {
        match completion {
            EcdhCompletion::PublicKey(key) => {
                self.generating = false;
                self.public_key = key;

                match &key {
                    Some(key) => trace!(x = %hex::encode(key.x), "public key ready"),
                    None => warn!("public key generation failed"),
                }

                let waiters = std::mem::take(&mut self.waiters).into_iter().collect();
                EcdhEvent::PublicKeyReady { key, waiters }
            }
            EcdhCompletion::DhKey { requester, dhkey } => {
                self.dhkey_for = None;
                if dhkey.is_none() {
                    warn!(conn = requester, "DHKey computation failed");
                }
                EcdhEvent::DhKeyReady { requester, dhkey }
            }
        }
    }
}

impl Drop for EcdhService {
    fn drop(&mut self) {
        let _ = self.jobs.send(EcdhJob::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(jobs: flume::Receiver<EcdhJob>, completions: flume::Sender<EcdhCompletion>) {
    let mut secret: Option<SecretKey> = None;

    while let Ok(job) = jobs.recv() {
        let completion = match job {
            EcdhJob::GenerateKey { debug } => {
                secret = None;
                let public_key = match generate_key_pair(debug) {
                    Some((new_secret, public_key)) => {
                        secret = Some(new_secret);
                        Some(public_key)
                    }
                    None => None,
                };
                EcdhCompletion::PublicKey(public_key)
            }
            EcdhJob::ComputeDhKey { requester, peer } => EcdhCompletion::DhKey {
                requester,
                dhkey: secret.as_ref().and_then(|secret| shared_secret(secret, &peer)),
            },
            EcdhJob::Shutdown => break,
        };

        if completions.send(completion).is_err() {
            break;
        }
    }
}

fn generate_key_pair(debug: bool) -> Option<(SecretKey, PublicKey)> {
    if debug {
        let secret = SecretKey::from_slice(&SMP_DEBUG_PRIVATE_KEY).ok()?;
        let public_key = PublicKey::from_p256(&secret.public_key())?;
        return Some((secret, public_key));
    }

    loop {
        let secret = SecretKey::random(&mut OsRng);
        let public_key = PublicKey::from_p256(&secret.public_key())?;

        // A random key must never collide with the published debug key.
        if !public_key.is_debug_key() {
            return Some((secret, public_key));
        }
    }
}

fn shared_secret(secret: &SecretKey, peer: &PublicKey) -> Option<DhKey> {
    let peer = peer.to_p256()?;
    let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());

    let mut dhkey = DhKey([0; 32]);
    dhkey.0.copy_from_slice(shared.raw_secret_bytes());
    dhkey.0.reverse();
    Some(dhkey)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(10);

    fn be32(s: &str) -> [u8; 32] {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    fn generated(service: &mut EcdhService) -> PublicKey {
        service.generate_public_key().unwrap();
        match service.wait(WAIT) {
            Some(EcdhEvent::PublicKeyReady { key: Some(key), .. }) => key,
            other => panic!("unexpected completion {:?}", other),
        }
    }

    #[test]
    fn test_debug_key_pair_matches_published_key() {
        let (_, public_key) = generate_key_pair(true).unwrap();
        assert!(public_key.is_debug_key());
        assert!(public_key.to_p256().is_some());
    }

    #[test]
    fn test_published_dhkey_vector() {
        let secret = SecretKey::from_slice(&be32(
            "55188b3d32f6bb9a900afcfbeed4e72a59cb9ac2f19d7cfb6b4fdd49f47fc5fd",
        ))
        .unwrap();

        let dhkey = shared_secret(&secret, &PublicKey::debug_key()).unwrap();
        let mut expected =
            be32("ec0234a357c8ad05341010a60a397d9b99796b13b4f866f1868d34f373bfa698");
        expected.reverse();
        assert_eq!(dhkey.0, expected);
    }

    #[test]
    fn test_generated_key_is_valid_and_not_debug() {
        let mut service = EcdhService::new(false).unwrap();
        let key = generated(&mut service);
        assert!(!key.is_debug_key());
        assert!(key.to_p256().is_some());
        assert_eq!(service.public_key(), Some(&key));
        assert!(service.is_idle());
    }

    #[test]
    fn test_waiters_notified_once() {
        let mut service = EcdhService::new(true).unwrap();
        service.add_waiter(1);
        service.add_waiter(2);
        service.generate_public_key().unwrap();
        service.add_waiter(3);

        match service.wait(WAIT) {
            Some(EcdhEvent::PublicKeyReady { key, waiters }) => {
                assert_eq!(key, Some(PublicKey::debug_key()));
                assert_eq!(waiters, vec![1, 2, 3]);
            }
            other => panic!("unexpected completion {:?}", other),
        }
        assert!(!service.has_waiters());
    }

    #[test]
    fn test_dhkey_rejected_while_generating() {
        let mut service = EcdhService::new(false).unwrap();
        generated(&mut service);

        service.generate_public_key().unwrap();
        let peer = PublicKey::debug_key();
        assert_eq!(service.compute_dhkey(7, &peer), Err(SmpError::Busy));
        assert_eq!(service.generate_public_key(), Err(SmpError::Busy));
        assert!(service.dhkey_in_flight().is_none());
    }

    #[test]
    fn test_dhkey_requires_local_key() {
        let mut service = EcdhService::new(false).unwrap();
        let peer = PublicKey::debug_key();
        assert_eq!(service.compute_dhkey(1, &peer), Err(SmpError::InvalidState));
    }

    #[test]
    fn test_second_dhkey_rejected() {
        let mut service = EcdhService::new(false).unwrap();
        generated(&mut service);

        let peer = PublicKey::debug_key();
        service.compute_dhkey(1, &peer).unwrap();
        assert_eq!(service.compute_dhkey(2, &peer), Err(SmpError::Busy));
        assert_eq!(service.dhkey_in_flight(), Some(1));
    }

    #[test]
    fn test_dhkey_agreement_between_services() {
        let mut alice = EcdhService::new(false).unwrap();
        let mut bob = EcdhService::new(false).unwrap();
        let alice_key = generated(&mut alice);
        let bob_key = generated(&mut bob);

        alice.compute_dhkey(1, &bob_key).unwrap();
        bob.compute_dhkey(2, &alice_key).unwrap();

        let a = match alice.wait(WAIT) {
            Some(EcdhEvent::DhKeyReady { requester: 1, dhkey: Some(dhkey) }) => dhkey,
            other => panic!("unexpected completion {:?}", other),
        };
        let b = match bob.wait(WAIT) {
            Some(EcdhEvent::DhKeyReady { requester: 2, dhkey: Some(dhkey) }) => dhkey,
            other => panic!("unexpected completion {:?}", other),
        };
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_peer_key_fails_closed() {
        let mut service = EcdhService::new(false).unwrap();
        generated(&mut service);

        let bogus = PublicKey::new([0x11; 32], [0x22; 32]);
        service.compute_dhkey(4, &bogus).unwrap();
        match service.wait(WAIT) {
            Some(EcdhEvent::DhKeyReady { requester: 4, dhkey: None }) => {}
            other => panic!("unexpected completion {:?}", other),
        }
        assert!(service.is_idle());
    }
}
