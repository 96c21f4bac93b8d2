//! Security Manager Protocol manager implementation
//!
//! The manager owns one [`PairingSession`] per connection and is the only
//! place where sessions meet the outside world: inbound PDUs and controller
//! events come in through its methods, and the work the sessions ask for is
//! carried out on the transport, the key store and the ECDH service.

use super::config::SmpConfig;
use super::crypto;
use super::ecdh::{DhKey, EcdhEvent, EcdhService, PublicKey};
use super::keys::*;
use super::session::{Action, EncryptionRequest, Env, PairingSession, Phase};
use super::types::*;
use crate::gap::{LeAddress, Role};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Lower layers the manager drives
pub trait SmpTransport: Send {
    /// Send a PDU on the SMP fixed channel of `conn`
    fn send(&mut self, conn: ConnectionHandle, pdu: &[u8]) -> SmpResult<()>;

    /// Ask the controller to start or refresh encryption on `conn`. The
    /// outcome is reported back through
    /// [`SmpManager::on_encryption_changed`].
    fn start_encryption(&mut self, conn: ConnectionHandle, request: &EncryptionRequest) -> SmpResult<()>;
}

/// Type for SMP event callback
pub type SmpEventCallback = Box<dyn FnMut(SmpEvent) + Send>;

/// Security Manager Protocol manager
pub struct SmpManager {
    config: SmpConfig,

    /// Pairing state, one entry per connection
    sessions: HashMap<ConnectionHandle, PairingSession>,

    transport: Box<dyn SmpTransport>,

    /// Bonded devices
    store: Arc<dyn KeyStore + Send + Sync>,

    rng: Box<dyn RngCore + Send>,

    ecdh: EcdhService,

    /// DHKey requests waiting for the ECDH service
    dhkey_queue: VecDeque<(ConnectionHandle, PublicKey)>,

    event_callback: Option<SmpEventCallback>,

    /// Events not yet taken, when no callback is registered
    events: VecDeque<SmpEvent>,
}

impl SmpManager {
    /// Create a new SMP manager and start generating the local key pair.
    ///
    /// An all-zero identity root is replaced with a random one.
    pub fn new(
        mut config: SmpConfig,
        transport: Box<dyn SmpTransport>,
        store: Arc<dyn KeyStore + Send + Sync>,
    ) -> SmpResult<Self> {
        config.validate()?;

        let mut rng: Box<dyn RngCore + Send> = Box::new(StdRng::from_entropy());
        if config.identity_root == [0; 16] {
            rng.fill_bytes(&mut config.identity_root);
            debug!("generated random identity root");
        }

        let mut ecdh = EcdhService::new(config.use_debug_keys)?;
        ecdh.generate_public_key()?;

        Ok(Self {
            config,
            sessions: HashMap::new(),
            transport,
            store,
            rng,
            ecdh,
            dhkey_queue: VecDeque::new(),
            event_callback: None,
            events: VecDeque::new(),
        })
    }

    /// Replace the random number source
    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }

    /// Set the event callback. Without one, events are queued for
    /// [`poll_event`](Self::poll_event).
    pub fn set_event_callback<F>(&mut self, callback: F)
    where
        F: FnMut(SmpEvent) + Send + 'static,
    {
        self.event_callback = Some(Box::new(callback));
    }

    /// Take the oldest queued event
    pub fn poll_event(&mut self) -> Option<SmpEvent> {
        self.events.pop_front()
    }

    pub fn config(&self) -> &SmpConfig {
        &self.config
    }

    pub fn key_store(&self) -> &Arc<dyn KeyStore + Send + Sync> {
        &self.store
    }

    /// Current local public key, once generated
    pub fn public_key(&self) -> Option<PublicKey> {
        self.ecdh.public_key().copied()
    }

    // ---- connection lifecycle ----

    /// Create the pairing state for a new LE connection
    pub fn connected(
        &mut self,
        conn: ConnectionHandle,
        role: Role,
        local: LeAddress,
        remote: LeAddress,
    ) -> SmpResult<()> {
        if self.sessions.contains_key(&conn) {
            return Err(SmpError::InvalidParameter(format!(
                "connection {} already known",
                conn
            )));
        }

        let identity = self.store.resolve_identity(&remote)?.unwrap_or(remote);
        if identity != remote {
            debug!(conn, %remote, %identity, "peer resolved from bond");
        }

        info!(conn, ?role, %remote, "SMP session created");
        self.sessions
            .insert(conn, PairingSession::new(conn, role, local, remote, identity));
        Ok(())
    }

    /// Destroy the pairing state of a closed connection
    pub fn disconnected(&mut self, conn: ConnectionHandle) -> SmpResult<()> {
        let mut session = self
            .sessions
            .remove(&conn)
            .ok_or(SmpError::ConnectionNotFound)?;

        session.on_disconnected();
        let actions = session.take_actions();
        self.execute(conn, actions);

        self.ecdh.remove_waiter(conn);
        self.dhkey_queue.retain(|(waiting, _)| *waiting != conn);

        // Keys from a debug key pair do not outlive the link
        if let Some(keys) = session.link_keys().filter(|keys| keys.is_debug()) {
            debug!(conn, address = %keys.address, "dropping debug keys");
            if let Err(e) = self.store.delete_keys(&keys.address) {
                warn!(conn, "failed to delete debug keys: {}", e);
            }
        }

        info!(conn, "SMP session destroyed");
        Ok(())
    }

    // ---- inbound ----

    /// Process a PDU received on the SMP fixed channel
    pub fn handle_smp_packet(&mut self, conn: ConnectionHandle, data: &[u8]) -> SmpResult<()> {
        self.with_session(conn, |session, env| session.handle_pdu(env, data))
    }

    /// The controller finished an encryption procedure. `status` is the
    /// HCI status of the encryption change event.
    pub fn on_encryption_changed(&mut self, conn: ConnectionHandle, status: u8) -> SmpResult<()> {
        self.with_session(conn, |session, env| session.on_encryption_changed(env, status))
    }

    /// The controller asks for the key to encrypt `conn` with. `None`
    /// means a negative reply.
    pub fn long_term_key_request(
        &mut self,
        conn: ConnectionHandle,
        rand: [u8; 8],
        ediv: u16,
    ) -> SmpResult<Option<[u8; 16]>> {
        self.with_session(conn, |session, env| {
            session.long_term_key_request(env, rand, ediv)
        })
    }

    // ---- timers ----

    /// Fail every procedure whose timer expired
    pub fn process_timeouts(&mut self) -> usize {
        self.process_timeouts_at(Instant::now())
    }

    pub fn process_timeouts_at(&mut self, now: Instant) -> usize {
        let expired: Vec<ConnectionHandle> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.deadline().is_some_and(|deadline| deadline <= now))
            .map(|(conn, _)| *conn)
            .collect();

        for conn in &expired {
            self.ecdh.remove_waiter(*conn);
            self.dhkey_queue.retain(|(waiting, _)| waiting != conn);
            let _ = self.with_session_at(*conn, now, |session, _| session.on_timeout());
        }

        expired.len()
    }

    /// Earliest pending procedure timeout
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sessions
            .values()
            .filter_map(|session| session.deadline())
            .min()
    }

    // ---- key agreement ----

    /// Apply every finished ECDH operation without blocking
    pub fn process_crypto_events(&mut self) -> usize {
        let mut count = 0;
        while let Some(event) = self.ecdh.poll() {
            self.handle_ecdh_event(event);
            count += 1;
        }
        count
    }

    /// Wait up to `timeout` for one ECDH operation to finish and apply it
    pub fn wait_crypto_event(&mut self, timeout: Duration) -> bool {
        match self.ecdh.wait(timeout) {
            Some(event) => {
                self.handle_ecdh_event(event);
                true
            }
            None => false,
        }
    }

    /// Whether a key agreement operation is queued or running
    pub fn crypto_busy(&self) -> bool {
        !self.ecdh.is_idle() || !self.dhkey_queue.is_empty() || self.ecdh.has_waiters()
    }

    fn handle_ecdh_event(&mut self, event: EcdhEvent) {
        match event {
            EcdhEvent::PublicKeyReady { key, waiters } => {
                if key.is_some() {
                    info!("local public key ready");
                }
                for conn in waiters {
                    let _ = self.with_session(conn, |session, env| session.on_public_key(env, key));
                }
            }
            EcdhEvent::DhKeyReady { requester, dhkey } => {
                if self
                    .with_session(requester, |session, env| session.on_dhkey(env, dhkey))
                    .is_err()
                {
                    debug!(conn = requester, "DHKey for a closed connection");
                }
            }
        }

        self.start_next_ecdh();
    }

    /// Start whatever key agreement work is waiting, once the service is
    /// free
    fn start_next_ecdh(&mut self) {
        if !self.ecdh.is_idle() {
            return;
        }

        if self.ecdh.has_waiters() && self.ecdh.public_key().is_none() {
            if let Err(e) = self.ecdh.generate_public_key() {
                warn!("failed to start key generation: {}", e);
            }
            return;
        }

        while let Some((conn, peer)) = self.dhkey_queue.pop_front() {
            let waiting = self
                .sessions
                .get(&conn)
                .is_some_and(|session| session.awaiting_dhkey());
            if !waiting {
                continue;
            }

            if self.start_dhkey(conn, peer) {
                return;
            }
        }
    }

    /// Submit a DHKey computation; a refusal fails the session
    fn start_dhkey(&mut self, conn: ConnectionHandle, peer: PublicKey) -> bool {
        match self.ecdh.compute_dhkey(conn, &peer) {
            Ok(()) => true,
            Err(e) => {
                warn!(conn, "failed to start DHKey computation: {}", e);
                let _ = self.with_session(conn, |session, env| {
                    session.on_dhkey(env, None::<DhKey>)
                });
                false
            }
        }
    }

    fn request_public_key(&mut self, conn: ConnectionHandle) {
        self.ecdh.add_waiter(conn);

        if self.ecdh.is_idle() && self.ecdh.public_key().is_none() {
            if let Err(e) = self.ecdh.generate_public_key() {
                warn!(conn, "failed to start key generation: {}", e);
                self.ecdh.remove_waiter(conn);
                let _ = self.with_session(conn, |session, env| session.on_public_key(env, None));
            }
        }
    }

    fn request_dhkey(&mut self, conn: ConnectionHandle, peer: PublicKey) {
        if self.ecdh.is_idle() && self.dhkey_queue.is_empty() {
            self.start_dhkey(conn, peer);
            return;
        }

        debug!(conn, "ECDH service busy, DHKey request queued");
        self.dhkey_queue.push_back((conn, peer));
    }

    // ---- local procedures and user responses ----

    /// Raise the security of `conn` to the configured level, by encrypting
    /// with a stored key or by pairing
    pub fn start_security(&mut self, conn: ConnectionHandle) -> SmpResult<()> {
        self.with_session(conn, |session, env| session.start_security(env))?
    }

    /// Passkey typed by the user
    pub fn passkey_entry(&mut self, conn: ConnectionHandle, passkey: u32) -> SmpResult<()> {
        self.with_session(conn, |session, env| session.passkey_entry(env, passkey))?
    }

    /// The user confirmed that both devices show the same number
    pub fn passkey_confirm(&mut self, conn: ConnectionHandle) -> SmpResult<()> {
        self.with_session(conn, |session, env| session.passkey_confirm(env))?
    }

    /// The user allowed an unauthenticated pairing
    pub fn pairing_confirm(&mut self, conn: ConnectionHandle) -> SmpResult<()> {
        self.with_session(conn, |session, env| session.pairing_confirm(env))?
    }

    /// The user rejected or abandoned the pending interaction
    pub fn auth_cancel(&mut self, conn: ConnectionHandle) -> SmpResult<()> {
        self.with_session(conn, |session, _| session.auth_cancel())?
    }

    /// Temporary key received out of band for legacy pairing
    pub fn oob_set_tk(&mut self, conn: ConnectionHandle, tk: [u8; 16]) -> SmpResult<()> {
        self.with_session(conn, |session, env| session.oob_set_tk(env, tk))?
    }

    /// Secure Connections OOB data: what this device gave the peer, and
    /// what it received from the peer
    pub fn oob_set_sc_data(
        &mut self,
        conn: ConnectionHandle,
        local: Option<OobData>,
        remote: Option<OobData>,
    ) -> SmpResult<()> {
        self.with_session(conn, |session, env| session.oob_set_sc_data(env, local, remote))?
    }

    /// Generate OOB data to hand to a peer. Valid while the current public
    /// key is.
    pub fn generate_sc_oob_data(&mut self) -> SmpResult<OobData> {
        let key = self.ecdh.public_key().copied().ok_or(SmpError::InvalidState)?;

        let mut r = [0u8; 16];
        self.rng.fill_bytes(&mut r);
        let c = crypto::f4(&key.x, &key.x, &r, 0)?;

        Ok(OobData { r, c })
    }

    /// Tell the peer about passkey entry progress
    pub fn send_keypress(
        &mut self,
        conn: ConnectionHandle,
        notification: KeypressNotificationType,
    ) -> SmpResult<()> {
        self.with_session(conn, |session, env| session.send_keypress(env, notification))?
    }

    /// Forget the bond with `address`
    pub fn unpair(&mut self, address: &LeAddress) -> SmpResult<()> {
        info!(%address, "removing bond");
        self.store.delete_keys(address)
    }

    // ---- queries ----

    pub fn phase(&self, conn: ConnectionHandle) -> Option<Phase> {
        self.sessions.get(&conn).map(|session| session.phase())
    }

    pub fn role(&self, conn: ConnectionHandle) -> Option<Role> {
        self.sessions.get(&conn).map(|session| session.role())
    }

    /// Method chosen by the pairing in progress
    pub fn pairing_method(&self, conn: ConnectionHandle) -> Option<PairingMethod> {
        self.sessions.get(&conn).and_then(|session| session.pairing_method())
    }

    /// Security level the link is encrypted at
    pub fn security_level(&self, conn: ConnectionHandle) -> Option<SecurityLevel> {
        self.sessions.get(&conn).map(|session| session.security_level())
    }

    /// Keys produced by the last pairing on `conn`
    pub fn link_keys(&self, conn: ConnectionHandle) -> Option<KeySet> {
        self.sessions
            .get(&conn)
            .and_then(|session| session.link_keys().cloned())
    }

    /// Identity of the peer on `conn`, once known
    pub fn peer_identity(&self, conn: ConnectionHandle) -> Option<LeAddress> {
        self.sessions.get(&conn).map(|session| session.identity())
    }

    /// Whether `conn` waits for the local public key
    pub fn awaiting_public_key(&self, conn: ConnectionHandle) -> bool {
        self.sessions
            .get(&conn)
            .is_some_and(|session| session.awaiting_public_key())
    }

    // ---- plumbing ----

    fn with_session<T>(
        &mut self,
        conn: ConnectionHandle,
        f: impl FnOnce(&mut PairingSession, &mut Env<'_>) -> T,
    ) -> SmpResult<T> {
        self.with_session_at(conn, Instant::now(), f)
    }

    fn with_session_at<T>(
        &mut self,
        conn: ConnectionHandle,
        now: Instant,
        f: impl FnOnce(&mut PairingSession, &mut Env<'_>) -> T,
    ) -> SmpResult<T> {
        let local_key = self.ecdh.public_key().copied();
        let session = self
            .sessions
            .get_mut(&conn)
            .ok_or(SmpError::ConnectionNotFound)?;

        let mut env = Env {
            config: &self.config,
            rng: self.rng.as_mut(),
            store: &*self.store,
            local_key,
            now,
        };

        let result = f(session, &mut env);
        let actions = session.take_actions();
        self.execute(conn, actions);
        Ok(result)
    }

    fn execute(&mut self, conn: ConnectionHandle, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send(pdu) => {
                    if let Err(e) = self.transport.send(conn, &pdu) {
                        warn!(conn, "failed to send SMP PDU: {}", e);
                        // The rest of the batch belongs to the abandoned attempt
                        if self.send_failed(conn) {
                            return;
                        }
                    }
                }
                Action::StartEncryption(request) => {
                    debug!(conn, key_size = request.key_size, "starting encryption");
                    if let Err(e) = self.transport.start_encryption(conn, &request) {
                        warn!(conn, "failed to start encryption: {}", e);
                        let _ = self.with_session(conn, |session, _| session.encryption_not_started());
                    }
                }
                Action::AwaitPublicKey => self.request_public_key(conn),
                Action::RequestDhKey(peer) => self.request_dhkey(conn, peer),
                Action::Notify(event) => self.emit(event),
            }
        }
    }

    /// Abandon the procedure on `conn` after the transport dropped a PDU.
    /// Returns whether a procedure was running.
    fn send_failed(&mut self, conn: ConnectionHandle) -> bool {
        let aborted = self
            .with_session(conn, |session, _| session.send_failed())
            .unwrap_or(false);

        if aborted {
            self.ecdh.remove_waiter(conn);
            self.dhkey_queue.retain(|(waiting, _)| *waiting != conn);
        }
        aborted
    }

    fn emit(&mut self, event: SmpEvent) {
        match self.event_callback.as_mut() {
            Some(callback) => callback(event),
            None => self.events.push_back(event),
        }
    }
}
