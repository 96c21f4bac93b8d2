//! Per-connection pairing state machine
//!
//! A [`PairingSession`] consumes inbound PDUs, controller events, key
//! agreement results and user input, and records what has to happen next
//! as a list of [`Action`]s. The session never performs I/O itself; the
//! manager drains the actions after every call and carries them out.
//!
//! Progress through a pairing is tracked by [`Phase`]. Which PDUs the
//! session accepts next is an explicit [`PduSet`]; each accepted PDU
//! consumes its bit and the handler arms whatever may follow it.

use super::config::{KeyDistributionOrder, ScSupport, SmpConfig};
use super::constants::*;
use super::crypto;
use super::ecdh::{DhKey, PublicKey};
use super::keys::*;
use super::method;
use super::pdu::*;
use super::types::*;
use crate::gap::{LeAddress, Role};
use constant_time_eq::constant_time_eq;
use rand::{Rng, RngCore};
use std::fmt;
use std::time::Instant;
use tracing::{debug, info, trace, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Progress of the pairing procedure on one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No pairing has been attempted on this link
    Idle,
    /// Pairing features are being exchanged
    FeatureExchange,
    /// Confirm, random and key agreement exchanges
    Authentication,
    /// Waiting for the link to be encrypted with the new key
    EncryptionPending,
    /// Link encrypted, keys being distributed
    KeyDistribution,
    Complete,
    Failed,
}

impl Phase {
    /// Whether a pairing procedure is running
    pub fn is_pairing(&self) -> bool {
        matches!(
            self,
            Phase::FeatureExchange
                | Phase::Authentication
                | Phase::EncryptionPending
                | Phase::KeyDistribution
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::FeatureExchange => write!(f, "feature exchange"),
            Phase::Authentication => write!(f, "authentication"),
            Phase::EncryptionPending => write!(f, "encryption pending"),
            Phase::KeyDistribution => write!(f, "key distribution"),
            Phase::Complete => write!(f, "complete"),
            Phase::Failed => write!(f, "failed"),
        }
    }
}

/// Parameters for the controller to start or refresh link encryption
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionRequest {
    /// Key, already truncated to `key_size`
    pub ltk: [u8; 16],
    pub key_size: u8,
    pub rand: [u8; 8],
    pub ediv: u16,
}

impl fmt::Debug for EncryptionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionRequest")
            .field("key_size", &self.key_size)
            .field("rand", &hex::encode(self.rand))
            .field("ediv", &self.ediv)
            .finish_non_exhaustive()
    }
}

/// Work a session hands back to the manager
#[derive(Debug)]
pub(crate) enum Action {
    /// Transmit a PDU on the SMP channel
    Send(Vec<u8>),
    StartEncryption(EncryptionRequest),
    /// The local public key is needed before pairing can go on
    AwaitPublicKey,
    /// Compute the shared secret with this peer key
    RequestDhKey(PublicKey),
    Notify(SmpEvent),
}

/// Everything a session may consult besides its own state
pub(crate) struct Env<'a> {
    pub config: &'a SmpConfig,
    pub rng: &'a mut dyn RngCore,
    pub store: &'a dyn KeyStore,
    /// Current local public key, if one has been generated
    pub local_key: Option<PublicKey>,
    pub now: Instant,
}

/// User interaction the session is blocked on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UserWait {
    Passkey,
    NumericComparison,
    Consent,
    LegacyOobTk,
}

#[derive(Debug, Default, Clone, Copy)]
struct SessionFlags {
    /// Both sides agreed to bond
    bond: bool,
    ct2: bool,
    /// A debug key pair is in use on either side
    debug_key: bool,
    /// The procedure was triggered by a Security Request
    security_request: bool,
    /// A pairing timed out; SMP is dead on this link
    timed_out: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Pending {
    user: Option<UserWait>,
    /// A passkey is on display
    display: bool,
    /// Our confirm is held back until the user answers
    confirm_delayed: bool,
    public_key: bool,
    dhkey: bool,
    /// Send our DHKey check as soon as the inputs are ready
    dhkey_send: bool,
    /// Peripheral waits for the central's DHKey check
    dhcheck_wait: bool,
    oob: bool,
}

#[derive(Default, Zeroize, ZeroizeOnDrop)]
struct KeyMaterial {
    /// Local random
    prnd: [u8; 16],
    /// Remote random
    rrnd: [u8; 16],
    /// Remote confirm
    pcnf: [u8; 16],
    /// TK, then the STK or the Secure Connections LTK
    tk: [u8; 16],
    mackey: [u8; 16],
    /// DHKey check value received from the peer
    e: [u8; 16],
    dhkey: [u8; 32],
    passkey: u32,
    passkey_round: u8,
}

fn crypto_failed(e: SmpError) -> FailureReason {
    warn!("crypto toolbox failed: {}", e);
    FailureReason::UnspecifiedReason
}

fn random_16(rng: &mut dyn RngCore) -> [u8; 16] {
    let mut value = [0u8; 16];
    rng.fill_bytes(&mut value);
    value
}

fn truncated(key: &[u8; 16], size: u8) -> [u8; 16] {
    let mut out = *key;
    for byte in out.iter_mut().skip(size as usize) {
        *byte = 0;
    }
    out
}

fn passkey_r(passkey: u32) -> [u8; 16] {
    let mut r = [0u8; 16];
    r[0..4].copy_from_slice(&passkey.to_le_bytes());
    r
}

fn io_cap(features: &[u8; 7]) -> [u8; 3] {
    [features[1], features[2], features[3]]
}

const REMOTE_KEY_PDUS: PduSet = PduSet::ENCRYPTION_INFORMATION
    .union(PduSet::CENTRAL_IDENTIFICATION)
    .union(PduSet::IDENTITY_INFORMATION)
    .union(PduSet::IDENTITY_ADDRESS_INFORMATION)
    .union(PduSet::SIGNING_INFORMATION);

/// Pairing state of one connection
pub(crate) struct PairingSession {
    conn: ConnectionHandle,
    role: Role,
    local: LeAddress,
    remote: LeAddress,
    /// Identity of the peer; the connection address until resolved
    identity: LeAddress,
    phase: Phase,
    flags: SessionFlags,
    pending: Pending,
    expected: PduSet,
    method: Option<PairingMethod>,
    secure_connections: Option<bool>,
    enc_size: u8,
    preq: [u8; 7],
    prsp: [u8; 7],
    local_dist: KeyDist,
    remote_dist: KeyDist,
    keys: KeyMaterial,
    local_pk: Option<PublicKey>,
    remote_pk: Option<PublicKey>,
    oob_local: Option<OobData>,
    oob_remote: Option<OobData>,
    /// Keys of the pairing in progress
    new_keys: Option<KeySet>,
    /// Bonds the pairing in progress supersedes
    replaced: Vec<LeAddress>,
    /// Keys of the last pairing on this link
    link_keys: Option<KeySet>,
    link_level: SecurityLevel,
    /// Encryption with stored keys requested, at this level
    reencrypt_level: Option<SecurityLevel>,
    deadline: Option<Instant>,
    actions: Vec<Action>,
}

impl PairingSession {
    pub(crate) fn new(
        conn: ConnectionHandle,
        role: Role,
        local: LeAddress,
        remote: LeAddress,
        identity: LeAddress,
    ) -> Self {
        Self {
            conn,
            role,
            local,
            remote,
            identity,
            phase: Phase::Idle,
            flags: SessionFlags::default(),
            pending: Pending::default(),
            expected: Self::default_expected(role),
            method: None,
            secure_connections: None,
            enc_size: 0,
            preq: [0; 7],
            prsp: [0; 7],
            local_dist: KeyDist::empty(),
            remote_dist: KeyDist::empty(),
            keys: KeyMaterial::default(),
            local_pk: None,
            remote_pk: None,
            oob_local: None,
            oob_remote: None,
            new_keys: None,
            replaced: Vec::new(),
            link_keys: None,
            link_level: SecurityLevel::None,
            reencrypt_level: None,
            deadline: None,
            actions: Vec::new(),
        }
    }

    fn default_expected(role: Role) -> PduSet {
        match role {
            Role::Central => PduSet::SECURITY_REQUEST,
            Role::Peripheral => PduSet::PAIRING_REQUEST,
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn pairing_method(&self) -> Option<PairingMethod> {
        self.method
    }

    pub(crate) fn security_level(&self) -> SecurityLevel {
        self.link_level
    }

    pub(crate) fn link_keys(&self) -> Option<&KeySet> {
        self.link_keys.as_ref()
    }

    pub(crate) fn identity(&self) -> LeAddress {
        self.identity
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn awaiting_public_key(&self) -> bool {
        self.pending.public_key
    }

    pub(crate) fn awaiting_dhkey(&self) -> bool {
        self.pending.dhkey
    }

    pub(crate) fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    fn is_central(&self) -> bool {
        self.role == Role::Central
    }

    fn sc(&self) -> bool {
        self.secure_connections.unwrap_or(false)
    }

    fn method(&self) -> PairingMethod {
        self.method.unwrap_or(PairingMethod::JustWorks)
    }

    fn initiator(&self) -> LeAddress {
        match self.role {
            Role::Central => self.local,
            Role::Peripheral => self.remote,
        }
    }

    fn responder(&self) -> LeAddress {
        match self.role {
            Role::Central => self.remote,
            Role::Peripheral => self.local,
        }
    }

    /// A pairing, a security request or an encryption with stored keys
    /// is outstanding
    fn is_active(&self) -> bool {
        self.phase.is_pairing() || self.flags.security_request || self.reencrypt_level.is_some()
    }

    fn emit(&mut self, event: SmpEvent) {
        self.actions.push(Action::Notify(event));
    }

    /// Queue a PDU and restart the procedure timer
    fn send(&mut self, env: &Env<'_>, pdu: Vec<u8>) {
        self.deadline = Some(env.now + env.config.timeout);
        self.send_untimed(pdu);
    }

    /// Wait for `pdus` from the peer and restart the procedure timer
    fn expect_pdus(&mut self, env: &Env<'_>, pdus: PduSet) {
        self.expected.insert(pdus);
        self.deadline = Some(env.now + env.config.timeout);
    }

    fn send_untimed(&mut self, pdu: Vec<u8>) {
        match pdu.first().copied() {
            // Key material stays out of the log
            Some(code @ (SMP_ENCRYPTION_INFORMATION | SMP_IDENTITY_INFORMATION | SMP_SIGNING_INFORMATION)) => {
                trace!(conn = self.conn, code, "queue SMP key PDU")
            }
            _ => trace!(conn = self.conn, pdu = %hex::encode(&pdu), "queue SMP PDU"),
        }
        self.actions.push(Action::Send(pdu));
    }

    fn existing_keys(&self, env: &Env<'_>) -> Option<KeySet> {
        if let Some(keys) = self.link_keys.as_ref() {
            return Some(keys.clone());
        }
        self.load_bond(env, &self.identity)
    }

    fn load_bond(&self, env: &Env<'_>, address: &LeAddress) -> Option<KeySet> {
        match env.store.load_keys(address) {
            Ok(keys) => keys,
            Err(e) => {
                warn!(conn = self.conn, %address, "failed to load keys: {}", e);
                None
            }
        }
    }

    /// Clear everything belonging to the current attempt
    fn reset(&mut self) {
        self.expected = Self::default_expected(self.role);
        self.flags = SessionFlags {
            timed_out: self.flags.timed_out,
            ..SessionFlags::default()
        };
        self.pending = Pending::default();
        self.method = None;
        self.secure_connections = None;
        self.enc_size = 0;
        self.preq = [0; 7];
        self.prsp = [0; 7];
        self.local_dist = KeyDist::empty();
        self.remote_dist = KeyDist::empty();
        self.keys.zeroize();
        self.local_pk = None;
        self.remote_pk = None;
        self.oob_local.zeroize();
        self.oob_remote.zeroize();
        self.new_keys = None;
        self.replaced.clear();
        self.reencrypt_level = None;
        self.deadline = None;
    }

    /// Start a fresh attempt. No nonce exists until the features are
    /// settled.
    fn begin_attempt(&mut self) {
        let security_request = self.flags.security_request;
        self.reset();
        self.flags.security_request = security_request;
    }

    /// Send Pairing Failed and abandon the attempt
    fn fail(&mut self, reason: FailureReason) {
        warn!(conn = self.conn, %reason, phase = %self.phase, "pairing failed");
        self.send_untimed(PairingFailed::new(reason).serialize());
        let report = self.is_active();
        self.abort(reason, report);
    }

    /// Abandon the attempt without telling the peer. A bond stored by an
    /// earlier pairing is left untouched.
    fn abort(&mut self, reason: FailureReason, report: bool) {
        if report {
            let error = reason.security_error();
            if self.phase != Phase::KeyDistribution {
                self.emit(SmpEvent::SecurityChanged {
                    conn: self.conn,
                    level: self.link_level,
                    error: Some(error),
                });
            }
            if self.phase.is_pairing() {
                self.emit(SmpEvent::PairingFailed {
                    conn: self.conn,
                    reason,
                    error,
                });
            }
        }

        self.reset();
        self.phase = Phase::Failed;
    }

    /// Unexpected or unknown PDU
    fn reject(&mut self, reason: FailureReason) {
        if self.phase.is_pairing() {
            self.fail(reason);
        } else {
            self.send_untimed(PairingFailed::new(FailureReason::CommandNotSupported).serialize());
        }
    }

    // ---- inbound PDUs ----

    pub(crate) fn handle_pdu(&mut self, env: &mut Env<'_>, data: &[u8]) {
        if self.flags.timed_out {
            warn!(conn = self.conn, "SMP timed out on this link, dropping PDU");
            return;
        }

        let Some(&code) = data.first() else {
            warn!(conn = self.conn, "empty SMP PDU");
            return;
        };

        if code >= SMP_OPCODE_RESERVED_START {
            debug!(conn = self.conn, code, "ignoring reserved SMP opcode");
            return;
        }

        let Some(opcode) = Opcode::from_u8(code) else {
            warn!(conn = self.conn, code, "invalid SMP opcode");
            self.reject(FailureReason::CommandNotSupported);
            return;
        };

        if opcode == Opcode::PairingFailed {
            let reason = match PairingFailed::parse(data) {
                Ok(pdu) => pdu.failure_reason(),
                Err(e) => {
                    warn!(conn = self.conn, "malformed Pairing Failed: {}", e);
                    FailureReason::UnspecifiedReason
                }
            };
            self.on_pairing_failed(reason);
            return;
        }

        if !self.expected.contains(opcode.bit()) {
            warn!(conn = self.conn, %opcode, phase = %self.phase, "unexpected SMP PDU");
            self.reject(FailureReason::UnspecifiedReason);
            return;
        }
        self.expected.remove(opcode.bit());

        let pdu = match SmpPdu::parse(opcode, data) {
            Ok(pdu) => pdu,
            Err(e) => {
                warn!(conn = self.conn, "{}", e);
                if opcode == Opcode::PairingRequest && !self.phase.is_pairing() {
                    self.phase = Phase::FeatureExchange;
                }
                self.fail(FailureReason::InvalidParameters);
                return;
            }
        };

        debug!(conn = self.conn, %opcode, phase = %self.phase, "received");
        if let Err(reason) = self.dispatch(env, pdu) {
            self.fail(reason);
        }
    }

    fn dispatch(&mut self, env: &mut Env<'_>, pdu: SmpPdu) -> Result<(), FailureReason> {
        use Phase::*;

        match (self.phase, pdu) {
            (_, SmpPdu::PairingFailed(pdu)) => {
                self.on_pairing_failed(pdu.failure_reason());
                Ok(())
            }
            (_, SmpPdu::SecurityRequest(pdu)) => self.on_security_request(env, pdu.auth_req),
            (Idle | Complete | Failed, SmpPdu::PairingRequest(req)) => {
                self.on_pairing_request(env, req)
            }
            (FeatureExchange, SmpPdu::PairingResponse(rsp)) => self.on_pairing_response(env, rsp),
            (Authentication, SmpPdu::PairingPublicKey(pdu)) => self.on_public_key_pdu(env, pdu.key),
            (Authentication, SmpPdu::PairingConfirm(pdu)) => {
                self.on_pairing_confirm(env, pdu.confirm_value)
            }
            (Authentication, SmpPdu::PairingRandom(pdu)) => {
                self.on_pairing_random(env, pdu.random_value)
            }
            (Authentication, SmpPdu::PairingDhKeyCheck(pdu)) => self.on_dhkey_check(env, pdu.check),
            (FeatureExchange | Authentication, SmpPdu::KeypressNotification(pdu)) => {
                self.on_keypress(env, pdu)
            }
            (EncryptionPending | KeyDistribution, SmpPdu::EncryptionInformation(pdu)) => {
                self.on_encryption_information(env, pdu.ltk)
            }
            (EncryptionPending | KeyDistribution, SmpPdu::CentralIdentification(pdu)) => {
                self.on_central_identification(env, pdu)
            }
            (EncryptionPending | KeyDistribution, SmpPdu::IdentityInformation(pdu)) => {
                self.on_identity_information(env, pdu.irk)
            }
            (EncryptionPending | KeyDistribution, SmpPdu::IdentityAddressInformation(pdu)) => {
                self.on_identity_address(env, pdu)
            }
            (EncryptionPending | KeyDistribution, SmpPdu::SigningInformation(pdu)) => {
                self.on_signing_information(env, pdu.csrk)
            }
            (phase, pdu) => {
                warn!(conn = self.conn, %phase, opcode = %pdu.opcode(), "PDU not valid in this phase");
                Err(FailureReason::UnspecifiedReason)
            }
        }
    }

    fn on_pairing_failed(&mut self, reason: FailureReason) {
        info!(conn = self.conn, %reason, phase = %self.phase, "peer failed pairing");

        // Any pending user interaction is cancelled with the attempt
        self.pending.user = None;
        self.pending.display = false;

        let report = self.is_active();
        self.abort(reason, report);
    }

    fn on_security_request(&mut self, env: &mut Env<'_>, auth: AuthReq) -> Result<(), FailureReason> {
        if self.phase.is_pairing() || self.reencrypt_level.is_some() {
            debug!(conn = self.conn, "ignoring Security Request, procedure running");
            return Ok(());
        }

        let config = env.config;
        let auth = method::mask_auth_req(config, auth);

        if config.secure_connections == ScSupport::Only && !auth.contains(AuthReq::SC) {
            return Err(FailureReason::AuthenticationRequirements);
        }

        if config.bonding_required && !(config.bondable && auth.contains(AuthReq::BONDING)) {
            return Err(FailureReason::UnspecifiedReason);
        }

        if let Some(keys) = self.existing_keys(env) {
            let repair = (auth.contains(AuthReq::MITM) && !keys.is_authenticated())
                || (auth.contains(AuthReq::SC) && !keys.is_secure_connections());

            if !repair {
                if let Some(ltk) = keys.ltk.as_ref() {
                    debug!(conn = self.conn, "Security Request answered with stored LTK");
                    self.encrypt_with(ltk, keys.enc_size, keys.security_level());
                    return Ok(());
                }
            }
        }

        self.send_pairing_request(env);
        self.flags.security_request = true;
        Ok(())
    }

    /// Ask the controller to encrypt with a stored key
    fn encrypt_with(&mut self, ltk: &LongTermKey, enc_size: u8, level: SecurityLevel) {
        self.actions.push(Action::StartEncryption(EncryptionRequest {
            ltk: truncated(&ltk.key, enc_size),
            key_size: enc_size,
            rand: ltk.rand,
            ediv: ltk.ediv,
        }));
        self.reencrypt_level = Some(level);
        self.expected.insert(PduSet::SECURITY_REQUEST);
    }

    fn send_pairing_request(&mut self, env: &mut Env<'_>) {
        self.begin_attempt();

        let config = env.config;
        let auth = method::default_auth_req(config);
        let (init, resp) = if auth.contains(AuthReq::BONDING) {
            (config.local_keys, config.remote_keys)
        } else {
            (KeyDist::empty(), KeyDist::empty())
        };

        let req = PairingFeatures::new(
            method::local_io_capability(config),
            config.legacy_oob_present || config.sc_oob_present,
            auth,
            config.max_key_size,
            init,
            resp,
        );

        self.local_dist = init;
        self.remote_dist = resp;
        self.preq = req.to_bytes(true);

        debug!(conn = self.conn, ?auth, "sending Pairing Request");
        self.send(env, req.serialize(true));
        self.expect_pdus(env, PduSet::PAIRING_RESPONSE | PduSet::SECURITY_REQUEST);
        self.phase = Phase::FeatureExchange;
    }

    /// Checks shared by both roles once the features are known
    fn settle_features(
        &mut self,
        env: &mut Env<'_>,
        req: &PairingFeatures,
        rsp: &PairingFeatures,
    ) -> Result<(), FailureReason> {
        let sc = req.auth_req.contains(AuthReq::SC) && rsp.auth_req.contains(AuthReq::SC);
        self.secure_connections = Some(sc);
        self.flags.ct2 = req.auth_req.contains(AuthReq::CT2) && rsp.auth_req.contains(AuthReq::CT2);
        self.enc_size = req.max_key_size.min(rsp.max_key_size);

        let local_io = method::local_io_capability(env.config);
        let method = method::pairing_method(sc, req, rsp, local_io, self.role);
        self.method = Some(method);
        debug!(conn = self.conn, %method, sc, enc_size = self.enc_size, "pairing method selected");

        if let Some(existing) = self.existing_keys(env) {
            if !self.may_replace(env, &existing) {
                warn!(conn = self.conn, "pairing would weaken the existing bond");
                return Err(FailureReason::AuthenticationRequirements);
            }
        }

        let required = env.config.effective_required_security();
        if self.reachable_level() < required {
            warn!(conn = self.conn, %required, "required security level not reachable");
            return Err(FailureReason::AuthenticationRequirements);
        }

        if !sc && env.config.secure_connections == ScSupport::Only {
            return Err(FailureReason::AuthenticationRequirements);
        }

        self.keys.prnd = random_16(env.rng);
        Ok(())
    }

    /// Security level this pairing will produce
    fn reachable_level(&self) -> SecurityLevel {
        if !self.method().is_authenticated() {
            SecurityLevel::EncryptionOnly
        } else if self.sc() && self.enc_size == SMP_MAX_ENCRYPTION_KEY_SIZE {
            SecurityLevel::SecureConnections
        } else {
            SecurityLevel::EncryptionWithAuthentication
        }
    }

    /// Whether the pairing in progress may overwrite `existing`
    fn may_replace(&self, env: &Env<'_>, existing: &KeySet) -> bool {
        if !existing.has_ltk() {
            return true;
        }

        if existing.enc_size > self.enc_size {
            return false;
        }

        if existing.is_secure_connections() && !self.sc() {
            return false;
        }

        if self.method() == PairingMethod::JustWorks {
            if existing.is_authenticated() {
                return false;
            }
            if !env.config.allow_unauthenticated_overwrite {
                return false;
            }
        }

        true
    }

    /// Whether the peer's debug key may replace `existing`
    fn may_replace_with_debug(&self, env: &Env<'_>) -> bool {
        match self.existing_keys(env) {
            Some(existing) => existing.is_debug(),
            None => true,
        }
    }

    fn on_pairing_request(
        &mut self,
        env: &mut Env<'_>,
        req: PairingFeatures,
    ) -> Result<(), FailureReason> {
        if !(SMP_MIN_ENCRYPTION_KEY_SIZE..=SMP_MAX_ENCRYPTION_KEY_SIZE).contains(&req.max_key_size) {
            self.phase = Phase::FeatureExchange;
            return Err(FailureReason::EncryptionKeySize);
        }

        self.begin_attempt();
        self.phase = Phase::FeatureExchange;

        let config = env.config;
        let auth = method::local_auth_req(config, req.auth_req);
        let sc = auth.contains(AuthReq::SC) && req.auth_req.contains(AuthReq::SC);
        let (init, resp) = if sc {
            (
                req.initiator_key_dist & config.remote_keys_sc(),
                req.responder_key_dist & config.local_keys_sc(),
            )
        } else {
            (
                req.initiator_key_dist & config.remote_keys,
                req.responder_key_dist & config.local_keys,
            )
        };

        let oob = if sc {
            config.sc_oob_present
        } else {
            config.legacy_oob_present
        };

        let mut rsp = PairingFeatures::new(
            method::local_io_capability(config),
            oob,
            auth,
            config.max_key_size,
            init,
            resp,
        );

        if req.auth_req.contains(AuthReq::BONDING) && auth.contains(AuthReq::BONDING) {
            self.flags.bond = true;
        } else if config.bonding_required {
            return Err(FailureReason::UnspecifiedReason);
        } else {
            rsp.initiator_key_dist = KeyDist::empty();
            rsp.responder_key_dist = KeyDist::empty();
        }

        self.local_dist = rsp.responder_key_dist;
        self.remote_dist = rsp.initiator_key_dist;
        self.preq = req.to_bytes(true);
        self.prsp = rsp.to_bytes(false);

        self.settle_features(env, &req, &rsp)?;

        if !self.sc() {
            return self.legacy_pairing_request(env);
        }

        if self.needs_consent(env, false) {
            return Ok(());
        }

        self.expect_pdus(env, PduSet::PAIRING_PUBLIC_KEY);
        self.send_pairing_response(env);
        Ok(())
    }

    fn send_pairing_response(&mut self, env: &Env<'_>) {
        let rsp = self.prsp.to_vec();
        self.send(env, rsp);
        self.phase = Phase::Authentication;
    }

    /// Hold the procedure for user consent on unauthenticated methods.
    /// The side that asked for security in the first place has already
    /// shown intent.
    fn needs_consent(&mut self, env: &Env<'_>, initiated_by_peer: bool) -> bool {
        let method = self.method();
        let fixed_display =
            method == PairingMethod::PasskeyDisplay && env.config.fixed_passkey.is_some();

        if !env.config.pairing_consent
            || !(fixed_display || method == PairingMethod::JustWorks)
            || self.flags.security_request != initiated_by_peer
        {
            return false;
        }

        self.pending.user = Some(UserWait::Consent);
        self.emit(SmpEvent::PairingConsentRequest(self.conn, method));
        true
    }

    fn on_pairing_response(
        &mut self,
        env: &mut Env<'_>,
        rsp: PairingFeatures,
    ) -> Result<(), FailureReason> {
        if !(SMP_MIN_ENCRYPTION_KEY_SIZE..=SMP_MAX_ENCRYPTION_KEY_SIZE).contains(&rsp.max_key_size) {
            return Err(FailureReason::EncryptionKeySize);
        }

        self.local_dist &= rsp.initiator_key_dist;
        self.remote_dist &= rsp.responder_key_dist;
        self.prsp = rsp.to_bytes(false);

        let config = env.config;
        let req = PairingFeatures::parse(&self.preq).map_err(|_| FailureReason::UnspecifiedReason)?;

        if req.auth_req.contains(AuthReq::BONDING) && rsp.auth_req.contains(AuthReq::BONDING) {
            self.flags.bond = true;
        } else if config.bonding_required {
            return Err(FailureReason::UnspecifiedReason);
        } else {
            self.local_dist = KeyDist::empty();
            self.remote_dist = KeyDist::empty();
        }

        self.settle_features(env, &req, &rsp)?;
        self.phase = Phase::Authentication;

        if !self.sc() {
            return self.legacy_pairing_response(env);
        }

        self.local_dist &= !KeyDist::ENC_KEY;
        self.remote_dist &= !KeyDist::ENC_KEY;

        if self.needs_consent(env, true) {
            return Ok(());
        }

        self.central_send_public_key(env);
        Ok(())
    }

    fn central_send_public_key(&mut self, env: &Env<'_>) {
        match env.local_key {
            Some(key) => {
                self.expect_pdus(env, PduSet::PAIRING_PUBLIC_KEY);
                self.expected.remove(PduSet::SECURITY_REQUEST);
                self.send_public_key(env, key);
            }
            None => {
                debug!(conn = self.conn, "waiting for local public key");
                self.pending.public_key = true;
                self.actions.push(Action::AwaitPublicKey);
            }
        }
    }

    fn send_public_key(&mut self, env: &Env<'_>, key: PublicKey) {
        if key.is_debug_key() {
            info!(conn = self.conn, "using debug key pair");
            self.flags.debug_key = true;
        }
        self.local_pk = Some(key);
        self.send(env, PairingPublicKey::new(key).serialize());
    }

    // ---- legacy pairing ----

    fn legacy_request_tk(&mut self, env: &mut Env<'_>) -> Result<(), FailureReason> {
        let method = self.method();

        if let Some(existing) = self.existing_keys(env) {
            if existing.is_authenticated() && method == PairingMethod::JustWorks {
                warn!(conn = self.conn, "refusing to replace authenticated keys with Just Works");
                return Err(FailureReason::UnspecifiedReason);
            }
        }

        match method {
            PairingMethod::LegacyOob => {
                self.pending.user = Some(UserWait::LegacyOobTk);
                self.emit(SmpEvent::OobDataRequest(self.conn, OobRequest::LegacyTk));
            }
            PairingMethod::PasskeyDisplay => {
                let passkey = self.new_passkey(env);
                self.keys.tk = passkey_r(passkey);
                self.pending.display = true;
                self.emit(SmpEvent::DisplayPasskey(self.conn, passkey));
            }
            PairingMethod::PasskeyInput => {
                self.pending.user = Some(UserWait::Passkey);
                self.emit(SmpEvent::PasskeyRequest(self.conn));
            }
            PairingMethod::JustWorks => self.keys.tk = [0; 16],
            other => {
                warn!(conn = self.conn, method = %other, "method not valid for legacy pairing");
                return Err(FailureReason::UnspecifiedReason);
            }
        }

        Ok(())
    }

    fn new_passkey(&mut self, env: &mut Env<'_>) -> u32 {
        let passkey = match env.config.fixed_passkey {
            Some(passkey) => passkey,
            None => env.rng.gen_range(0..SMP_PASSKEY_MODULUS),
        };
        self.keys.passkey = passkey;
        self.keys.passkey_round = 0;
        passkey
    }

    fn legacy_pairing_request(&mut self, env: &mut Env<'_>) -> Result<(), FailureReason> {
        self.legacy_request_tk(env)?;

        if self.needs_consent(env, false) {
            return Ok(());
        }

        self.expect_pdus(env, PduSet::PAIRING_CONFIRM | PduSet::KEYPRESS_NOTIFICATION);
        self.send_pairing_response(env);
        Ok(())
    }

    fn legacy_pairing_response(&mut self, env: &mut Env<'_>) -> Result<(), FailureReason> {
        self.legacy_request_tk(env)?;

        if self.needs_consent(env, true) {
            return Ok(());
        }

        if self.pending.user.is_none() {
            self.expect_pdus(env, PduSet::PAIRING_CONFIRM | PduSet::KEYPRESS_NOTIFICATION);
            return self.legacy_send_confirm(env);
        }

        self.pending.confirm_delayed = true;
        Ok(())
    }

    fn legacy_send_confirm(&mut self, env: &Env<'_>) -> Result<(), FailureReason> {
        let confirm = crypto::c1(
            &self.keys.tk,
            &self.keys.prnd,
            &self.preq,
            &self.prsp,
            &self.initiator(),
            &self.responder(),
        )
        .map_err(crypto_failed)?;

        self.pending.confirm_delayed = false;
        self.send(env, PairingConfirm::new(confirm).serialize());
        Ok(())
    }

    /// Send or hold our confirm once the peer's confirm or the TK is known
    fn legacy_pairing_confirm(&mut self, env: &Env<'_>) -> Result<(), FailureReason> {
        if self.is_central() {
            self.expect_pdus(env, PduSet::PAIRING_CONFIRM);
            return self.legacy_send_confirm(env);
        }

        if self.pending.user.is_none() {
            self.expect_pdus(env, PduSet::PAIRING_RANDOM);
            return self.legacy_send_confirm(env);
        }

        self.pending.confirm_delayed = true;
        Ok(())
    }

    /// Continue after the user supplied the TK
    fn legacy_user_tk_entry(&mut self, env: &Env<'_>) {
        if !self.pending.confirm_delayed {
            return;
        }

        if self.legacy_pairing_confirm(env).is_err() {
            self.fail(FailureReason::PasskeyEntryFailed);
            return;
        }

        if self.is_central() {
            self.expect_pdus(env, PduSet::PAIRING_CONFIRM);
        } else {
            self.expect_pdus(env, PduSet::PAIRING_RANDOM);
        }
    }

    fn legacy_pairing_random(&mut self, env: &mut Env<'_>) -> Result<(), FailureReason> {
        let confirm = crypto::c1(
            &self.keys.tk,
            &self.keys.rrnd,
            &self.preq,
            &self.prsp,
            &self.initiator(),
            &self.responder(),
        )
        .map_err(crypto_failed)?;

        if !constant_time_eq(&confirm, &self.keys.pcnf) {
            warn!(conn = self.conn, "legacy confirm value mismatch");
            return Err(FailureReason::ConfirmValueFailed);
        }

        if self.is_central() {
            let stk = crypto::s1(&self.keys.tk, &self.keys.rrnd, &self.keys.prnd)
                .map_err(crypto_failed)?;
            self.keys.tk = truncated(&stk, self.enc_size);
            self.start_pairing_encryption(env);
            return Ok(());
        }

        let stk =
            crypto::s1(&self.keys.tk, &self.keys.prnd, &self.keys.rrnd).map_err(crypto_failed)?;
        self.keys.tk = truncated(&stk, self.enc_size);
        self.phase = Phase::EncryptionPending;

        let random = self.keys.prnd;
        self.send(env, PairingRandom::new(random).serialize());
        Ok(())
    }

    /// Central: encrypt the link with the STK or the Secure Connections LTK
    fn start_pairing_encryption(&mut self, env: &Env<'_>) {
        self.actions.push(Action::StartEncryption(EncryptionRequest {
            ltk: self.keys.tk,
            key_size: self.enc_size,
            rand: [0; 8],
            ediv: 0,
        }));
        self.phase = Phase::EncryptionPending;

        if env.config.key_distribution_order == KeyDistributionOrder::EarlyRemoteKeys {
            self.arm_next_remote_key(env);
        }
    }

    fn on_pairing_confirm(&mut self, env: &mut Env<'_>, confirm: [u8; 16]) -> Result<(), FailureReason> {
        self.pending.display = false;
        self.keys.pcnf = confirm;

        if self.is_central() {
            self.expect_pdus(env, PduSet::PAIRING_RANDOM);
            let random = self.keys.prnd;
            self.send(env, PairingRandom::new(random).serialize());
            return Ok(());
        }

        if !self.sc() {
            return self.legacy_pairing_confirm(env);
        }

        match self.method() {
            PairingMethod::PasskeyDisplay => {
                self.expect_pdus(env, PduSet::PAIRING_RANDOM);
                self.sc_send_confirm(env)
            }
            PairingMethod::PasskeyInput => {
                if self.pending.user.is_some() {
                    self.pending.confirm_delayed = true;
                    return Ok(());
                }
                self.expect_pdus(env, PduSet::PAIRING_RANDOM);
                self.sc_send_confirm(env)
            }
            other => {
                warn!(conn = self.conn, method = %other, "unexpected Pairing Confirm");
                Err(FailureReason::UnspecifiedReason)
            }
        }
    }

    fn on_pairing_random(&mut self, env: &mut Env<'_>, random: [u8; 16]) -> Result<(), FailureReason> {
        self.keys.rrnd = random;

        if !self.sc() {
            return self.legacy_pairing_random(env);
        }

        if self.is_central() {
            self.sc_check_confirm()?;

            match self.method() {
                PairingMethod::PasskeyConfirm => {
                    let (local, remote) = self.public_keys()?;
                    let value = crypto::g2(&local.x, &remote.x, &self.keys.prnd, &self.keys.rrnd)
                        .map_err(crypto_failed)?;
                    self.pending.user = Some(UserWait::NumericComparison);
                    self.pending.dhkey_send = true;
                    self.emit(SmpEvent::NumericComparisonRequest(self.conn, value));
                    return Ok(());
                }
                PairingMethod::JustWorks | PairingMethod::ScOob => {}
                PairingMethod::PasskeyDisplay | PairingMethod::PasskeyInput => {
                    self.keys.passkey_round += 1;
                    if self.keys.passkey_round < SMP_PASSKEY_ROUNDS {
                        self.keys.prnd = random_16(env.rng);
                        self.expect_pdus(env, PduSet::PAIRING_CONFIRM);
                        return self.sc_send_confirm(env);
                    }
                }
                PairingMethod::LegacyOob => return Err(FailureReason::UnspecifiedReason),
            }

            if self.pending.dhkey {
                self.pending.dhkey_send = true;
                return Ok(());
            }

            return self.central_dhkey_check(env);
        }

        match self.method() {
            PairingMethod::PasskeyConfirm => {
                let (local, remote) = self.public_keys()?;
                let value = crypto::g2(&remote.x, &local.x, &self.keys.rrnd, &self.keys.prnd)
                    .map_err(crypto_failed)?;
                self.pending.user = Some(UserWait::NumericComparison);
                self.emit(SmpEvent::NumericComparisonRequest(self.conn, value));
            }
            PairingMethod::JustWorks => {}
            PairingMethod::PasskeyDisplay | PairingMethod::PasskeyInput => {
                self.sc_check_confirm()?;

                self.expect_pdus(env, PduSet::PAIRING_CONFIRM);
                let random = self.keys.prnd;
                self.send(env, PairingRandom::new(random).serialize());

                self.keys.passkey_round += 1;
                if self.keys.passkey_round == SMP_PASSKEY_ROUNDS {
                    self.expected.remove(PduSet::PAIRING_CONFIRM);
                    self.expect_pdus(env, PduSet::PAIRING_DHKEY_CHECK);
                    self.pending.dhcheck_wait = true;
                    return Ok(());
                }

                self.keys.prnd = random_16(env.rng);
                return Ok(());
            }
            PairingMethod::ScOob => {
                self.keys.prnd = random_16(env.rng);
                self.request_sc_oob_data();
                return Ok(());
            }
            PairingMethod::LegacyOob => return Err(FailureReason::UnspecifiedReason),
        }

        self.expect_pdus(env, PduSet::PAIRING_DHKEY_CHECK);
        self.pending.dhcheck_wait = true;
        let random = self.keys.prnd;
        self.send(env, PairingRandom::new(random).serialize());
        Ok(())
    }

    // ---- Secure Connections ----

    fn public_keys(&self) -> Result<(PublicKey, PublicKey), FailureReason> {
        match (self.local_pk, self.remote_pk) {
            (Some(local), Some(remote)) => Ok((local, remote)),
            _ => {
                warn!(conn = self.conn, "public keys not exchanged");
                Err(FailureReason::UnspecifiedReason)
            }
        }
    }

    /// f4 discriminant of the current exchange
    fn confirm_z(&self) -> Result<u8, FailureReason> {
        match self.method() {
            PairingMethod::JustWorks | PairingMethod::PasskeyConfirm => Ok(0),
            PairingMethod::PasskeyDisplay | PairingMethod::PasskeyInput => {
                let bit = (self.keys.passkey >> self.keys.passkey_round) & 0x01;
                Ok(SMP_PASSKEY_ROUND_Z | bit as u8)
            }
            _ => Err(FailureReason::UnspecifiedReason),
        }
    }

    fn sc_send_confirm(&mut self, env: &Env<'_>) -> Result<(), FailureReason> {
        let z = self.confirm_z()?;
        let (local, remote) = self.public_keys()?;
        let confirm =
            crypto::f4(&local.x, &remote.x, &self.keys.prnd, z).map_err(crypto_failed)?;

        self.pending.confirm_delayed = false;
        self.send(env, PairingConfirm::new(confirm).serialize());
        Ok(())
    }

    fn sc_check_confirm(&self) -> Result<(), FailureReason> {
        if self.method() == PairingMethod::ScOob {
            return Ok(());
        }

        let z = self.confirm_z()?;
        let (local, remote) = self.public_keys()?;
        let confirm =
            crypto::f4(&remote.x, &local.x, &self.keys.rrnd, z).map_err(crypto_failed)?;

        if !constant_time_eq(&confirm, &self.keys.pcnf) {
            warn!(conn = self.conn, "confirm value mismatch");
            return Err(FailureReason::ConfirmValueFailed);
        }

        Ok(())
    }

    fn display_passkey(&mut self, env: &mut Env<'_>) {
        let passkey = self.new_passkey(env);
        self.pending.display = true;
        self.emit(SmpEvent::DisplayPasskey(self.conn, passkey));
    }

    fn request_sc_oob_data(&mut self) {
        let req_oob = self.preq[2] & SMP_OOB_PRESENT != 0;
        let rsp_oob = self.prsp[2] & SMP_OOB_PRESENT != 0;

        // The flag a side sends says it holds the other side's data
        let (local_used, remote_used) = match self.role {
            Role::Central => (rsp_oob, req_oob),
            Role::Peripheral => (req_oob, rsp_oob),
        };

        let config = match (local_used, remote_used) {
            (true, true) => ScOobConfig::BothPeers,
            (true, false) => ScOobConfig::LocalOnly,
            (false, true) => ScOobConfig::RemoteOnly,
            (false, false) => ScOobConfig::NoData,
        };

        self.pending.oob = true;
        self.emit(SmpEvent::OobDataRequest(
            self.conn,
            OobRequest::SecureConnections(config),
        ));
    }

    fn on_public_key_pdu(&mut self, env: &mut Env<'_>, key: PublicKey) -> Result<(), FailureReason> {
        self.remote_pk = Some(key);

        if key.is_debug_key() {
            info!(conn = self.conn, "peer uses the debug public key");
            self.flags.debug_key = true;
            if !self.may_replace_with_debug(env) {
                return Err(FailureReason::AuthenticationRequirements);
            }
        }

        if self.is_central() {
            if let Some(local) = self.local_pk {
                self.check_reflected_key(&local, &key)?;
            }

            match self.method() {
                PairingMethod::PasskeyConfirm | PairingMethod::JustWorks => {
                    self.expect_pdus(env, PduSet::PAIRING_CONFIRM);
                }
                PairingMethod::PasskeyDisplay => {
                    self.display_passkey(env);
                    self.expect_pdus(env, PduSet::PAIRING_CONFIRM | PduSet::KEYPRESS_NOTIFICATION);
                    self.sc_send_confirm(env)?;
                }
                PairingMethod::PasskeyInput => {
                    self.pending.user = Some(UserWait::Passkey);
                    self.emit(SmpEvent::PasskeyRequest(self.conn));
                    self.expect_pdus(env, PduSet::KEYPRESS_NOTIFICATION);
                }
                PairingMethod::ScOob => {
                    self.keys.prnd = random_16(env.rng);
                    self.request_sc_oob_data();
                }
                PairingMethod::LegacyOob => return Err(FailureReason::UnspecifiedReason),
            }

            self.generate_dhkey(key);
            return Ok(());
        }

        match env.local_key {
            Some(local) => self.peripheral_public_key(env, local),
            None => {
                debug!(conn = self.conn, "waiting for local public key");
                self.pending.public_key = true;
                self.actions.push(Action::AwaitPublicKey);
                Ok(())
            }
        }
    }

    /// A peer echoing our own key back would make the DHKey predictable
    fn check_reflected_key(&self, local: &PublicKey, remote: &PublicKey) -> Result<(), FailureReason> {
        if local.x == remote.x && !remote.is_debug_key() {
            warn!(conn = self.conn, "peer reflected our public key");
            return Err(FailureReason::UnspecifiedReason);
        }
        Ok(())
    }

    fn peripheral_public_key(&mut self, env: &mut Env<'_>, local: PublicKey) -> Result<(), FailureReason> {
        let Some(remote) = self.remote_pk else {
            return Err(FailureReason::UnspecifiedReason);
        };

        self.check_reflected_key(&local, &remote)?;
        self.send_public_key(env, local);

        match self.method() {
            PairingMethod::PasskeyConfirm | PairingMethod::JustWorks => {
                self.expect_pdus(env, PduSet::PAIRING_RANDOM);
                self.sc_send_confirm(env)?;
            }
            PairingMethod::PasskeyDisplay => {
                self.display_passkey(env);
                self.expect_pdus(env, PduSet::PAIRING_CONFIRM | PduSet::KEYPRESS_NOTIFICATION);
            }
            PairingMethod::PasskeyInput => {
                self.expect_pdus(env, PduSet::PAIRING_CONFIRM | PduSet::KEYPRESS_NOTIFICATION);
                self.pending.user = Some(UserWait::Passkey);
                self.emit(SmpEvent::PasskeyRequest(self.conn));
            }
            PairingMethod::ScOob => {
                self.expect_pdus(env, PduSet::PAIRING_RANDOM);
            }
            PairingMethod::LegacyOob => return Err(FailureReason::UnspecifiedReason),
        }

        self.generate_dhkey(remote);
        Ok(())
    }

    fn generate_dhkey(&mut self, remote: PublicKey) {
        self.pending.dhkey = true;
        self.actions.push(Action::RequestDhKey(remote));
    }

    /// The local public key became available
    pub(crate) fn on_public_key(&mut self, env: &mut Env<'_>, key: Option<PublicKey>) {
        if !self.pending.public_key {
            return;
        }
        self.pending.public_key = false;

        let Some(key) = key else {
            self.fail(FailureReason::UnspecifiedReason);
            return;
        };

        let result = if self.is_central() {
            self.expect_pdus(env, PduSet::PAIRING_PUBLIC_KEY);
            self.expected.remove(PduSet::SECURITY_REQUEST);
            self.send_public_key(env, key);
            Ok(())
        } else {
            self.peripheral_public_key(env, key)
        };

        if let Err(reason) = result {
            self.fail(reason);
        }
    }

    /// The shared secret for this session is ready
    pub(crate) fn on_dhkey(&mut self, env: &mut Env<'_>, dhkey: Option<DhKey>) {
        if !self.pending.dhkey {
            debug!(conn = self.conn, "dropping stale DHKey");
            return;
        }

        let Some(dhkey) = dhkey else {
            self.fail(FailureReason::DhKeyCheckFailed);
            return;
        };

        self.pending.dhkey = false;
        self.keys.dhkey = dhkey.0;

        if self.pending.user.is_some() || self.pending.dhcheck_wait {
            self.pending.dhkey_send = true;
            return;
        }

        if self.pending.dhkey_send {
            if let Err(reason) = self.send_dhkey_check(env) {
                self.fail(reason);
            }
        }
    }

    fn send_dhkey_check(&mut self, env: &Env<'_>) -> Result<(), FailureReason> {
        if self.is_central() {
            self.central_dhkey_check(env)
        } else {
            self.peripheral_dhkey_check(env)
        }
    }

    /// `r` input of f6 for the check value sent with `oob` data
    fn check_r(&self, oob: Option<&OobData>) -> [u8; 16] {
        match self.method() {
            PairingMethod::PasskeyDisplay | PairingMethod::PasskeyInput => {
                passkey_r(self.keys.passkey)
            }
            PairingMethod::ScOob => oob.map(|data| data.r).unwrap_or([0; 16]),
            _ => [0; 16],
        }
    }

    fn central_dhkey_check(&mut self, env: &Env<'_>) -> Result<(), FailureReason> {
        self.pending.dhkey_send = false;
        let r = self.check_r(self.oob_remote.as_ref());
        let (a, b) = (self.initiator(), self.responder());

        let (mackey, ltk) = crypto::f5(&self.keys.dhkey, &self.keys.prnd, &self.keys.rrnd, &a, &b)
            .map_err(crypto_failed)?;
        self.keys.mackey = mackey;
        self.keys.tk = truncated(&ltk, self.enc_size);

        let e = crypto::f6(
            &self.keys.mackey,
            &self.keys.prnd,
            &self.keys.rrnd,
            &r,
            &io_cap(&self.preq),
            &a,
            &b,
        )
        .map_err(crypto_failed)?;

        self.expect_pdus(env, PduSet::PAIRING_DHKEY_CHECK);
        self.send(env, PairingDhKeyCheck::new(e).serialize());
        Ok(())
    }

    fn peripheral_dhkey_check(&mut self, env: &Env<'_>) -> Result<(), FailureReason> {
        self.pending.dhkey_send = false;
        let (a, b) = (self.initiator(), self.responder());

        let (mackey, ltk) = crypto::f5(&self.keys.dhkey, &self.keys.rrnd, &self.keys.prnd, &a, &b)
            .map_err(crypto_failed)?;
        self.keys.mackey = mackey;
        self.keys.tk = truncated(&ltk, self.enc_size);

        let r = self.check_r(self.oob_remote.as_ref());
        let e = crypto::f6(
            &self.keys.mackey,
            &self.keys.prnd,
            &self.keys.rrnd,
            &r,
            &io_cap(&self.prsp),
            &b,
            &a,
        )
        .map_err(crypto_failed)?;

        let r = self.check_r(self.oob_local.as_ref());
        let expected = crypto::f6(
            &self.keys.mackey,
            &self.keys.rrnd,
            &self.keys.prnd,
            &r,
            &io_cap(&self.preq),
            &a,
            &b,
        )
        .map_err(crypto_failed)?;

        if !constant_time_eq(&expected, &self.keys.e) {
            warn!(conn = self.conn, "DHKey check mismatch");
            return Err(FailureReason::DhKeyCheckFailed);
        }

        self.send(env, PairingDhKeyCheck::new(e).serialize());
        self.phase = Phase::EncryptionPending;
        Ok(())
    }

    fn on_dhkey_check(&mut self, env: &mut Env<'_>, check: [u8; 16]) -> Result<(), FailureReason> {
        if !self.is_central() {
            self.pending.dhcheck_wait = false;
            self.keys.e = check;

            if self.pending.dhkey || self.pending.user.is_some() {
                self.pending.dhkey_send = true;
                return Ok(());
            }

            return self.peripheral_dhkey_check(env);
        }

        let r = self.check_r(self.oob_local.as_ref());
        let (a, b) = (self.initiator(), self.responder());
        let expected = crypto::f6(
            &self.keys.mackey,
            &self.keys.rrnd,
            &self.keys.prnd,
            &r,
            &io_cap(&self.prsp),
            &b,
            &a,
        )
        .map_err(crypto_failed)?;

        if !constant_time_eq(&expected, &check) {
            warn!(conn = self.conn, "DHKey check mismatch");
            return Err(FailureReason::DhKeyCheckFailed);
        }

        self.start_pairing_encryption(env);
        Ok(())
    }

    fn on_keypress(&mut self, env: &mut Env<'_>, pdu: KeypressNotification) -> Result<(), FailureReason> {
        self.expected.insert(PduSet::KEYPRESS_NOTIFICATION);

        let Some(notification) = pdu.to_notification_type() else {
            warn!(conn = self.conn, value = pdu.notification_type, "unknown keypress type");
            return Err(FailureReason::InvalidParameters);
        };

        self.deadline = Some(env.now + env.config.timeout);
        self.emit(SmpEvent::KeypressReceived(self.conn, notification));
        Ok(())
    }

    // ---- encryption and key distribution ----

    /// The controller reported the outcome of an encryption request
    pub(crate) fn on_encryption_changed(&mut self, env: &mut Env<'_>, status: u8) {
        if self.phase == Phase::EncryptionPending {
            if status != 0 {
                let error = SecurityError::from_hci_status(status);
                warn!(conn = self.conn, status, %error, "encryption with new key failed");
                self.abort(error.failure_reason(), true);
                return;
            }

            if let Err(reason) = self.pairing_encrypted(env) {
                self.fail(reason);
            }
            return;
        }

        let Some(level) = self.reencrypt_level.take() else {
            debug!(conn = self.conn, status, "encryption change without request");
            return;
        };

        if status != 0 {
            let error = SecurityError::from_hci_status(status);
            warn!(conn = self.conn, status, %error, "encryption with stored key failed");
            self.emit(SmpEvent::SecurityChanged {
                conn: self.conn,
                level: self.link_level,
                error: Some(error),
            });
            if self.flags.security_request {
                self.reset();
            }
            return;
        }

        info!(conn = self.conn, %level, "link encrypted with stored key");
        self.link_level = level;
        self.emit(SmpEvent::SecurityChanged {
            conn: self.conn,
            level,
            error: None,
        });
        self.flags.security_request = false;
        self.expected = Self::default_expected(self.role);
    }

    fn pairing_encrypted(&mut self, env: &mut Env<'_>) -> Result<(), FailureReason> {
        self.update_keys();

        let level = self.reachable_level();
        info!(conn = self.conn, %level, "link encrypted");
        self.link_level = level;
        self.emit(SmpEvent::SecurityChanged {
            conn: self.conn,
            level,
            error: None,
        });

        if self.sc()
            && self.flags.bond
            && !self.flags.debug_key
            && self.local_dist.contains(KeyDist::LINK_KEY)
            && self.remote_dist.contains(KeyDist::LINK_KEY)
        {
            let link_key =
                crypto::link_key_from_ltk(&self.keys.tk, self.flags.ct2).map_err(crypto_failed)?;
            self.new_keys_mut().link_key = Some(link_key);
        }
        self.local_dist.remove(KeyDist::LINK_KEY);
        self.remote_dist.remove(KeyDist::LINK_KEY);

        self.phase = Phase::KeyDistribution;
        self.arm_next_remote_key(env);

        // The central receives first
        if self.is_central() && !self.remote_dist.is_empty() {
            return Ok(());
        }

        self.distribute_keys(env)?;
        self.check_complete(env)
    }

    /// Record what the pairing produced, ahead of key distribution
    fn update_keys(&mut self) {
        let method = self.method();
        let sc = self.sc();
        let bond = self.flags.bond;
        let debug_key = self.flags.debug_key;
        let enc_size = self.enc_size;
        let ltk = self.keys.tk;
        let identity = self.identity;

        let keys = self.new_keys.get_or_insert_with(|| KeySet::new(identity));
        keys.enc_size = enc_size;
        keys.flags.set(KeyFlags::AUTHENTICATED, method.is_authenticated());
        keys.flags.set(KeyFlags::SECURE_CONNECTIONS, sc);
        keys.flags.set(KeyFlags::DEBUG, debug_key);
        keys.flags.set(
            KeyFlags::OOB,
            matches!(method, PairingMethod::LegacyOob | PairingMethod::ScOob),
        );

        if sc && bond {
            keys.ltk = Some(LongTermKey::secure_connections(ltk));
        }
    }

    fn new_keys_mut(&mut self) -> &mut KeySet {
        let identity = self.identity;
        self.new_keys.get_or_insert_with(|| KeySet::new(identity))
    }

    /// Accept the first key PDU of the next key type the peer owes us
    fn arm_next_remote_key(&mut self, env: &Env<'_>) {
        if self.expected.intersects(REMOTE_KEY_PDUS) {
            return;
        }

        if self.remote_dist.contains(KeyDist::ENC_KEY) {
            self.expect_pdus(env, PduSet::ENCRYPTION_INFORMATION);
        } else if self.remote_dist.contains(KeyDist::ID_KEY) {
            self.expect_pdus(env, PduSet::IDENTITY_INFORMATION);
        } else if self.remote_dist.contains(KeyDist::SIGN_KEY) {
            self.expect_pdus(env, PduSet::SIGNING_INFORMATION);
        }
    }

    fn distribute_keys(&mut self, env: &mut Env<'_>) -> Result<(), FailureReason> {
        let bond = self.flags.bond;

        if !self.sc() && self.local_dist.contains(KeyDist::ENC_KEY) {
            let key = truncated(&random_16(env.rng), self.enc_size);
            let mut rand = [0u8; 8];
            env.rng.fill_bytes(&mut rand);
            let ediv = (env.rng.next_u32() & 0xFFFF) as u16;

            debug!(conn = self.conn, "distributing LTK");
            self.send(env, EncryptionInformation::new(key).serialize());
            self.send(env, CentralIdentification::new(ediv, rand).serialize());

            if bond {
                self.new_keys_mut().local_ltk = Some(LongTermKey::new(key, ediv, rand));
            }
            self.local_dist.remove(KeyDist::ENC_KEY);
        }

        if self.local_dist.contains(KeyDist::ID_KEY) {
            let irk = crypto::irk_from_identity_root(&env.config.identity_root)
                .map_err(crypto_failed)?;
            let identity = env.config.identity_address.unwrap_or(self.local);
            if !identity.is_identity() {
                warn!(conn = self.conn, %identity, "no identity address to distribute");
                return Err(FailureReason::UnspecifiedReason);
            }

            debug!(conn = self.conn, %identity, "distributing identity");
            self.send(env, IdentityInformation::new(irk).serialize());
            self.send(env, IdentityAddressInformation::new(&identity).serialize());
            self.local_dist.remove(KeyDist::ID_KEY);
        }

        if self.local_dist.contains(KeyDist::SIGN_KEY) {
            let csrk = random_16(env.rng);

            debug!(conn = self.conn, "distributing CSRK");
            self.send(env, SigningInformation::new(csrk).serialize());

            if bond {
                self.new_keys_mut().local_csrk = Some(SigningKey::new(csrk));
            }
            self.local_dist.remove(KeyDist::SIGN_KEY);
        }

        Ok(())
    }

    fn check_complete(&mut self, env: &Env<'_>) -> Result<(), FailureReason> {
        if self.local_dist.is_empty() && self.remote_dist.is_empty() {
            self.complete(env)?;
        }
        Ok(())
    }

    /// Progress after a remote key was received
    fn remote_key_done(&mut self, env: &mut Env<'_>) -> Result<(), FailureReason> {
        self.arm_next_remote_key(env);

        // Early keys wait for the encryption change
        if self.phase != Phase::KeyDistribution {
            return Ok(());
        }

        if self.is_central() && self.remote_dist.is_empty() {
            self.distribute_keys(env)?;
        }

        self.check_complete(env)
    }

    fn on_encryption_information(&mut self, env: &Env<'_>, ltk: [u8; 16]) -> Result<(), FailureReason> {
        if self.flags.bond {
            self.new_keys_mut().ltk = Some(LongTermKey::new(ltk, 0, [0; 8]));
        }
        self.expect_pdus(env, PduSet::CENTRAL_IDENTIFICATION);
        Ok(())
    }

    fn on_central_identification(
        &mut self,
        env: &mut Env<'_>,
        pdu: CentralIdentification,
    ) -> Result<(), FailureReason> {
        if self.flags.bond {
            if let Some(ltk) = self.new_keys_mut().ltk.as_mut() {
                ltk.ediv = pdu.ediv;
                ltk.rand = pdu.rand;
            }
        }

        self.remote_dist.remove(KeyDist::ENC_KEY);
        self.remote_key_done(env)
    }

    fn on_identity_information(&mut self, env: &Env<'_>, irk: [u8; 16]) -> Result<(), FailureReason> {
        if self.flags.bond {
            self.new_keys_mut().irk = Some(irk);
        }
        self.expect_pdus(env, PduSet::IDENTITY_ADDRESS_INFORMATION);
        Ok(())
    }

    fn on_identity_address(
        &mut self,
        env: &mut Env<'_>,
        pdu: IdentityAddressInformation,
    ) -> Result<(), FailureReason> {
        self.remote_dist.remove(KeyDist::ID_KEY);

        let identity = match pdu.address() {
            Some(address) if address.is_identity() => address,
            _ => {
                warn!(conn = self.conn, addr_type = pdu.addr_type, "invalid identity address");
                return Err(FailureReason::InvalidParameters);
            }
        };

        if identity != self.identity {
            if let Some(existing) = self.load_bond(env, &identity) {
                if !self.may_replace(env, &existing) {
                    warn!(conn = self.conn, %identity, "identity already bonded with stronger keys");
                    return Err(FailureReason::UnspecifiedReason);
                }
            }

            if self.load_bond(env, &self.identity).is_some() {
                self.replaced.push(self.identity);
            }
        }

        if self.flags.bond {
            if self.remote.is_resolvable_private() && identity != self.identity {
                info!(conn = self.conn, address = %self.remote, %identity, "identity resolved");
                self.emit(SmpEvent::IdentityResolved {
                    conn: self.conn,
                    address: self.remote,
                    identity,
                });
            }
            self.identity = identity;
            self.new_keys_mut().address = identity;
        }

        self.remote_key_done(env)
    }

    fn on_signing_information(&mut self, env: &mut Env<'_>, csrk: [u8; 16]) -> Result<(), FailureReason> {
        if self.flags.bond {
            self.new_keys_mut().remote_csrk = Some(SigningKey::new(csrk));
        }

        self.remote_dist.remove(KeyDist::SIGN_KEY);
        self.remote_key_done(env)
    }

    fn complete(&mut self, env: &Env<'_>) -> Result<(), FailureReason> {
        let Some(keys) = self.new_keys.take() else {
            warn!(conn = self.conn, "pairing finished without keys");
            return Err(FailureReason::UnspecifiedReason);
        };

        let bonded = self.flags.bond;
        if bonded {
            self.store_bond(env, &keys)?;
        }
        info!(conn = self.conn, method = %self.method(), bonded, "pairing complete");

        self.link_keys = Some(keys);
        self.emit(SmpEvent::PairingComplete {
            conn: self.conn,
            bonded,
        });

        self.reset();
        self.phase = Phase::Complete;
        Ok(())
    }

    /// Persist the new bond. Bonds it supersedes go only once it is saved.
    fn store_bond(&mut self, env: &Env<'_>, keys: &KeySet) -> Result<(), FailureReason> {
        debug!(conn = self.conn, address = %keys.address, "storing bond");
        if let Err(e) = env.store.save_keys(&keys.address, keys) {
            warn!(conn = self.conn, address = %keys.address, "failed to store keys: {}", e);
            return Err(FailureReason::UnspecifiedReason);
        }

        for address in std::mem::take(&mut self.replaced) {
            debug!(conn = self.conn, %address, "removing superseded bond");
            if let Err(e) = env.store.delete_keys(&address) {
                warn!(conn = self.conn, %address, "failed to delete keys: {}", e);
            }
        }
        Ok(())
    }

    /// The peer encrypts the link as central and asks for our key
    pub(crate) fn long_term_key_request(
        &mut self,
        env: &Env<'_>,
        rand: [u8; 8],
        ediv: u16,
    ) -> Option<[u8; 16]> {
        let zero = ediv == 0 && rand == [0; 8];

        if zero && self.phase == Phase::EncryptionPending {
            return Some(self.keys.tk);
        }

        if let Some(keys) = self.existing_keys(env) {
            let key = if zero && keys.is_secure_connections() {
                keys.ltk.as_ref()
            } else {
                keys.local_ltk.as_ref().filter(|ltk| ltk.matches(ediv, &rand))
            };

            if let Some(ltk) = key {
                debug!(conn = self.conn, "answering LTK request with stored key");
                self.reencrypt_level = Some(keys.security_level());
                return Some(truncated(&ltk.key, keys.enc_size));
            }
        }

        warn!(conn = self.conn, ediv, "no LTK for request");
        if self.phase.is_pairing() {
            self.abort(FailureReason::UnspecifiedReason, true);
            return None;
        }

        if self.flags.security_request {
            self.emit(SmpEvent::SecurityChanged {
                conn: self.conn,
                level: self.link_level,
                error: Some(SecurityError::PinOrKeyMissing),
            });
        }
        self.reset();
        None
    }

    /// The controller refused to start encryption
    pub(crate) fn encryption_not_started(&mut self) {
        if self.phase == Phase::EncryptionPending {
            self.fail(FailureReason::UnspecifiedReason);
        } else if self.reencrypt_level.take().is_some() {
            self.emit(SmpEvent::SecurityChanged {
                conn: self.conn,
                level: self.link_level,
                error: Some(SecurityError::Unspecified),
            });
        }
    }

    /// The transport dropped one of our PDUs. The peer never hears about
    /// the failure.
    pub(crate) fn send_failed(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }

        warn!(conn = self.conn, phase = %self.phase, "SMP PDU lost, abandoning procedure");
        self.abort(FailureReason::UnspecifiedReason, true);
        true
    }

    // ---- local procedures ----

    pub(crate) fn start_security(&mut self, env: &mut Env<'_>) -> SmpResult<()> {
        if self.flags.timed_out {
            return Err(SmpError::Timeout);
        }

        if self.phase.is_pairing() || self.reencrypt_level.is_some() {
            return Err(SmpError::Busy);
        }

        let required = env.config.effective_required_security();
        let existing = self.existing_keys(env);

        if self.is_central() {
            if let Some(keys) = existing.as_ref().filter(|keys| keys.satisfies(required)) {
                if let Some(ltk) = keys.ltk.as_ref() {
                    debug!(conn = self.conn, "encrypting with stored LTK");
                    self.encrypt_with(ltk, keys.enc_size, keys.security_level());
                    return Ok(());
                }
            }

            if !method::level_reachable(env.config, required) {
                return Err(SmpError::InvalidParameter(format!(
                    "{} not reachable with the local configuration",
                    required
                )));
            }

            self.send_pairing_request(env);
            return Ok(());
        }

        let keys_ok = existing.is_some_and(|keys| keys.satisfies(required));
        if !keys_ok && !method::level_reachable(env.config, required) {
            return Err(SmpError::InvalidParameter(format!(
                "{} not reachable with the local configuration",
                required
            )));
        }

        self.begin_attempt();
        let auth = method::default_auth_req(env.config);
        debug!(conn = self.conn, ?auth, "sending Security Request");
        self.send_untimed(SecurityRequest::new(auth).serialize());
        self.flags.security_request = true;
        self.expected.insert(PduSet::PAIRING_REQUEST);
        Ok(())
    }

    pub(crate) fn on_timeout(&mut self) {
        warn!(conn = self.conn, phase = %self.phase, "SMP timeout");
        let report = self.is_active();
        self.abort(FailureReason::UnspecifiedReason, report);
        self.flags.timed_out = true;
    }

    pub(crate) fn on_disconnected(&mut self) {
        if self.is_active() {
            self.abort(FailureReason::UnspecifiedReason, true);
        }
    }

    // ---- user input ----

    fn take_user(&mut self, wait: UserWait) -> SmpResult<()> {
        if self.pending.user != Some(wait) {
            return Err(SmpError::InvalidState);
        }
        self.pending.user = None;
        Ok(())
    }

    pub(crate) fn passkey_entry(&mut self, env: &mut Env<'_>, passkey: u32) -> SmpResult<()> {
        if passkey > SMP_PASSKEY_MAX {
            return Err(SmpError::InvalidParameter(format!(
                "passkey {} has more than six digits",
                passkey
            )));
        }
        self.take_user(UserWait::Passkey)?;

        if !self.sc() {
            self.keys.tk = passkey_r(passkey);
            self.legacy_user_tk_entry(env);
            return Ok(());
        }

        self.keys.passkey = passkey;
        self.keys.passkey_round = 0;

        if self.is_central() {
            self.expect_pdus(env, PduSet::PAIRING_CONFIRM);
            if self.sc_send_confirm(env).is_err() {
                self.fail(FailureReason::PasskeyEntryFailed);
            }
            return Ok(());
        }

        if self.pending.confirm_delayed {
            self.expect_pdus(env, PduSet::PAIRING_RANDOM);
            if self.sc_send_confirm(env).is_err() {
                self.fail(FailureReason::PasskeyEntryFailed);
            }
        }

        Ok(())
    }

    pub(crate) fn passkey_confirm(&mut self, env: &mut Env<'_>) -> SmpResult<()> {
        self.take_user(UserWait::NumericComparison)?;

        if self.pending.dhkey || self.pending.dhcheck_wait {
            self.pending.dhkey_send = true;
            return Ok(());
        }

        if self.pending.dhkey_send {
            if let Err(reason) = self.send_dhkey_check(env) {
                self.fail(reason);
            }
        }

        Ok(())
    }

    pub(crate) fn pairing_confirm(&mut self, env: &mut Env<'_>) -> SmpResult<()> {
        self.take_user(UserWait::Consent)?;

        let result = match (self.role, self.sc()) {
            (Role::Central, false) => {
                self.expect_pdus(env, PduSet::PAIRING_CONFIRM);
                self.legacy_send_confirm(env)
            }
            (Role::Central, true) => {
                self.central_send_public_key(env);
                Ok(())
            }
            (Role::Peripheral, false) => {
                self.expect_pdus(env, PduSet::PAIRING_CONFIRM | PduSet::KEYPRESS_NOTIFICATION);
                self.send_pairing_response(env);
                Ok(())
            }
            (Role::Peripheral, true) => {
                self.expect_pdus(env, PduSet::PAIRING_PUBLIC_KEY);
                self.send_pairing_response(env);
                Ok(())
            }
        };

        if let Err(reason) = result {
            self.fail(reason);
        }
        Ok(())
    }

    pub(crate) fn auth_cancel(&mut self) -> SmpResult<()> {
        let waiting = self.pending.user.take().is_some();
        if !waiting && !std::mem::take(&mut self.pending.display) {
            return Err(SmpError::InvalidState);
        }

        let reason = match self.method() {
            PairingMethod::PasskeyDisplay | PairingMethod::PasskeyInput => {
                FailureReason::PasskeyEntryFailed
            }
            PairingMethod::PasskeyConfirm => FailureReason::NumericComparisonFailed,
            PairingMethod::LegacyOob | PairingMethod::ScOob => FailureReason::OobNotAvailable,
            PairingMethod::JustWorks => FailureReason::UnspecifiedReason,
        };

        info!(conn = self.conn, %reason, "pairing cancelled by user");
        self.fail(reason);
        Ok(())
    }

    pub(crate) fn oob_set_tk(&mut self, env: &mut Env<'_>, tk: [u8; 16]) -> SmpResult<()> {
        self.take_user(UserWait::LegacyOobTk)?;
        self.keys.tk = tk;
        self.legacy_user_tk_entry(env);
        Ok(())
    }

    pub(crate) fn oob_set_sc_data(
        &mut self,
        env: &mut Env<'_>,
        local: Option<OobData>,
        remote: Option<OobData>,
    ) -> SmpResult<()> {
        if !self.pending.oob {
            return Err(SmpError::InvalidState);
        }

        let req_oob = self.preq[2] & SMP_OOB_PRESENT != 0;
        let rsp_oob = self.prsp[2] & SMP_OOB_PRESENT != 0;

        let (for_local, for_remote) = match self.role {
            Role::Central => (rsp_oob, req_oob),
            Role::Peripheral => (req_oob, rsp_oob),
        };
        if for_remote != remote.is_some() && for_local != local.is_some() {
            return Err(SmpError::InvalidParameter(
                "OOB data does not match the exchanged OOB flags".to_string(),
            ));
        }

        self.pending.oob = false;

        self.oob_local = local;
        self.oob_remote = remote;

        if let Some(remote) = remote {
            let Some(key) = self.remote_pk else {
                self.fail(FailureReason::UnspecifiedReason);
                return Ok(());
            };

            match crypto::f4(&key.x, &key.x, &remote.r, 0) {
                Ok(c) if constant_time_eq(&c, &remote.c) => {}
                Ok(_) => {
                    warn!(conn = self.conn, "OOB confirm value mismatch");
                    self.fail(FailureReason::ConfirmValueFailed);
                    return Ok(());
                }
                Err(e) => {
                    self.fail(crypto_failed(e));
                    return Ok(());
                }
            }
        }

        if self.is_central() {
            self.expect_pdus(env, PduSet::PAIRING_RANDOM);
        } else {
            self.expect_pdus(env, PduSet::PAIRING_DHKEY_CHECK);
            self.pending.dhcheck_wait = true;
        }

        let random = self.keys.prnd;
        self.send(env, PairingRandom::new(random).serialize());
        Ok(())
    }

    pub(crate) fn send_keypress(
        &mut self,
        env: &Env<'_>,
        notification: KeypressNotificationType,
    ) -> SmpResult<()> {
        if self.method != Some(PairingMethod::PasskeyInput)
            || self.pending.user != Some(UserWait::Passkey)
        {
            return Err(SmpError::InvalidState);
        }

        self.send(env, KeypressNotification::new(notification).serialize());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Duration;

    fn session(role: Role) -> PairingSession {
        let local = LeAddress::public([0x01, 0x02, 0x03, 0x04, 0x05, 0xC1]);
        let remote = LeAddress::public([0x11, 0x12, 0x13, 0x14, 0x15, 0xC2]);
        PairingSession::new(0x0040, role, local, remote, remote)
    }

    #[test]
    fn test_truncated_zeroes_tail() {
        let key = [0xFF; 16];
        let short = truncated(&key, 7);
        assert_eq!(&short[..7], &[0xFF; 7]);
        assert_eq!(&short[7..], &[0; 9]);
        assert_eq!(truncated(&key, 16), key);
    }

    #[test]
    fn test_passkey_r_is_little_endian() {
        let r = passkey_r(123456);
        assert_eq!(&r[..4], &[0x40, 0xE2, 0x01, 0x00]);
        assert!(r[4..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_default_expected_by_role() {
        assert_eq!(
            PairingSession::default_expected(Role::Central),
            PduSet::SECURITY_REQUEST
        );
        assert_eq!(
            PairingSession::default_expected(Role::Peripheral),
            PduSet::PAIRING_REQUEST
        );
    }

    #[test]
    fn test_phase_pairing_classes() {
        assert!(!Phase::Idle.is_pairing());
        assert!(Phase::EncryptionPending.is_pairing());
        assert!(!Phase::Complete.is_pairing());
        assert_eq!(Phase::KeyDistribution.to_string(), "key distribution");
    }

    #[test]
    fn test_generated_passkeys_stay_six_digits() {
        let config = SmpConfig::default();
        let store = MemoryKeyStore::new();
        let mut rng = StdRng::seed_from_u64(7);
        let mut env = Env {
            config: &config,
            rng: &mut rng,
            store: &store,
            local_key: None,
            now: Instant::now(),
        };

        let mut session = session(Role::Peripheral);
        for _ in 0..1000 {
            assert!(session.new_passkey(&mut env) <= SMP_PASSKEY_MAX);
        }

        let fixed = SmpConfig::default().with_fixed_passkey(123456);
        env.config = &fixed;
        assert_eq!(session.new_passkey(&mut env), 123456);
        assert_eq!(session.keys.passkey, 123456);
    }

    #[test]
    fn test_awaiting_a_pdu_restarts_timer() {
        let config = SmpConfig::default();
        let store = MemoryKeyStore::new();
        let mut rng = StdRng::seed_from_u64(1);
        let start = Instant::now();
        let mut env = Env {
            config: &config,
            rng: &mut rng,
            store: &store,
            local_key: None,
            now: start,
        };

        let mut session = session(Role::Central);
        assert!(session.deadline().is_none());

        session.expect_pdus(&env, PduSet::IDENTITY_INFORMATION);
        assert_eq!(session.deadline(), Some(start + config.timeout));
        assert!(session.expected.contains(PduSet::IDENTITY_INFORMATION));

        env.now = start + Duration::from_secs(10);
        session.expect_pdus(&env, PduSet::SIGNING_INFORMATION);
        assert_eq!(
            session.deadline(),
            Some(start + Duration::from_secs(10) + config.timeout)
        );
        assert!(session.take_actions().is_empty());
    }

    #[test]
    fn test_lost_pdu_outside_a_procedure_is_ignored() {
        let mut session = session(Role::Peripheral);
        assert!(!session.send_failed());
        assert_eq!(session.phase(), Phase::Idle);
        assert!(session.take_actions().is_empty());
    }
}
